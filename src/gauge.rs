use crate::frame_reader::FrameError;
use crate::serial_link::{GaugeLink, LinkError};

#[derive(Debug, thiserror::Error)]
pub enum GaugeError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Bad ack: '{ack}'")]
    BadAck { ack: String },

    #[error("Malformed response '{response}': {reason}")]
    Malformed { response: String, reason: String },

    #[error("Could not parse '{value}' as a number")]
    InvalidNumber { value: String },
}

impl GaugeError {
    /// True when the device answered but the answer could not be decoded.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. } | Self::InvalidNumber { .. })
    }

    /// True when the exchange was abandoned because of a shutdown request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Frame(FrameError::Cancelled { .. }))
    }

    pub(crate) fn malformed(response: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            response: response.to_string(),
            reason: reason.into(),
        }
    }
}

/// Common surface of the gauge drivers.
pub trait PressureGauge {
    type Reading;

    /// Ask the gauge which pressure unit it reports in.
    fn units(&mut self) -> Result<String, GaugeError>;

    /// Take one pressure reading.
    fn pressure(&mut self) -> Result<Self::Reading, GaugeError>;

    /// Discard anything waiting in the receive buffer, returning how many bytes were dropped.
    fn flush(&mut self) -> Result<usize, GaugeError>;

    fn close(&mut self) -> Result<(), GaugeError>;
}

pub(crate) fn parse_number(value: &str) -> Result<f64, GaugeError> {
    value
        .trim()
        .parse()
        .map_err(|_| GaugeError::InvalidNumber {
            value: value.to_string(),
        })
}

pub(crate) fn drain<L: GaugeLink + ?Sized>(link: &mut L) -> Result<usize, LinkError> {
    let pending = link.bytes_available()?;
    if pending > 0 {
        let dropped = link.read(pending)?;
        log::debug!("[{}] flushed {} stale byte(s)", link.name(), dropped.len());
        return Ok(dropped.len());
    }
    Ok(0)
}
