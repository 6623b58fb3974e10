use crate::frame_reader::FrameReader;
use crate::gauge::{drain, parse_number, GaugeError, PressureGauge};
use crate::serial_link::GaugeLink;

const ACK: &str = "ACK";
const HEADER_LEN: usize = 7;
const TERMINATOR_LEN: usize = 3;

/// A query together with the width of the reply it provokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PiraniCommand {
    text: &'static str,
    reply_width: usize,
}

impl PiraniCommand {
    pub const UNITS: Self = Self {
        text: "@253U?;FF",
        reply_width: 14,
    };

    pub const PRESSURE: Self = Self {
        text: "@253PR1?;FF",
        reply_width: 17,
    };

    pub fn as_str(&self) -> &'static str {
        self.text
    }

    pub fn reply_width(&self) -> usize {
        self.reply_width
    }
}

/// The fields of one reply frame, laid out as
/// `[start][address(3)][ack(3)][value][terminator(3)]`, e.g. `@253ACK7.50E+2;FF`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiraniFrame {
    pub address: String,
    pub ack: String,
    pub value: String,
}

impl PiraniFrame {
    /// Split the first `width` bytes of `raw` into frame fields.
    ///
    /// The ack field is not checked here, see [`PiraniFrame::into_value`].
    pub fn parse(raw: &[u8], width: usize) -> Result<Self, GaugeError> {
        let text = String::from_utf8_lossy(raw);
        if raw.len() < width || width < HEADER_LEN + TERMINATOR_LEN {
            return Err(GaugeError::malformed(
                &text,
                format!("expected a {} byte frame, got {}", width, raw.len()),
            ));
        }

        let frame = std::str::from_utf8(&raw[..width])
            .map_err(|_| GaugeError::malformed(&text, "frame is not ASCII"))?;
        let field = |range: std::ops::Range<usize>| {
            frame
                .get(range)
                .map(str::to_string)
                .ok_or_else(|| GaugeError::malformed(frame, "frame is not ASCII"))
        };

        Ok(Self {
            address: field(1..4)?,
            ack: field(4..HEADER_LEN)?,
            value: field(HEADER_LEN..width - TERMINATOR_LEN)?,
        })
    }

    /// The trimmed value field, provided the device acknowledged the command.
    pub fn into_value(self) -> Result<String, GaugeError> {
        if self.ack != ACK {
            return Err(GaugeError::BadAck { ack: self.ack });
        }
        Ok(self.value.trim().to_string())
    }
}

pub struct Pirani<L> {
    link: L,
    reader: FrameReader,
}

impl<L: GaugeLink> Pirani<L> {
    pub fn new(link: L, reader: FrameReader) -> Self {
        Self { link, reader }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Run one command and return its acknowledged value field.
    pub fn query(&mut self, command: PiraniCommand) -> Result<String, GaugeError> {
        let raw = self
            .reader
            .request_fixed(&mut self.link, command.as_str(), command.reply_width())?;
        let frame = PiraniFrame::parse(&raw, command.reply_width())?;
        log::debug!(
            "[{}] address={} ack={} value={:?}",
            self.link.name(),
            frame.address,
            frame.ack,
            frame.value
        );
        frame.into_value()
    }
}

impl<L: GaugeLink> PressureGauge for Pirani<L> {
    type Reading = f64;

    fn units(&mut self) -> Result<String, GaugeError> {
        self.query(PiraniCommand::UNITS)
    }

    fn pressure(&mut self) -> Result<f64, GaugeError> {
        let value = self.query(PiraniCommand::PRESSURE)?;
        parse_number(&value)
    }

    fn flush(&mut self) -> Result<usize, GaugeError> {
        Ok(drain(&mut self.link)?)
    }

    fn close(&mut self) -> Result<(), GaugeError> {
        Ok(self.link.close()?)
    }
}
