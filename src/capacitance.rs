//! Dual channel capacitance manometer driver.
//!
//! The controller answers a pressure query with two whitespace separated
//! channel values, high range first. Two quirks need handling before the
//! values can be parsed:
//!
//! - a negative value is sent as a lone `-` token followed by the magnitude,
//!   so `-1.23` arrives as `- 1.23`.
//! - a channel that is out of range reads `Off`.

use crate::frame_reader::FrameReader;
use crate::gauge::{drain, parse_number, GaugeError, PressureGauge};
use crate::serial_link::GaugeLink;

pub const UNITS_COMMAND: &str = "u";
pub const PRESSURE_COMMAND: &str = "p";
pub const FULL_SCALE_COMMAND: &str = "f";

const OFF: &str = "Off";

/// Per-channel substitution and clamping thresholds, high range channel first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelBounds {
    /// Reported in place of a channel that reads `Off`.
    pub full_scale: [f64; 2],
    /// Floor below which a channel reading is clamped.
    pub min_scale: [f64; 2],
}

impl ChannelBounds {
    pub const fn new(full_scale: [f64; 2], min_scale: [f64; 2]) -> Self {
        Self {
            full_scale,
            min_scale,
        }
    }
}

impl Default for ChannelBounds {
    fn default() -> Self {
        Self::new([1000.0, 1.0], [1e-1, 1e-4])
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacitanceReading {
    pub high_range: f64,
    pub low_range: f64,
}

impl CapacitanceReading {
    pub fn as_array(&self) -> [f64; 2] {
        [self.high_range, self.low_range]
    }
}

/// Re-attach every lone `-` token to the token after it.
pub fn glue_minus(response: &str) -> String {
    let mut glued = String::with_capacity(response.len());
    for token in response.split_whitespace() {
        glued.push_str(token);
        if token != "-" {
            glued.push(' ');
        }
    }
    glued
}

/// Split a pressure reply into its two channel tokens.
pub fn channel_tokens(response: &str) -> Result<[String; 2], GaugeError> {
    let glued = glue_minus(response);
    let tokens: Vec<&str> = glued.split_whitespace().collect();
    match tokens.as_slice() {
        [high, low] => Ok([(*high).to_string(), (*low).to_string()]),
        _ => Err(GaugeError::malformed(
            response,
            format!("expected 2 channel values, found {}", tokens.len()),
        )),
    }
}

fn channel_value(token: &str, full_scale: f64, min_scale: f64) -> Result<f64, GaugeError> {
    let value = if token == OFF {
        full_scale
    } else {
        parse_number(token)?
    };
    Ok(if value < min_scale { min_scale } else { value })
}

/// Decode a pressure reply, applying the `Off` substitution and the min-scale clamp.
pub fn decode_pressure(
    response: &str,
    bounds: &ChannelBounds,
) -> Result<CapacitanceReading, GaugeError> {
    let [high, low] = channel_tokens(response)?;
    Ok(CapacitanceReading {
        high_range: channel_value(&high, bounds.full_scale[0], bounds.min_scale[0])?,
        low_range: channel_value(&low, bounds.full_scale[1], bounds.min_scale[1])?,
    })
}

pub struct Capacitance<L> {
    link: L,
    reader: FrameReader,
    bounds: ChannelBounds,
}

impl<L: GaugeLink> Capacitance<L> {
    pub fn new(link: L, reader: FrameReader) -> Self {
        Self::with_bounds(link, reader, ChannelBounds::default())
    }

    pub fn with_bounds(link: L, reader: FrameReader, bounds: ChannelBounds) -> Self {
        Self {
            link,
            reader,
            bounds,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn bounds(&self) -> ChannelBounds {
        self.bounds
    }

    /// Override the `Off` substitutes. Not validated.
    pub fn set_full_scale_manual(&mut self, full_scale: [f64; 2]) {
        self.bounds.full_scale = full_scale;
    }

    /// Override the clamping floors. Not validated.
    pub fn set_min_scale_manual(&mut self, min_scale: [f64; 2]) {
        self.bounds.min_scale = min_scale;
    }

    /// The controller's own full-scale report, as sent.
    pub fn full_scale(&mut self) -> Result<String, GaugeError> {
        Ok(self
            .reader
            .request_unframed(&mut self.link, FULL_SCALE_COMMAND)?)
    }
}

impl<L: GaugeLink> PressureGauge for Capacitance<L> {
    type Reading = CapacitanceReading;

    fn units(&mut self) -> Result<String, GaugeError> {
        Ok(self.reader.request_unframed(&mut self.link, UNITS_COMMAND)?)
    }

    fn pressure(&mut self) -> Result<CapacitanceReading, GaugeError> {
        let response = self
            .reader
            .request_unframed(&mut self.link, PRESSURE_COMMAND)?;
        let reading = decode_pressure(&response, &self.bounds)?;
        log::debug!("[{}] {:?} -> {:?}", self.link.name(), response, reading);
        Ok(reading)
    }

    fn flush(&mut self) -> Result<usize, GaugeError> {
        Ok(drain(&mut self.link)?)
    }

    fn close(&mut self) -> Result<(), GaugeError> {
        Ok(self.link.close()?)
    }
}
