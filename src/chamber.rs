use crate::capacitance::ChannelBounds;
use crate::scripted_link::ScriptedLink;
use crate::serial_link::{BoxedLink, LinkError, SerialLink};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ChamberError {
    #[error("No vacuum system numbered {0}")]
    UnknownChamber(String),

    #[error("Could not open {gauge} gauge on {port}: {source}")]
    Open {
        gauge: &'static str,
        port: String,
        #[source]
        source: LinkError,
    },
}

/// Which vacuum system the gauges belong to.
///
/// Each profile fixes the serial ports of both gauges and the capacitance
/// manometer's channel bounds. `Test` replays canned replies instead of
/// touching hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChamberProfile {
    One,
    Two,
    Test,
}

impl ChamberProfile {
    pub fn from_id(id: i32) -> Result<Self, ChamberError> {
        match id {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            -1 => Ok(Self::Test),
            other => Err(ChamberError::UnknownChamber(other.to_string())),
        }
    }

    pub fn id(&self) -> i32 {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Test => -1,
        }
    }

    pub fn is_test(&self) -> bool {
        *self == Self::Test
    }

    pub fn pirani_port(&self) -> Option<&'static str> {
        match self {
            Self::One => Some("/dev/ttyUSB0"),
            Self::Two => Some("/dev/ttyUSB2"),
            Self::Test => None,
        }
    }

    pub fn capacitance_port(&self) -> Option<&'static str> {
        match self {
            Self::One => Some("/dev/ttyUSB1"),
            Self::Two => Some("/dev/ttyUSB3"),
            Self::Test => None,
        }
    }

    pub fn bounds(&self) -> ChannelBounds {
        match self {
            Self::One | Self::Test => ChannelBounds::default(),
            Self::Two => ChannelBounds::new([1000.0, 0.02], [0.1, 4e-7]),
        }
    }

    /// Open the Pirani and capacitance links, in that order.
    ///
    /// `overrides` replaces the profile's port paths; it is ignored for the
    /// test profile.
    pub fn open_links(
        &self,
        overrides: (Option<&str>, Option<&str>),
    ) -> Result<(BoxedLink, BoxedLink), ChamberError> {
        if self.is_test() {
            log::info!("Test chamber: using scripted gauge links");
            let pirani: BoxedLink = Box::new(ScriptedLink::mock_pirani());
            let capacitance: BoxedLink = Box::new(ScriptedLink::mock_capacitance());
            return Ok((pirani, capacitance));
        }

        let pirani_port = overrides.0.or(self.pirani_port()).unwrap_or_default();
        let capacitance_port = overrides.1.or(self.capacitance_port()).unwrap_or_default();

        let pirani = open_port("Pirani", pirani_port)?;
        let capacitance = match open_port("capacitance", capacitance_port) {
            Ok(link) => link,
            Err(e) => {
                let mut pirani = pirani;
                if let Err(close_err) = pirani.close() {
                    log::warn!("Failed to close {}: {}", pirani.name(), close_err);
                }
                return Err(e);
            }
        };
        Ok((pirani, capacitance))
    }
}

fn open_port(gauge: &'static str, port: &str) -> Result<BoxedLink, ChamberError> {
    log::debug!("Connecting to {} gauge on port {}", gauge, port);
    SerialLink::open(port)
        .map(|link| Box::new(link) as BoxedLink)
        .map_err(|source| ChamberError::Open {
            gauge,
            port: port.to_string(),
            source,
        })
}

impl FromStr for ChamberProfile {
    type Err = ChamberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i32>()
            .map_err(|_| ChamberError::UnknownChamber(s.to_string()))
            .and_then(Self::from_id)
    }
}

impl fmt::Display for ChamberProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}
