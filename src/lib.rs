//! # Vacuum Gauges
//!
//! A Rust library for polling the pressure gauges of a laboratory vacuum system
//! over serial links.
//!
//! Two instruments are supported: a Pirani gauge speaking a fixed width
//! `@<addr><ACK|NAK><value>;FF` protocol, and a dual channel capacitance
//! manometer answering single letter commands with two whitespace separated
//! readings. A [`VacuumSession`] polls both at a fixed cadence and appends
//! timestamped samples to a record sink.
//!
//! ## Features
//!
//! - **Length framed polling**: replies without delimiters are assembled by
//!   watching the receive buffer, with a bounded and cancellable wait
//! - **Device quirks**: split negative numbers and `Off` channels on the
//!   capacitance manometer are decoded, readings below the detection floor clamped
//! - **Guaranteed cleanup**: links and the output file are released on every exit path
//! - **Hardware free testing**: scripted links replay canned replies
//!
//! ## Examples
//!
//! ### Reading a gauge
//!
//! ```rust
//! use vacuum_gauges::{FrameReader, Pirani, PollPolicy, PressureGauge, ScriptedLink};
//! use std::time::Duration;
//!
//! let reader = FrameReader::new(PollPolicy::new(Duration::from_millis(1), 100));
//! let mut pirani = Pirani::new(ScriptedLink::mock_pirani(), reader);
//!
//! assert_eq!(pirani.units()?, "TORR");
//! assert_eq!(pirani.pressure()?, 1e-5);
//! # Ok::<(), vacuum_gauges::GaugeError>(())
//! ```
//!
//! ### Decoding a capacitance manometer reply
//!
//! ```rust
//! use vacuum_gauges::capacitance::{decode_pressure, ChannelBounds};
//!
//! let bounds = ChannelBounds::new([1000.0, 1.0], [0.1, 1e-4]);
//! let reading = decode_pressure("Off - 0.5", &bounds)?;
//! assert_eq!(reading.as_array(), [1000.0, 1e-4]);
//! # Ok::<(), vacuum_gauges::GaugeError>(())
//! ```
//!
//! ### Running a session
//!
//! ```rust,no_run
//! use vacuum_gauges::{ChamberProfile, SessionConfig, VacuumSession};
//! use std::time::Duration;
//!
//! let config = SessionConfig::new(ChamberProfile::from_id(1)?)
//!     .measurement_interval(Duration::from_secs(9))
//!     .output_dir("/var/log/vacuum");
//! let session = VacuumSession::new(config);
//!
//! let cancel = session.cancel_token();
//! // hand `cancel` to a signal handler, then:
//! let summary = session.run()?;
//! println!("{} samples written", summary.samples_written);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cancel;
pub mod capacitance;
pub mod chamber;
pub mod frame_reader;
pub mod gauge;
pub mod pirani;
pub mod record;
pub mod scripted_link;
pub mod serial_link;
pub mod session;

// Re-export the main types for convenience
pub use cancel::CancelToken;

pub use serial_link::{BoxedLink, GaugeLink, LinkError, SerialLink};

pub use scripted_link::{LinkStats, ScriptedLink, ScriptedReply};

pub use frame_reader::{FrameError, FrameReader, PollPolicy};

pub use gauge::{GaugeError, PressureGauge};

pub use pirani::{Pirani, PiraniCommand, PiraniFrame};

pub use capacitance::{Capacitance, CapacitanceReading, ChannelBounds};

pub use chamber::{ChamberError, ChamberProfile};

pub use record::{MemorySink, RecordSink, Sample, TeeSink};

pub use session::{
    Clock, GaugeUnits, SessionConfig, SessionError, SessionState, SessionSummary, SystemClock,
    VacuumSession,
};
