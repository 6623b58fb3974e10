use crate::cancel::CancelToken;
use crate::capacitance::{Capacitance, CapacitanceReading};
use crate::chamber::{ChamberError, ChamberProfile};
use crate::frame_reader::{FrameReader, PollPolicy};
use crate::gauge::{GaugeError, PressureGauge};
use crate::pirani::Pirani;
use crate::record::{self, BoxedSink, RecordSink, Sample, TeeSink};
use crate::serial_link::BoxedLink;
use chrono::{DateTime, Local, Timelike};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MEASUREMENT_INTERVAL: Duration = Duration::from_secs(9);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Chamber configuration error: {0}")]
    Chamber(#[from] ChamberError),

    #[error("Gauge error: {0}")]
    Gauge(#[from] GaugeError),

    #[error("Output error: {0}")]
    Sink(#[from] std::io::Error),

    #[error("Session is {state:?}, cannot {action}")]
    InvalidState {
        state: SessionState,
        action: &'static str,
    },
}

impl SessionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Gauge(e) if e.is_cancelled())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Connecting,
    Ready,
    Sampling,
    Closing,
    Closed,
}

/// Source of wall clock time for timestamps.
pub trait Clock: Send {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub profile: ChamberProfile,
    /// Pause between two samples.
    pub measurement_interval: Duration,
    pub poll_policy: PollPolicy,
    /// Log and skip a sample whose reply cannot be decoded instead of stopping.
    pub skip_malformed: bool,
    /// Stop after this many samples.
    pub max_samples: Option<u64>,
    pub output_dir: PathBuf,
    pub pirani_port: Option<String>,
    pub capacitance_port: Option<String>,
}

impl SessionConfig {
    pub fn new(profile: ChamberProfile) -> Self {
        Self {
            profile,
            measurement_interval: DEFAULT_MEASUREMENT_INTERVAL,
            poll_policy: PollPolicy::default(),
            skip_malformed: false,
            max_samples: None,
            output_dir: PathBuf::from("."),
            pirani_port: None,
            capacitance_port: None,
        }
    }

    pub fn measurement_interval(mut self, interval: Duration) -> Self {
        self.measurement_interval = interval;
        self
    }

    pub fn poll_policy(mut self, policy: PollPolicy) -> Self {
        self.poll_policy = policy;
        self
    }

    pub fn skip_malformed(mut self, skip: bool) -> Self {
        self.skip_malformed = skip;
        self
    }

    pub fn max_samples(mut self, count: Option<u64>) -> Self {
        self.max_samples = count;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn ports(mut self, pirani: Option<String>, capacitance: Option<String>) -> Self {
        self.pirani_port = pirani;
        self.capacitance_port = capacitance;
        self
    }
}

/// Units reported by the gauges at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GaugeUnits {
    pub pirani: String,
    pub capacitance: String,
}

/// What a finished run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub samples_written: u64,
    pub samples_skipped: u64,
    pub cancelled: bool,
}

/// Polls one Pirani gauge and one capacitance manometer and owns both links,
/// the record sink and the cancellation token.
///
/// `Uninitialized -> Connecting -> Ready -> Sampling -> Closing -> Closed`.
/// `close` also runs from `Drop`.
pub struct VacuumSession {
    config: SessionConfig,
    state: SessionState,
    cancel: CancelToken,
    clock: Box<dyn Clock>,
    links: Option<(BoxedLink, BoxedLink)>,
    pirani: Option<Pirani<BoxedLink>>,
    capacitance: Option<Capacitance<BoxedLink>>,
    sink: Option<BoxedSink>,
    units: Option<GaugeUnits>,
    started_at: Option<DateTime<Local>>,
    samples_written: u64,
    samples_skipped: u64,
}

impl VacuumSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Uninitialized,
            cancel: CancelToken::new(),
            clock: Box::new(SystemClock),
            links: None,
            pirani: None,
            capacitance: None,
            sink: None,
            units: None,
            started_at: None,
            samples_written: 0,
            samples_skipped: 0,
        }
    }

    /// Use already opened links instead of the profile's ports.
    pub fn with_links(mut self, pirani: BoxedLink, capacitance: BoxedLink) -> Self {
        self.links = Some((pirani, capacitance));
        self
    }

    /// Append records to `sink` instead of a new file in the output directory.
    pub fn with_sink(mut self, sink: BoxedSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn units(&self) -> Option<&GaugeUnits> {
        self.units.as_ref()
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.started_at
    }

    /// Open links and sink, write the header, and query both gauges' units.
    ///
    /// On failure the session is closed and cannot be reused.
    pub fn connect(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Uninitialized {
            return Err(SessionError::InvalidState {
                state: self.state,
                action: "connect",
            });
        }

        self.state = SessionState::Connecting;
        log::info!("Connecting to gauges of chamber {}", self.config.profile);

        let result = self.try_connect();
        match result {
            Ok(()) => {
                self.state = SessionState::Ready;
                log::info!("Session ready");
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    fn try_connect(&mut self) -> Result<(), SessionError> {
        let (pirani_link, capacitance_link) = match self.links.take() {
            Some(links) => links,
            None => self.config.profile.open_links((
                self.config.pirani_port.as_deref(),
                self.config.capacitance_port.as_deref(),
            ))?,
        };

        let reader = FrameReader::new(self.config.poll_policy).with_cancel(self.cancel.clone());
        let mut capacitance = Capacitance::new(capacitance_link, reader.clone());
        let bounds = self.config.profile.bounds();
        capacitance.set_full_scale_manual(bounds.full_scale);
        capacitance.set_min_scale_manual(bounds.min_scale);

        // Stored before the first exchange so `close` releases them if it fails.
        self.pirani = Some(Pirani::new(pirani_link, reader));
        self.capacitance = Some(capacitance);
        self.pirani_mut()?.flush()?;
        self.capacitance_mut()?.flush()?;

        if self.sink.is_none() {
            let sink: BoxedSink =
                Box::new(TeeSink::create_in(&self.config.output_dir, &self.clock.now())?);
            self.sink = Some(sink);
        }

        let opened = record::opened_line(self.sink_mut()?.name());
        if self.config.profile.is_test() {
            self.append(record::TEST_MODE_BANNER)?;
        }
        self.append(&opened)?;
        self.append(record::FORMAT_VERSION_LINE)?;
        self.append(record::COLUMNS_LINE)?;

        let units = GaugeUnits {
            pirani: self.pirani_mut()?.units()?,
            capacitance: self.capacitance_mut()?.units()?,
        };
        self.append(&record::units_line(&units.pirani, &units.capacitance))?;
        log::info!(
            "Gauge units: Pirani {}, capacitance {}",
            units.pirani,
            units.capacitance
        );

        self.units = Some(units);
        self.started_at = Some(truncate_to_second(self.clock.now()));
        Ok(())
    }

    /// Read both gauges once and append the sample.
    ///
    /// Returns `None` if the sample was skipped because a reply could not be
    /// decoded and `skip_malformed` is set.
    pub fn sample_once(&mut self) -> Result<Option<Sample>, SessionError> {
        if !matches!(self.state, SessionState::Ready | SessionState::Sampling) {
            return Err(SessionError::InvalidState {
                state: self.state,
                action: "sample",
            });
        }
        self.state = SessionState::Sampling;

        let span = tracing::debug_span!("sample", index = self.samples_written + 1);
        let _entered = span.enter();

        let readings = self.read_gauges();
        let (pirani, capacitance) = match readings {
            Ok(readings) => readings,
            Err(SessionError::Gauge(e)) if e.is_malformed() && self.config.skip_malformed => {
                log::warn!("Skipping sample: {}", e);
                self.samples_skipped += 1;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let timestamp = self.clock.now();
        let started_at = self.started_at.ok_or(SessionError::InvalidState {
            state: self.state,
            action: "timestamp a sample before connecting",
        })?;
        let sample = Sample {
            timestamp,
            elapsed_seconds: elapsed_seconds(started_at, timestamp),
            pirani,
            capacitance,
        };

        self.append(&sample.to_record_line())?;
        self.samples_written += 1;
        Ok(Some(sample))
    }

    fn read_gauges(&mut self) -> Result<(f64, CapacitanceReading), SessionError> {
        let pirani = self.pirani_mut()?.pressure()?;
        let capacitance = self.capacitance_mut()?.pressure()?;
        Ok((pirani, capacitance))
    }

    /// Connect, sample until cancelled or an error occurs, then close.
    pub fn run(mut self) -> Result<SessionSummary, SessionError> {
        let result = self.connect().and_then(|()| self.sample_loop());
        let cancelled = match result {
            Ok(()) => self.cancel.is_cancelled(),
            Err(e) if e.is_cancelled() => true,
            Err(e) => {
                log::error!("Session stopped: {}", e);
                self.close();
                return Err(e);
            }
        };
        self.close();

        Ok(SessionSummary {
            samples_written: self.samples_written,
            samples_skipped: self.samples_skipped,
            cancelled,
        })
    }

    fn sample_loop(&mut self) -> Result<(), SessionError> {
        loop {
            if self.cancel.is_cancelled() {
                log::info!("Cancellation requested, stopping");
                return Ok(());
            }
            if self.sample_limit_reached() {
                return Ok(());
            }

            self.sample_once()?;

            if self.sample_limit_reached() {
                return Ok(());
            }

            if self.cancel.wait(self.config.measurement_interval) {
                log::info!("Cancellation requested, stopping");
                return Ok(());
            }
        }
    }

    fn sample_limit_reached(&self) -> bool {
        self.config
            .max_samples
            .is_some_and(|max| self.samples_written >= max)
    }

    /// Release the sink and both links. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closing;

        if let Some(mut sink) = self.sink.take() {
            log::info!("Closing output file {}", sink.name());
            if let Err(e) = sink.close() {
                log::warn!("Failed to close output file: {}", e);
            }
        }
        if let Some(mut pirani) = self.pirani.take() {
            log::info!("Closing Pirani serial port");
            if let Err(e) = pirani.close() {
                log::warn!("Failed to close Pirani link: {}", e);
            }
        }
        if let Some(mut capacitance) = self.capacitance.take() {
            log::info!("Closing Capacitance Manometer serial port");
            if let Err(e) = capacitance.close() {
                log::warn!("Failed to close capacitance link: {}", e);
            }
        }
        if let Some((mut pirani, mut capacitance)) = self.links.take() {
            if let Err(e) = pirani.close() {
                log::warn!("Failed to close {}: {}", pirani.name(), e);
            }
            if let Err(e) = capacitance.close() {
                log::warn!("Failed to close {}: {}", capacitance.name(), e);
            }
        }

        self.state = SessionState::Closed;
    }

    fn append(&mut self, line: &str) -> Result<(), SessionError> {
        self.sink_mut()?.append(line)?;
        Ok(())
    }

    fn sink_mut(&mut self) -> Result<&mut BoxedSink, SessionError> {
        let state = self.state;
        self.sink.as_mut().ok_or(SessionError::InvalidState {
            state,
            action: "write without an open sink",
        })
    }

    fn pirani_mut(&mut self) -> Result<&mut Pirani<BoxedLink>, SessionError> {
        let state = self.state;
        self.pirani.as_mut().ok_or(SessionError::InvalidState {
            state,
            action: "query an unconnected Pirani gauge",
        })
    }

    fn capacitance_mut(&mut self) -> Result<&mut Capacitance<BoxedLink>, SessionError> {
        let state = self.state;
        self.capacitance.as_mut().ok_or(SessionError::InvalidState {
            state,
            action: "query an unconnected capacitance manometer",
        })
    }
}

impl Drop for VacuumSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn truncate_to_second(time: DateTime<Local>) -> DateTime<Local> {
    time.with_nanosecond(0).unwrap_or(time)
}

/// Whole seconds between two instants, both truncated to the second first.
pub fn elapsed_seconds(start: DateTime<Local>, now: DateTime<Local>) -> i64 {
    (truncate_to_second(now) - truncate_to_second(start)).num_seconds()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemorySink;
    use crate::scripted_link::{ScriptedLink, ScriptedReply};
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct ManualClock(Arc<Mutex<DateTime<Local>>>);

    impl ManualClock {
        fn starting_at(time: DateTime<Local>) -> Self {
            Self(Arc::new(Mutex::new(time)))
        }

        fn advance(&self, by: chrono::Duration) {
            let mut now = self.0.lock().unwrap();
            *now = *now + by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Local> {
            *self.0.lock().unwrap()
        }
    }

    fn start_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn test_config() -> SessionConfig {
        SessionConfig::new(ChamberProfile::Test)
            .poll_policy(PollPolicy::new(Duration::ZERO, 20))
            .measurement_interval(Duration::ZERO)
    }

    fn mock_session(config: SessionConfig, sink: &MemorySink) -> VacuumSession {
        VacuumSession::new(config)
            .with_links(
                Box::new(ScriptedLink::mock_pirani()),
                Box::new(ScriptedLink::mock_capacitance()),
            )
            .with_sink(Box::new(sink.clone()))
    }

    #[test]
    fn test_connect_writes_header() {
        let sink = MemorySink::new();
        let clock = ManualClock::starting_at(start_time());
        let mut session = mock_session(test_config(), &sink).with_clock(Box::new(clock));

        session.connect().unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.started_at(), Some(start_time()));
        assert_eq!(
            session.units(),
            Some(&GaugeUnits {
                pirani: "TORR".into(),
                capacitance: "Torr".into(),
            })
        );
        assert_eq!(
            sink.lines(),
            vec![
                record::TEST_MODE_BANNER.to_string(),
                "# Opened memory for output\n".to_string(),
                record::FORMAT_VERSION_LINE.to_string(),
                record::COLUMNS_LINE.to_string(),
                "# Gauge Units: TORR Torr\n".to_string(),
            ]
        );
    }

    #[test]
    fn test_samples_track_elapsed_time() {
        let sink = MemorySink::new();
        let clock = ManualClock::starting_at(start_time());
        let mut session =
            mock_session(test_config(), &sink).with_clock(Box::new(clock.clone()));
        session.connect().unwrap();

        clock.advance(chrono::Duration::milliseconds(9_400));
        let first = session.sample_once().unwrap().unwrap();
        clock.advance(chrono::Duration::seconds(10));
        let second = session.sample_once().unwrap().unwrap();

        assert_eq!(first.elapsed_seconds, 9);
        assert_eq!(second.elapsed_seconds, first.elapsed_seconds + 10);
        assert_eq!(session.state(), SessionState::Sampling);
        assert_eq!(
            sink.lines().last().unwrap(),
            "2024-03-01-12-00-19\t19\t1.00e-05\t1.00e-01\t1.00e-02\n"
        );
    }

    #[test]
    fn test_elapsed_seconds_rounding_is_consistent() {
        let start = start_time() + chrono::Duration::milliseconds(700);
        let mut previous = elapsed_seconds(start, start);
        assert_eq!(previous, 0);
        for step_ms in [300, 999, 1_000, 4_250, 60_001] {
            let later = start + chrono::Duration::milliseconds(step_ms);
            let elapsed = elapsed_seconds(start, later);
            assert!(elapsed >= previous);
            assert_eq!(
                elapsed,
                elapsed_seconds(start_time(), truncate_to_second(later))
            );
            previous = elapsed;
        }
    }

    #[test]
    fn test_sample_before_connect_is_rejected() {
        let sink = MemorySink::new();
        let mut session = mock_session(test_config(), &sink);
        assert!(matches!(
            session.sample_once(),
            Err(SessionError::InvalidState {
                state: SessionState::Uninitialized,
                ..
            })
        ));
    }

    #[test]
    fn test_bad_ack_during_connect_closes_everything() {
        let sink = MemorySink::new();
        let pirani = ScriptedLink::new("pirani")
            .reply("@253U?;FF", ScriptedReply::new("@253NAKTORR;FF"));
        let pirani_stats = pirani.stats();
        let capacitance = ScriptedLink::mock_capacitance();
        let capacitance_stats = capacitance.stats();

        let mut session = VacuumSession::new(test_config())
            .with_links(Box::new(pirani), Box::new(capacitance))
            .with_sink(Box::new(sink.clone()));

        assert!(matches!(
            session.connect(),
            Err(SessionError::Gauge(GaugeError::BadAck { .. }))
        ));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(pirani_stats.is_closed());
        assert!(capacitance_stats.is_closed());
        assert!(sink.is_closed());
        assert!(!sink.lines().iter().any(|l| l.starts_with("# Gauge Units")));
    }

    #[test]
    fn test_malformed_sample_is_fatal_by_default() {
        let sink = MemorySink::new();
        let capacitance = ScriptedLink::mock_capacitance()
            .reply("p", ScriptedReply::new("000.01"));
        let mut session = VacuumSession::new(test_config())
            .with_links(Box::new(ScriptedLink::mock_pirani()), Box::new(capacitance))
            .with_sink(Box::new(sink.clone()));
        session.connect().unwrap();

        // First reply is the well formed fixture, the second is truncated.
        assert!(session.sample_once().unwrap().is_some());
        assert!(matches!(
            session.sample_once(),
            Err(SessionError::Gauge(GaugeError::Malformed { .. }))
        ));
        assert_eq!(sink.lines().len(), 6);
    }

    #[test]
    fn test_malformed_sample_can_be_skipped() {
        let sink = MemorySink::new();
        let capacitance = ScriptedLink::new("cap")
            .reply("u", ScriptedReply::new("Torr"))
            .reply("p", ScriptedReply::new("1.0"))
            .reply("p", ScriptedReply::new("1.0 0.5"));
        let mut session = VacuumSession::new(test_config().skip_malformed(true))
            .with_links(Box::new(ScriptedLink::mock_pirani()), Box::new(capacitance))
            .with_sink(Box::new(sink.clone()));
        session.connect().unwrap();

        assert!(session.sample_once().unwrap().is_none());
        let sample = session.sample_once().unwrap().unwrap();
        assert_eq!(sample.capacitance.as_array(), [1.0, 0.5]);
        assert_eq!(sink.lines().len(), 6);
    }

    #[test]
    fn test_run_stops_after_max_samples() {
        let sink = MemorySink::new();
        let session = mock_session(test_config().max_samples(Some(3)), &sink);

        let summary = session.run().unwrap();
        assert_eq!(
            summary,
            SessionSummary {
                samples_written: 3,
                samples_skipped: 0,
                cancelled: false,
            }
        );
        assert_eq!(sink.lines().len(), 8);
        assert!(sink.is_closed());
    }

    #[test]
    fn test_run_with_zero_max_samples_writes_only_header() {
        let sink = MemorySink::new();
        let pirani = ScriptedLink::mock_pirani();
        let pirani_stats = pirani.stats();
        let session = VacuumSession::new(test_config().max_samples(Some(0)))
            .with_links(Box::new(pirani), Box::new(ScriptedLink::mock_capacitance()))
            .with_sink(Box::new(sink.clone()));

        let summary = session.run().unwrap();
        assert_eq!(summary.samples_written, 0);
        assert!(!summary.cancelled);
        assert_eq!(sink.lines().len(), 5);
        assert!(sink.is_closed());
        // Units query only, never a pressure query.
        assert_eq!(pirani_stats.writes(), vec![b"@253U?;FF".to_vec()]);
    }

    #[test]
    fn test_run_honours_prior_cancellation() {
        let sink = MemorySink::new();
        let session = mock_session(test_config(), &sink);
        session.cancel_token().cancel();

        let summary = session.run().unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.samples_written, 0);
        assert!(sink.is_closed());
    }

    #[test]
    fn test_drop_closes_links() {
        let pirani = ScriptedLink::mock_pirani();
        let stats = pirani.stats();
        let session = VacuumSession::new(test_config())
            .with_links(Box::new(pirani), Box::new(ScriptedLink::mock_capacitance()));
        drop(session);
        assert!(stats.is_closed());
    }

    #[test]
    fn test_connect_twice_is_rejected() {
        let sink = MemorySink::new();
        let mut session = mock_session(test_config(), &sink);
        session.connect().unwrap();
        assert!(matches!(
            session.connect(),
            Err(SessionError::InvalidState {
                state: SessionState::Ready,
                ..
            })
        ));
    }
}
