//! Request/response exchange over a [`GaugeLink`]. Replies carry no
//! delimiter, so completeness is judged from the pending byte count alone.

use crate::cancel::CancelToken;
use crate::serial_link::{GaugeLink, LinkError};
use std::thread;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_POLLS: u32 = 200;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error(
        "Timeout error: no complete reply to '{command}' after {polls} polls ({pending} byte(s) pending)"
    )]
    Timeout {
        command: String,
        polls: u32,
        pending: usize,
    },

    #[error("Cancelled while waiting for a reply to '{command}'")]
    Cancelled { command: String },

    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// How long to keep asking a link for a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Sleep before each pending-byte query.
    pub interval: Duration,
    /// Give up after this many queries.
    pub max_polls: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_polls: u32) -> Self {
        Self {
            interval,
            max_polls,
        }
    }

    /// Longest time a single exchange may wait for its reply.
    pub fn max_wait(&self) -> Duration {
        self.interval * self.max_polls
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_MAX_POLLS)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FrameReader {
    policy: PollPolicy,
    cancel: Option<CancelToken>,
}

impl FrameReader {
    pub fn new(policy: PollPolicy) -> Self {
        Self {
            policy,
            cancel: None,
        }
    }

    /// Abort pending waits when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Send `command` and wait for a reply of exactly `width` bytes.
    ///
    /// If several replies coalesced in the receive buffer, all pending bytes
    /// are consumed and only the first `width` of them are returned.
    pub fn request_fixed<L: GaugeLink + ?Sized>(
        &self,
        link: &mut L,
        command: &str,
        width: usize,
    ) -> Result<Vec<u8>, FrameError> {
        link.write(command.as_bytes())?;

        let pending = self.await_reply(link, command, |count| {
            count > 0 && width > 0 && count % width == 0
        })?;

        let mut frame = link.read(pending)?;
        log::debug!(
            "[{}] {} byte(s) for '{}' (width {}): {:?}",
            link.name(),
            frame.len(),
            command,
            width,
            String::from_utf8_lossy(&frame)
        );

        if frame.len() > width {
            log::warn!(
                "[{}] discarding {} surplus byte(s) after reply to '{}'",
                link.name(),
                frame.len() - width,
                command
            );
            frame.truncate(width);
        }

        Ok(frame)
    }

    /// Send `command` and take whatever arrives first as the whole reply.
    ///
    /// The reply is returned with surrounding whitespace removed.
    pub fn request_unframed<L: GaugeLink + ?Sized>(
        &self,
        link: &mut L,
        command: &str,
    ) -> Result<String, FrameError> {
        link.write(command.as_bytes())?;

        let pending = self.await_reply(link, command, |count| count > 0)?;
        let raw = link.read(pending)?;
        let response = String::from_utf8(raw)?;
        log::debug!("[{}] {} {:?}", link.name(), pending, response);

        Ok(response.trim().to_string())
    }

    /// Poll until `complete` accepts the pending count, returning that count.
    fn await_reply<L: GaugeLink + ?Sized>(
        &self,
        link: &mut L,
        command: &str,
        complete: impl Fn(usize) -> bool,
    ) -> Result<usize, FrameError> {
        let mut pending = 0;

        for _ in 0..self.policy.max_polls {
            if self.is_cancelled() {
                return Err(FrameError::Cancelled {
                    command: command.to_string(),
                });
            }

            thread::sleep(self.policy.interval);
            pending = link.bytes_available()?;
            log::trace!("[{}] {} byte(s) pending", link.name(), pending);

            if complete(pending) {
                return Ok(pending);
            }
        }

        Err(FrameError::Timeout {
            command: command.to_string(),
            polls: self.policy.max_polls,
            pending,
        })
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted_link::{ScriptedLink, ScriptedReply};

    fn fast_reader(max_polls: u32) -> FrameReader {
        FrameReader::new(PollPolicy::new(Duration::ZERO, max_polls))
    }

    #[test]
    fn test_fixed_reply_on_first_poll() {
        let mut link = ScriptedLink::new("fixture").reply("u", ScriptedReply::new("MOCKACKTORRDUN"));
        let stats = link.stats();

        let frame = fast_reader(5).request_fixed(&mut link, "u", 14).unwrap();
        assert_eq!(frame, b"MOCKACKTORRDUN");
        assert_eq!(stats.polls(), 1);
        assert_eq!(stats.writes(), vec![b"u".to_vec()]);
    }

    #[test]
    fn test_fixed_waits_out_partial_counts() {
        for partial_polls in [1usize, 3, 7] {
            let arrival: Vec<usize> = (0..partial_polls).map(|i| 1 + i % 16).collect();
            let mut link = ScriptedLink::new("fixture").reply(
                "p",
                ScriptedReply::new("MOCKACK0.00001DUN").arriving_in(arrival),
            );
            let stats = link.stats();

            let frame = fast_reader(50).request_fixed(&mut link, "p", 17).unwrap();
            assert_eq!(frame, b"MOCKACK0.00001DUN");
            assert_eq!(stats.polls(), partial_polls + 1);
        }
    }

    #[test]
    fn test_fixed_keeps_waiting_on_silence() {
        let mut link = ScriptedLink::new("fixture")
            .reply("p", ScriptedReply::new("MOCKACK0.00001DUN").arriving_in([0, 0, 0]));
        let stats = link.stats();

        assert!(fast_reader(10).request_fixed(&mut link, "p", 17).is_ok());
        assert_eq!(stats.polls(), 4);
    }

    #[test]
    fn test_fixed_coalesced_frames_yield_first() {
        let mut link = ScriptedLink::new("fixture")
            .reply("u", ScriptedReply::new("MOCKACKTORRDUNMOCKACKMBARDUN"));

        let frame = fast_reader(5).request_fixed(&mut link, "u", 14).unwrap();
        assert_eq!(frame, b"MOCKACKTORRDUN");
        assert_eq!(link.bytes_available().unwrap(), 0);
    }

    #[test]
    fn test_fixed_times_out_on_odd_length() {
        let mut link = ScriptedLink::new("fixture").reply("u", ScriptedReply::new("SHORT"));

        match fast_reader(4).request_fixed(&mut link, "u", 14) {
            Err(FrameError::Timeout {
                command,
                polls,
                pending,
            }) => {
                assert_eq!(command, "u");
                assert_eq!(polls, 4);
                assert_eq!(pending, 5);
            }
            other => unreachable!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_unframed_reads_first_nonzero_and_trims() {
        let mut link = ScriptedLink::new("fixture")
            .reply("p", ScriptedReply::new(" 000.01 0.0100\r\n").arriving_in([0, 0]));
        let stats = link.stats();

        let reply = fast_reader(10).request_unframed(&mut link, "p").unwrap();
        assert_eq!(reply, "000.01 0.0100");
        assert_eq!(stats.polls(), 3);
    }

    #[test]
    fn test_unframed_does_not_wait_for_rest() {
        let mut link = ScriptedLink::new("fixture")
            .reply("p", ScriptedReply::new("000.01 0.0100").arriving_in([6]));

        let reply = fast_reader(10).request_unframed(&mut link, "p").unwrap();
        assert_eq!(reply, "000.01");
    }

    #[test]
    fn test_unframed_rejects_invalid_utf8() {
        let mut link = ScriptedLink::new("fixture").reply("u", ScriptedReply::new(vec![0xff, 0xfe]));
        assert!(matches!(
            fast_reader(3).request_unframed(&mut link, "u"),
            Err(FrameError::Utf8(_))
        ));
    }

    #[test]
    fn test_cancelled_reader_stops_before_polling() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let reader = fast_reader(100).with_cancel(cancel);
        let mut link = ScriptedLink::new("fixture");
        let stats = link.stats();

        assert!(matches!(
            reader.request_unframed(&mut link, "p"),
            Err(FrameError::Cancelled { .. })
        ));
        assert_eq!(stats.polls(), 0);
    }

    #[test]
    fn test_default_policy() {
        let policy = PollPolicy::default();
        assert_eq!(policy.interval, Duration::from_millis(50));
        assert_eq!(policy.max_wait(), Duration::from_secs(10));
    }
}
