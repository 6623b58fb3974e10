use crate::serial_link::{GaugeLink, LinkError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// One canned response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedReply {
    bytes: Vec<u8>,
    arrival: Vec<usize>,
}

impl ScriptedReply {
    /// A reply that is fully available on the first poll.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            arrival: Vec::new(),
        }
    }

    /// Make the reply arrive gradually.
    ///
    /// Each entry is the number of reply bytes that have arrived by that poll.
    /// Once the list is exhausted the whole reply is available.
    pub fn arriving_in(mut self, arrival: impl Into<Vec<usize>>) -> Self {
        self.arrival = arrival.into();
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Counters shared with the link, readable after the link has been handed off.
#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    polls: Arc<AtomicUsize>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
}

impl LinkStats {
    /// How many times `bytes_available` was queried.
    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// Every command written so far, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct InFlight {
    bytes: VecDeque<u8>,
    arrival: VecDeque<usize>,
    arrived: usize,
}

/// Replays canned replies per command, for the test chamber and for tests.
#[derive(Debug)]
pub struct ScriptedLink {
    name: String,
    replies: HashMap<Vec<u8>, VecDeque<ScriptedReply>>,
    inbox: VecDeque<u8>,
    in_flight: Option<InFlight>,
    stats: LinkStats,
}

impl ScriptedLink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            replies: HashMap::new(),
            inbox: VecDeque::new(),
            in_flight: None,
            stats: LinkStats::default(),
        }
    }

    /// Answer `command` with `reply`.
    ///
    /// Several replies for one command are served in order; the last one keeps
    /// being replayed once the others are used up.
    pub fn reply(mut self, command: &str, reply: ScriptedReply) -> Self {
        self.replies
            .entry(command.as_bytes().to_vec())
            .or_default()
            .push_back(reply);
        self
    }

    /// Bytes already sitting in the receive buffer before any command is sent.
    pub fn with_stale_bytes(mut self, bytes: &[u8]) -> Self {
        self.inbox.extend(bytes);
        self
    }

    pub fn stats(&self) -> LinkStats {
        self.stats.clone()
    }

    /// Link replaying the bench fixtures of a Pirani gauge.
    pub fn mock_pirani() -> Self {
        Self::new("mock-pirani")
            .reply(
                crate::pirani::PiraniCommand::UNITS.as_str(),
                ScriptedReply::new("MOCKACKTORRDUN"),
            )
            .reply(
                crate::pirani::PiraniCommand::PRESSURE.as_str(),
                ScriptedReply::new("MOCKACK0.00001DUN"),
            )
    }

    /// Link replaying the bench fixtures of a dual channel capacitance manometer.
    pub fn mock_capacitance() -> Self {
        Self::new("mock-capacitance")
            .reply(
                crate::capacitance::UNITS_COMMAND,
                ScriptedReply::new("Torr"),
            )
            .reply(
                crate::capacitance::PRESSURE_COMMAND,
                ScriptedReply::new("000.01 0.0100"),
            )
            .reply(
                crate::capacitance::FULL_SCALE_COMMAND,
                ScriptedReply::new("1000.0 1.0000"),
            )
    }

    fn ensure_open(&self) -> Result<(), LinkError> {
        if self.stats.is_closed() {
            return Err(LinkError::Closed {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    fn next_reply(&mut self, command: &[u8]) -> Option<ScriptedReply> {
        let queue = self.replies.get_mut(command)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl GaugeLink for ScriptedLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, LinkError> {
        self.ensure_open()?;
        self.stats
            .writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bytes.to_vec());

        self.in_flight = self.next_reply(bytes).map(|reply| InFlight {
            bytes: reply.bytes.into(),
            arrival: reply.arrival.into(),
            arrived: 0,
        });
        Ok(bytes.len())
    }

    fn bytes_available(&mut self) -> Result<usize, LinkError> {
        self.ensure_open()?;
        self.stats.polls.fetch_add(1, Ordering::SeqCst);

        if let Some(mut flight) = self.in_flight.take() {
            let target = flight
                .arrival
                .pop_front()
                .unwrap_or(flight.arrived + flight.bytes.len());
            while flight.arrived < target {
                match flight.bytes.pop_front() {
                    Some(byte) => {
                        self.inbox.push_back(byte);
                        flight.arrived += 1;
                    }
                    None => break,
                }
            }
            if !flight.bytes.is_empty() {
                self.in_flight = Some(flight);
            }
        }

        Ok(self.inbox.len())
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>, LinkError> {
        self.ensure_open()?;
        let count = n.min(self.inbox.len());
        Ok(self.inbox.drain(..count).collect())
    }

    fn close(&mut self) -> Result<(), LinkError> {
        self.stats.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_follows_command() {
        let mut link = ScriptedLink::new("fixture").reply("p", ScriptedReply::new("1.0 2.0"));
        assert_eq!(link.bytes_available().unwrap(), 0);

        link.write(b"p").unwrap();
        assert_eq!(link.bytes_available().unwrap(), 7);
        assert_eq!(link.read(7).unwrap(), b"1.0 2.0");
        assert_eq!(link.bytes_available().unwrap(), 0);
    }

    #[test]
    fn test_unknown_command_stays_silent() {
        let mut link = ScriptedLink::new("fixture");
        link.write(b"?").unwrap();
        assert_eq!(link.bytes_available().unwrap(), 0);
    }

    #[test]
    fn test_gradual_arrival() {
        let mut link =
            ScriptedLink::new("fixture").reply("u", ScriptedReply::new("Torr").arriving_in([1, 3]));
        link.write(b"u").unwrap();
        assert_eq!(link.bytes_available().unwrap(), 1);
        assert_eq!(link.bytes_available().unwrap(), 3);
        assert_eq!(link.bytes_available().unwrap(), 4);
        assert_eq!(link.stats().polls(), 3);
    }

    #[test]
    fn test_reply_queue_repeats_last() {
        let mut link = ScriptedLink::new("fixture")
            .reply("p", ScriptedReply::new("a"))
            .reply("p", ScriptedReply::new("b"));

        for expected in [b"a", b"b", b"b"] {
            link.write(b"p").unwrap();
            let n = link.bytes_available().unwrap();
            assert_eq!(link.read(n).unwrap(), expected);
        }
    }

    #[test]
    fn test_closed_link_rejects_io() {
        let mut link = ScriptedLink::new("fixture");
        let stats = link.stats();
        link.close().unwrap();
        assert!(stats.is_closed());
        assert!(matches!(link.write(b"p"), Err(LinkError::Closed { .. })));
        assert!(link.close().is_ok());
    }
}
