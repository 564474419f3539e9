/// Pending-request table.
///
/// Outbound iq requests are tracked under two indices: by sequence
/// number for O(1) response lookup, and by timeout instant for
/// ordered expiry scans. Both always hold exactly the same requests.
/// Timeout keys are unique; colliding deadlines are bumped by a tick
/// until free.
///
/// The 1-second tick also owns the whitespace keep-alive schedule.
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::error::StanzaError;
use crate::retry::RetrySchedule;
use crate::xml::Element;

use super::Client;

/// Outcome of a tracked request, delivered to its callback.
#[derive(Debug)]
pub struct IqResponse {
    pub ok: bool,
    /// First payload child of the response, when present.
    pub payload: Option<Element>,
    /// Parsed `<error/>` for iq-error responses, or the synthesised
    /// `recipient-unavailable` when retries ran out.
    pub error: Option<StanzaError>,
    pub from: Option<String>,
    pub to: Option<String>,
}

pub type IqCallback = Box<dyn FnOnce(&Client, IqResponse) + Send + 'static>;

struct PendingRequest {
    /// Serialised stanza, kept verbatim for retransmission.
    xml: String,
    to: String,
    callback: IqCallback,
    schedule: RetrySchedule,
    deadline_key: u64,
}

/// What the 1-second tick decided; executed by the caller after the
/// table lock is released.
pub enum TickAction {
    Retransmit(String),
    Expire { callback: IqCallback, to: String },
    Ping,
}

pub struct PendingTable {
    epoch: Instant,
    next_seq: u32,
    by_seq: HashMap<u32, PendingRequest>,
    by_deadline: BTreeMap<u64, u32>,
    keep_alive: Duration,
    next_ping_due: Instant,
}

impl PendingTable {
    pub fn new(keep_alive: Duration) -> Self {
        let epoch = Instant::now();
        Self {
            epoch,
            next_seq: 1,
            by_seq: HashMap::new(),
            by_deadline: BTreeMap::new(),
            keep_alive,
            next_ping_due: epoch + keep_alive / 2,
        }
    }

    fn millis(&self, instant: Instant) -> u64 {
        instant.saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn unique_deadline_key(&self, deadline: Instant) -> u64 {
        let mut key = self.millis(deadline);
        while self.by_deadline.contains_key(&key) {
            key += 1;
        }
        key
    }

    /// Registers a request and returns its sequence number plus the
    /// serialised text to transmit. `build` receives the fresh
    /// sequence number so the iq id and the index key always agree.
    pub fn insert(
        &mut self,
        now: Instant,
        to: &str,
        build: impl FnOnce(u32) -> String,
        callback: IqCallback,
        schedule: RetrySchedule,
    ) -> (u32, String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let xml = build(seq);
        let key = self.unique_deadline_key(now + schedule.interval());
        self.by_deadline.insert(key, seq);
        self.by_seq.insert(
            seq,
            PendingRequest {
                xml: xml.clone(),
                to: to.to_string(),
                callback,
                schedule,
                deadline_key: key,
            },
        );
        (seq, xml)
    }

    /// Resolves a request on response arrival. Returns None for late
    /// or spurious ids.
    pub fn take(&mut self, seq: u32) -> Option<(IqCallback, String)> {
        let request = self.by_seq.remove(&seq)?;
        self.by_deadline.remove(&request.deadline_key);
        Some((request.callback, request.to))
    }

    /// Scans for requests whose deadline passed: retransmits while the
    /// retry budget lasts, expires the rest. Also schedules the
    /// keep-alive ping.
    pub fn on_tick(&mut self, now: Instant) -> Vec<TickAction> {
        let mut actions = Vec::new();
        let now_key = self.millis(now);
        let due: Vec<(u64, u32)> = self
            .by_deadline
            .range(..=now_key)
            .map(|(k, seq)| (*k, *seq))
            .collect();
        for (key, seq) in due {
            self.by_deadline.remove(&key);
            let Some(request) = self.by_seq.get_mut(&seq) else {
                continue;
            };
            match request.schedule.next() {
                Some(interval) => {
                    let new_key = self.unique_deadline_key(now + interval);
                    let request = self.by_seq.get_mut(&seq).expect("present above");
                    request.deadline_key = new_key;
                    self.by_deadline.insert(new_key, seq);
                    actions.push(TickAction::Retransmit(request.xml.clone()));
                }
                None => {
                    let request = self.by_seq.remove(&seq).expect("present above");
                    actions.push(TickAction::Expire {
                        callback: request.callback,
                        to: request.to,
                    });
                }
            }
        }

        if now >= self.next_ping_due {
            self.next_ping_due = now + self.keep_alive / 2;
            actions.push(TickAction::Ping);
        }
        actions
    }

    /// Restarts the keep-alive schedule (fresh session).
    pub fn reset_ping(&mut self, now: Instant) {
        self.next_ping_due = now + self.keep_alive / 2;
    }

    /// Empties the table, handing back every callback so teardown can
    /// resolve the in-flight requests.
    pub fn drain(&mut self) -> Vec<(IqCallback, String)> {
        self.by_deadline.clear();
        self.by_seq
            .drain()
            .map(|(_, request)| (request.callback, request.to))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }

    #[cfg(test)]
    fn deadline_len(&self) -> usize {
        self.by_deadline.len()
    }
}
