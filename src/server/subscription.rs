//! Per-subscription delivery state machine.
//!
//! A subscription is Active, Stalled (pending window full), Offline (durable
//! whose client went away), or Deleted. The delivery loop, the ack path, and
//! the redelivery scheduler all mutate one subscription under its own lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::BrokerError;
use crate::core::StartPosition;
use crate::store::{MessageStore, SubState};

pub(crate) struct Subscription {
    pub channel: String,
    inner: Mutex<SubInner>,
}

pub(crate) struct SubInner {
    pub state: SubState,
    /// seq → wall clock (ns) of the most recent send.
    pub acks_pending: BTreeMap<u64, u64>,
    pub redelivery_counts: HashMap<u64, u32>,
    pub stalled: bool,
    pub offline: bool,
    pub deleted: bool,
}

pub(crate) struct AckOutcome {
    pub existed: bool,
    pub unstalled: bool,
    pub pending_empty: bool,
}

impl Subscription {
    pub fn new(channel: String, state: SubState) -> Self {
        Self {
            channel,
            inner: Mutex::new(SubInner {
                state,
                acks_pending: BTreeMap::new(),
                redelivery_counts: HashMap::new(),
                stalled: false,
                offline: false,
                deleted: false,
            }),
        }
    }

    /// Rebuild from persisted state. Pending sends are restamped to `now` so
    /// the redelivery clock restarts cleanly after a restart.
    pub fn recovered(channel: String, state: SubState, pending: &BTreeSet<u64>, now_ns: u64) -> Self {
        let sub = Self::new(channel, state);
        {
            let mut inner = sub.lock();
            for &seq in pending {
                inner.acks_pending.insert(seq, now_ns);
            }
            if let Some(&max_pending) = pending.iter().next_back() {
                inner.state.last_sent = inner.state.last_sent.max(max_pending);
            }
            inner.stalled = inner.window_full();
        }
        sub
    }

    pub fn lock(&self) -> MutexGuard<'_, SubInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn sub_id(&self) -> u64 {
        self.lock().state.sub_id
    }

    pub fn ack_inbox(&self) -> String {
        self.lock().state.ack_inbox.clone()
    }
}

impl SubInner {
    pub fn can_receive(&self) -> bool {
        !self.deleted && !self.offline && !self.stalled
    }

    pub fn window_full(&self) -> bool {
        self.acks_pending.len() >= self.state.max_in_flight as usize
    }

    /// Record a (re)delivery of `seq` at `now`. Flips to Stalled when the
    /// window fills.
    pub fn note_sent(&mut self, seq: u64, now_ns: u64) {
        self.state.last_sent = self.state.last_sent.max(seq);
        self.acks_pending.insert(seq, now_ns);
        if self.window_full() {
            self.stalled = true;
        }
    }

    /// Bump and return the redelivery count for `seq`.
    pub fn note_redelivered(&mut self, seq: u64) -> u32 {
        let count = self.redelivery_counts.entry(seq).or_insert(0);
        *count += 1;
        *count
    }

    pub fn ack(&mut self, seq: u64) -> AckOutcome {
        let existed = self.acks_pending.remove(&seq).is_some();
        self.redelivery_counts.remove(&seq);
        let mut unstalled = false;
        if existed && self.stalled && !self.window_full() {
            self.stalled = false;
            unstalled = true;
        }
        AckOutcome {
            existed,
            unstalled,
            pending_empty: self.acks_pending.is_empty(),
        }
    }

    /// Sequences whose ack wait has elapsed, in ascending order.
    pub fn due_redeliveries(&self, now_ns: u64) -> Vec<u64> {
        self.acks_pending
            .iter()
            .filter(|(_, &sent)| sent + self.state.ack_wait_ns <= now_ns)
            .map(|(&seq, _)| seq)
            .collect()
    }

    pub fn next_redelivery_deadline(&self) -> Option<u64> {
        self.acks_pending
            .values()
            .map(|&sent| sent + self.state.ack_wait_ns)
            .min()
    }
}

/// Resolve a start position into the subscription's initial `last_sent`
/// against the channel's current message store.
pub(crate) fn resolve_start_position(
    msgs: &dyn MessageStore,
    start: StartPosition,
    now_ns: u64,
) -> Result<u64, BrokerError> {
    let first = msgs.first_seq();
    let last = msgs.last_seq();
    match start {
        StartPosition::NewOnly => Ok(last),
        StartPosition::LastReceived => {
            // An empty channel behaves like NewOnly.
            if first <= last {
                Ok(last - 1)
            } else {
                Ok(last)
            }
        }
        StartPosition::AllAvailable => Ok(first.saturating_sub(1)),
        StartPosition::SequenceStart { seq } => {
            if seq > last + 1 {
                return Err(BrokerError::StartSequenceOutOfRange { seq, last });
            }
            Ok(seq.max(first).saturating_sub(1))
        }
        StartPosition::TimeDeltaStart { delta_ns } => {
            let since = now_ns.saturating_sub(delta_ns);
            let seq = msgs.seq_for_timestamp(since)?;
            Ok(seq.saturating_sub(1))
        }
    }
}

/// Registry key for a plain durable: one active owner per
/// (channel, durable, client).
pub(crate) fn durable_key(client_id: &str, durable_name: &str) -> String {
    format!("{client_id}:{durable_name}")
}

/// Registry key for a queue group; durable queue groups are named
/// independently of any member's client id.
pub(crate) fn queue_key(queue_group: &str, durable_name: Option<&str>) -> String {
    match durable_name {
        Some(durable) => format!("{durable}:{queue_group}"),
        None => queue_group.to_string(),
    }
}
