//! Per-channel runtime state: stores, subscriber registry, delivery signal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam::channel::Sender;

use super::subscription::Subscription;
use crate::store::ChannelStores;

/// Wakes a channel's delivery loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DeliverySignal {
    /// New messages were stored.
    NewMessages,
    /// A subscriber joined, resumed, or unstalled.
    SubsChanged,
}

pub(crate) struct Channel {
    pub name: String,
    pub stores: ChannelStores,
    pub delivery_tx: Sender<DeliverySignal>,
    subs: Mutex<SubRegistry>,
}

#[derive(Default)]
pub(crate) struct SubRegistry {
    /// Non-queue subscriptions eligible for delivery (durables included).
    pub plain: Vec<Arc<Subscription>>,
    /// `client:durable` → durable subscription, online or offline.
    pub durables: HashMap<String, Arc<Subscription>>,
    /// Queue-group key → group state.
    pub queues: HashMap<String, QueueGroup>,
    /// Every live subscription by id, for ack and redelivery routing.
    pub by_id: HashMap<u64, Arc<Subscription>>,
}

pub(crate) struct QueueGroup {
    pub members: Vec<Arc<Subscription>>,
    /// Shared delivery cursor; advances monotonically on first delivery.
    pub last_sent: u64,
    pub next_member: usize,
    pub is_durable: bool,
    /// For a durable group with no members, the persisted record the next
    /// joining member takes over.
    pub shadow: Option<ShadowState>,
}

/// The parked record of a durable queue group between its last member
/// leaving and the next one joining.
pub(crate) struct ShadowState {
    pub state: crate::store::SubState,
    pub pending: std::collections::BTreeSet<u64>,
}

impl Channel {
    pub fn new(name: String, stores: ChannelStores, delivery_tx: Sender<DeliverySignal>) -> Self {
        Self {
            name,
            stores,
            delivery_tx,
            subs: Mutex::new(SubRegistry::default()),
        }
    }

    pub fn subs(&self) -> MutexGuard<'_, SubRegistry> {
        match self.subs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn signal(&self, signal: DeliverySignal) {
        // The delivery loop owning the receiver may already be gone during
        // shutdown; a missed wakeup is then irrelevant.
        let _ = self.delivery_tx.send(signal);
    }
}

impl SubRegistry {
    pub fn register_plain(&mut self, sub: Arc<Subscription>) {
        self.by_id.insert(sub.sub_id(), Arc::clone(&sub));
        self.plain.push(sub);
    }

    pub fn register_durable(&mut self, key: String, sub: Arc<Subscription>) {
        self.by_id.insert(sub.sub_id(), Arc::clone(&sub));
        self.durables.insert(key, Arc::clone(&sub));
        self.plain.push(sub);
    }

    pub fn remove_plain(&mut self, sub_id: u64) {
        self.plain.retain(|s| s.sub_id() != sub_id);
        self.by_id.remove(&sub_id);
        self.durables.retain(|_, s| s.sub_id() != sub_id);
    }

    /// Detach a durable from delivery while keeping its registry entry.
    pub fn park_durable(&mut self, sub_id: u64) {
        self.plain.retain(|s| s.sub_id() != sub_id);
    }
}
