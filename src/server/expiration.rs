//! Age-based message expiration scheduler.
//!
//! One thread tracks the earliest expiration deadline per channel, sleeps
//! until the soonest one, and asks that channel's message store to evict.
//! The next wakeup always comes back from the store, so the scheduler never
//! drifts from what is actually persisted. Store failures back the loop off
//! instead of killing it; shutdown interrupts any sleep immediately.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{after, never, Receiver};
use crossbeam::select;
use tracing::{debug, warn};

use super::channel::Channel;
use crate::core::now_ns;

pub(crate) enum ExpirationCmd {
    /// A publish may have introduced an earlier deadline for this channel.
    Recompute { channel: String },
}

pub(crate) fn spawn_expiration_loop(
    channels: Arc<RwLock<HashMap<String, Arc<Channel>>>>,
    error_backoff: Duration,
    cmd_rx: Receiver<ExpirationCmd>,
    shutdown: Receiver<()>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("expiration".to_string())
        .spawn(move || {
            // channel name → next deadline (ns).
            let mut deadlines: BTreeMap<String, u64> = BTreeMap::new();

            loop {
                let timer = match deadlines.values().min() {
                    Some(&next) => {
                        let wait = next.saturating_sub(now_ns());
                        after(Duration::from_nanos(wait))
                    }
                    None => never(),
                };

                select! {
                    recv(cmd_rx) -> cmd => match cmd {
                        Ok(ExpirationCmd::Recompute { channel }) => {
                            sweep_one(&channels, &mut deadlines, &channel, error_backoff);
                        }
                        Err(_) => break,
                    },
                    recv(timer) -> _ => {
                        let now = now_ns();
                        let due: Vec<String> = deadlines
                            .iter()
                            .filter(|(_, &deadline)| deadline <= now)
                            .map(|(name, _)| name.clone())
                            .collect();
                        for name in due {
                            sweep_one(&channels, &mut deadlines, &name, error_backoff);
                        }
                    }
                    recv(shutdown) -> _ => break,
                }
            }
        })
        .expect("spawn expiration thread")
}

fn sweep_one(
    channels: &Arc<RwLock<HashMap<String, Arc<Channel>>>>,
    deadlines: &mut BTreeMap<String, u64>,
    name: &str,
    error_backoff: Duration,
) {
    let channel = {
        let map = match channels.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(name).cloned()
    };
    let Some(channel) = channel else {
        deadlines.remove(name);
        return;
    };

    match channel.stores.msgs.expire(now_ns()) {
        Ok(Some(next)) => {
            debug!(channel = name, next, "expiration swept");
            deadlines.insert(name.to_string(), next);
        }
        Ok(None) => {
            deadlines.remove(name);
        }
        Err(e) => {
            // Transient store trouble: retry after the configured back-off.
            warn!(channel = name, error = %e, "expiration sweep failed");
            deadlines.insert(
                name.to_string(),
                now_ns() + error_backoff.as_nanos() as u64,
            );
        }
    }
}
