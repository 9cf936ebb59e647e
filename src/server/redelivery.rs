//! Ack-wait redelivery scheduler.
//!
//! One thread owns a deadline heap keyed by (channel, sub id). The delivery
//! path schedules a subscription when its first pending message is sent; the
//! ack path cancels it when the pending set drains. On firing, every due
//! sequence is re-sent in ascending order; for queue groups the resend may
//! be steered to the next eligible member, moving the pending entry with it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{after, never, Receiver, Sender};
use crossbeam::select;
use tracing::{debug, warn};

use super::channel::{Channel, DeliverySignal};
use super::delivery::publish_msg;
use super::subscription::{queue_key, Subscription};
use super::transport::Transport;
use crate::core::now_ns;

pub(crate) type SubKey = (String, u64);

pub(crate) enum RedeliveryCmd {
    Schedule { key: SubKey, deadline_ns: u64 },
    Cancel { key: SubKey },
}

pub(crate) struct RedeliveryCtx {
    pub channels: Arc<RwLock<HashMap<String, Arc<Channel>>>>,
    pub transport: Arc<dyn Transport>,
}

pub(crate) fn spawn_redelivery_loop(
    ctx: RedeliveryCtx,
    cmd_rx: Receiver<RedeliveryCmd>,
    cmd_tx: Sender<RedeliveryCmd>,
    shutdown: Receiver<()>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("redelivery".to_string())
        .spawn(move || {
            let mut pending: HashMap<SubKey, u64> = HashMap::new();
            let mut heap: BinaryHeap<Reverse<(u64, SubKey)>> = BinaryHeap::new();

            loop {
                pop_stale(&mut heap, &pending);
                let timer = match heap.peek() {
                    Some(Reverse((deadline_ns, _))) => {
                        let wait = deadline_ns.saturating_sub(now_ns());
                        after(Duration::from_nanos(wait))
                    }
                    None => never(),
                };

                select! {
                    recv(cmd_rx) -> cmd => match cmd {
                        Ok(RedeliveryCmd::Schedule { key, deadline_ns }) => {
                            let slot = pending.entry(key.clone()).or_insert(deadline_ns);
                            *slot = (*slot).min(deadline_ns);
                            heap.push(Reverse((*slot, key)));
                        }
                        Ok(RedeliveryCmd::Cancel { key }) => {
                            pending.remove(&key);
                        }
                        Err(_) => break,
                    },
                    recv(timer) -> _ => {
                        let now = now_ns();
                        loop {
                            pop_stale(&mut heap, &pending);
                            let due = match heap.peek() {
                                Some(Reverse((deadline_ns, _))) if *deadline_ns <= now => true,
                                _ => false,
                            };
                            if !due {
                                break;
                            }
                            let Some(Reverse((_, key))) = heap.pop() else { break };
                            pending.remove(&key);
                            if let Some(next) = redeliver(&ctx, &cmd_tx, &key) {
                                pending.insert(key.clone(), next);
                                heap.push(Reverse((next, key)));
                            }
                        }
                    }
                    recv(shutdown) -> _ => break,
                }
            }
        })
        .expect("spawn redelivery thread")
}

fn pop_stale(heap: &mut BinaryHeap<Reverse<(u64, SubKey)>>, pending: &HashMap<SubKey, u64>) {
    while let Some(Reverse((deadline_ns, key))) = heap.peek() {
        match pending.get(key) {
            Some(current) if current == deadline_ns => break,
            _ => {
                let _ = heap.pop();
            }
        }
    }
}

/// Redeliver everything due for one subscription. Returns the next deadline
/// for this key, if it still has pending messages.
fn redeliver(ctx: &RedeliveryCtx, cmd_tx: &Sender<RedeliveryCmd>, key: &SubKey) -> Option<u64> {
    let channel = {
        let channels = match ctx.channels.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels.get(&key.0).cloned()?
    };
    let sub = channel.subs().by_id.get(&key.1).cloned()?;

    let now = now_ns();
    let (due, group_key) = {
        let inner = sub.lock();
        if inner.deleted || inner.offline {
            return None;
        }
        let group_key = inner
            .state
            .queue_group
            .as_deref()
            .map(|q| queue_key(q, inner.state.durable_name.as_deref()));
        (inner.due_redeliveries(now), group_key)
    };

    for seq in due {
        let msg = match channel.stores.msgs.lookup(seq) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                // Expired while pending: nothing left to redeliver.
                drop_pending(&channel, &sub, seq);
                continue;
            }
            Err(e) => {
                warn!(channel = %key.0, seq, error = %e, "redelivery lookup failed");
                continue;
            }
        };

        match &group_key {
            Some(group_key) => {
                redeliver_queue(ctx, cmd_tx, &channel, &sub, group_key, seq, &msg, now)
            }
            None => {
                let (inbox, count) = {
                    let mut inner = sub.lock();
                    let count = inner.note_redelivered(seq);
                    inner.acks_pending.insert(seq, now);
                    (inner.state.inbox.clone(), count)
                };
                debug!(channel = %key.0, seq, count, "redeliver");
                publish_msg(&ctx.transport, &channel.name, &inbox, &msg, true, count);
            }
        }
    }

    let deadline = sub.lock().next_redelivery_deadline();
    deadline
}

/// Queue-group redelivery: steer to the next eligible member (possibly the
/// original), moving the persisted pending row when ownership changes.
#[allow(clippy::too_many_arguments)]
fn redeliver_queue(
    ctx: &RedeliveryCtx,
    cmd_tx: &Sender<RedeliveryCmd>,
    channel: &Arc<Channel>,
    sub: &Arc<Subscription>,
    group_key: &str,
    seq: u64,
    msg: &crate::core::Message,
    now: u64,
) {
    let target: Option<Arc<Subscription>> = {
        let mut registry = channel.subs();
        match registry.queues.get_mut(group_key) {
            Some(group) if !group.members.is_empty() => {
                let members = group.members.len();
                let mut chosen = None;
                for i in 0..members {
                    let idx = (group.next_member + i) % members;
                    if group.members[idx].lock().can_receive() {
                        chosen = Some(idx);
                        break;
                    }
                }
                chosen.map(|idx| {
                    group.next_member = (idx + 1) % members;
                    Arc::clone(&group.members[idx])
                })
            }
            _ => None,
        }
    };

    match target {
        Some(target) if target.sub_id() != sub.sub_id() => {
            let old_id = sub.sub_id();
            let new_id = target.sub_id();
            if let Err(e) = channel.stores.subs.ack_seq_pending(old_id, seq) {
                warn!(seq, error = %e, "pending transfer failed");
                return;
            }
            if let Err(e) = channel.stores.subs.add_seq_pending(new_id, seq) {
                warn!(seq, error = %e, "pending transfer failed");
                return;
            }
            let outcome = {
                let mut inner = sub.lock();
                inner.ack(seq)
            };
            if outcome.unstalled {
                channel.signal(DeliverySignal::SubsChanged);
            }
            if outcome.pending_empty {
                let _ = cmd_tx.send(RedeliveryCmd::Cancel {
                    key: (channel.name.clone(), old_id),
                });
            }
            let (inbox, count, deadline) = {
                let mut inner = target.lock();
                let count = inner.note_redelivered(seq);
                inner.note_sent(seq, now);
                (
                    inner.state.inbox.clone(),
                    count,
                    now + inner.state.ack_wait_ns,
                )
            };
            debug!(channel = %channel.name, seq, from = old_id, to = new_id, "redeliver steered");
            publish_msg(&ctx.transport, &channel.name, &inbox, msg, true, count);
            let _ = cmd_tx.send(RedeliveryCmd::Schedule {
                key: (channel.name.clone(), new_id),
                deadline_ns: deadline,
            });
        }
        Some(_same) => {
            let (inbox, count) = {
                let mut inner = sub.lock();
                let count = inner.note_redelivered(seq);
                inner.acks_pending.insert(seq, now);
                (inner.state.inbox.clone(), count)
            };
            publish_msg(&ctx.transport, &channel.name, &inbox, msg, true, count);
        }
        None => {
            // Every member stalled: restamp and let the next tick retry.
            sub.lock().acks_pending.insert(seq, now);
        }
    }
}

fn drop_pending(channel: &Arc<Channel>, sub: &Arc<Subscription>, seq: u64) {
    let state = {
        let mut inner = sub.lock();
        inner.ack(seq);
        inner.state.clone()
    };
    if let Err(e) = channel.stores.subs.ack_seq_pending(state.sub_id, seq) {
        warn!(sub_id = state.sub_id, seq, error = %e, "pending cleanup failed");
    }
    if let Err(e) = channel.stores.subs.update_sub(&state) {
        warn!(sub_id = state.sub_id, error = %e, "cursor persist failed");
    }
}
