//! Per-channel delivery loop.
//!
//! One thread per channel is the single writer for its subscribers' cursors.
//! It wakes on publish/subscribe signals, walks plain subscriptions and
//! queue groups, and publishes messages on subscriber inboxes. Queue groups
//! round-robin across members, skipping stalled ones; if every member is
//! stalled the group defers until an ack frees a slot.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender};
use crossbeam::select;
use tracing::{debug, warn};

use super::channel::{Channel, DeliverySignal, QueueGroup};
use super::redelivery::{RedeliveryCmd, SubKey};
use super::subscription::Subscription;
use super::transport::Transport;
use crate::core::{now_ns, Message, MsgProto};

pub(crate) struct DeliveryCtx {
    pub channel: Arc<Channel>,
    pub transport: Arc<dyn Transport>,
    pub redelivery_tx: Sender<RedeliveryCmd>,
}

pub(crate) fn spawn_delivery_loop(
    ctx: DeliveryCtx,
    signal_rx: Receiver<DeliverySignal>,
    shutdown: Receiver<()>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("delivery-{}", ctx.channel.name))
        .spawn(move || loop {
            select! {
                recv(signal_rx) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    // Coalesce a burst of signals into one pass.
                    while signal_rx.try_recv().is_ok() {}
                    deliver_pass(&ctx);
                }
                recv(shutdown) -> _ => break,
            }
        })
        .expect("spawn delivery thread")
}

fn deliver_pass(ctx: &DeliveryCtx) {
    let last_seq = ctx.channel.stores.msgs.last_seq();
    let mut registry = ctx.channel.subs();

    let plain: Vec<Arc<Subscription>> = registry.plain.clone();
    for sub in plain {
        deliver_to_sub(ctx, &sub, last_seq);
    }

    let keys: Vec<String> = registry.queues.keys().cloned().collect();
    for key in keys {
        if let Some(group) = registry.queues.get_mut(&key) {
            deliver_to_group(ctx, group, last_seq);
        }
    }
}

fn deliver_to_sub(ctx: &DeliveryCtx, sub: &Arc<Subscription>, last_seq: u64) {
    let mut inner = sub.lock();
    while inner.can_receive() {
        let next = inner.state.last_sent + 1;
        if next > last_seq {
            break;
        }
        let msg = match ctx.channel.stores.msgs.lookup(next) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                // Expired or evicted; skip the hole.
                inner.state.last_sent = next;
                continue;
            }
            Err(e) => {
                warn!(channel = %ctx.channel.name, seq = next, error = %e, "lookup failed");
                break;
            }
        };

        if inner.state.manual_ack {
            let sub_id = inner.state.sub_id;
            if let Err(e) = ctx.channel.stores.subs.add_seq_pending(sub_id, msg.seq) {
                warn!(channel = %ctx.channel.name, sub_id, error = %e, "pending persist failed");
                break;
            }
            let first_pending = inner.acks_pending.is_empty();
            let now = now_ns();
            inner.note_sent(msg.seq, now);
            publish_msg(&ctx.transport, &ctx.channel.name, &inner.state.inbox, &msg, false, 0);
            if first_pending {
                schedule(
                    ctx,
                    (ctx.channel.name.clone(), sub_id),
                    now + inner.state.ack_wait_ns,
                );
            }
        } else {
            // Auto-ack: the cursor is the only progress there is, so persist
            // it with the send.
            inner.state.last_sent = msg.seq;
            let state = inner.state.clone();
            publish_msg(&ctx.transport, &ctx.channel.name, &state.inbox, &msg, false, 0);
            if let Err(e) = ctx.channel.stores.subs.update_sub(&state) {
                warn!(channel = %ctx.channel.name, sub_id = state.sub_id, error = %e, "cursor persist failed");
                break;
            }
        }
    }
}

fn deliver_to_group(ctx: &DeliveryCtx, group: &mut QueueGroup, last_seq: u64) {
    while group.last_sent < last_seq {
        let members = group.members.len();
        if members == 0 {
            return;
        }
        let mut chosen = None;
        for i in 0..members {
            let idx = (group.next_member + i) % members;
            if group.members[idx].lock().can_receive() {
                chosen = Some(idx);
                break;
            }
        }
        // All members stalled or parked: defer until an ack wakes us.
        let Some(idx) = chosen else { return };

        let seq = group.last_sent + 1;
        let msg = match ctx.channel.stores.msgs.lookup(seq) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                group.last_sent = seq;
                continue;
            }
            Err(e) => {
                warn!(channel = %ctx.channel.name, seq, error = %e, "lookup failed");
                return;
            }
        };

        let member = Arc::clone(&group.members[idx]);
        let mut inner = member.lock();
        if inner.state.manual_ack {
            let sub_id = inner.state.sub_id;
            if let Err(e) = ctx.channel.stores.subs.add_seq_pending(sub_id, seq) {
                warn!(channel = %ctx.channel.name, sub_id, error = %e, "pending persist failed");
                return;
            }
            let first_pending = inner.acks_pending.is_empty();
            let now = now_ns();
            inner.note_sent(seq, now);
            publish_msg(&ctx.transport, &ctx.channel.name, &inner.state.inbox, &msg, false, 0);
            if first_pending {
                schedule(
                    ctx,
                    (ctx.channel.name.clone(), sub_id),
                    now + inner.state.ack_wait_ns,
                );
            }
        } else {
            inner.state.last_sent = inner.state.last_sent.max(seq);
            let state = inner.state.clone();
            publish_msg(&ctx.transport, &ctx.channel.name, &state.inbox, &msg, false, 0);
            if let Err(e) = ctx.channel.stores.subs.update_sub(&state) {
                warn!(channel = %ctx.channel.name, sub_id = state.sub_id, error = %e, "cursor persist failed");
                return;
            }
        }
        drop(inner);

        group.last_sent = seq;
        group.next_member = (idx + 1) % members;
    }
}

pub(crate) fn publish_msg(
    transport: &Arc<dyn Transport>,
    channel_name: &str,
    inbox: &str,
    msg: &Message,
    redelivered: bool,
    redelivery_count: u32,
) {
    let proto = MsgProto {
        channel: channel_name.to_string(),
        seq: msg.seq,
        timestamp_ns: msg.timestamp_ns,
        data: msg.data.clone(),
        redelivered,
        redelivery_count,
    };
    match serde_json::to_vec(&proto) {
        Ok(bytes) => {
            debug!(channel = channel_name, seq = msg.seq, inbox, redelivered, "deliver");
            if let Err(e) = transport.publish(inbox, bytes.into()) {
                warn!(channel = channel_name, seq = msg.seq, error = %e, "publish failed");
            }
        }
        Err(e) => warn!(error = %e, "message encode failed"),
    }
}

fn schedule(ctx: &DeliveryCtx, key: SubKey, deadline_ns: u64) {
    let _ = ctx.redelivery_tx.send(RedeliveryCmd::Schedule { key, deadline_ns });
}
