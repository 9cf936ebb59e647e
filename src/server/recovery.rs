//! Recovery orchestration: fold persisted state back into live channels,
//! clients, and subscriptions.
//!
//! Clients come back as offline shells; their subscriptions deliver again
//! immediately, but heartbeats only resume once the client reconnects.
//! Orphaned subscriptions (client no longer exists) survive only if durable.
//! Pending sets are restamped to now so redelivery clocks restart cleanly.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::channel::{DeliverySignal, QueueGroup, ShadowState};
use super::clients::Client;
use super::expiration::ExpirationCmd;
use super::redelivery::RedeliveryCmd;
use super::subscription::{durable_key, queue_key, Subscription};
use super::{AckTarget, BrokerError, ServerShared};
use crate::core::now_ns;
use crate::store::{RecoveredState, RecoveredSubscription};

pub(crate) fn apply(shared: &Arc<ServerShared>, state: RecoveredState) -> Result<(), BrokerError> {
    for info in state.clients {
        let client_id = info.client_id.clone();
        shared.clients.insert(client_id, Client::new(info, false));
    }

    for (name, recovered) in state.channels {
        let channel = shared.install_channel(&name, recovered.stores.clone());
        let now = now_ns();

        let mut queue_members: HashMap<String, Vec<RecoveredSubscription>> = HashMap::new();
        let mut singles: Vec<RecoveredSubscription> = Vec::new();
        for rsub in recovered.subscriptions {
            match rsub.state.queue_group.as_deref() {
                Some(queue) => {
                    let key = queue_key(queue, rsub.state.durable_name.as_deref());
                    queue_members.entry(key).or_default().push(rsub);
                }
                None => singles.push(rsub),
            }
        }

        let mut registry = channel.subs();

        for rsub in singles {
            let has_client = shared.clients.contains(&rsub.state.client_id);
            if !has_client && !rsub.state.is_durable {
                debug!(channel = %name, sub_id = rsub.state.sub_id, "dropping orphan subscription");
                channel.stores.subs.delete_sub(rsub.state.sub_id)?;
                continue;
            }

            let sub = Arc::new(Subscription::recovered(
                name.clone(),
                rsub.state.clone(),
                &rsub.pending,
                now,
            ));
            if rsub.state.is_durable {
                let key = durable_key(
                    &rsub.state.client_id,
                    rsub.state.durable_name.as_deref().unwrap_or_default(),
                );
                if has_client {
                    registry.register_durable(key, Arc::clone(&sub));
                } else {
                    sub.lock().offline = true;
                    registry.durables.insert(key, Arc::clone(&sub));
                    registry.by_id.insert(sub.sub_id(), Arc::clone(&sub));
                }
            } else {
                registry.register_plain(Arc::clone(&sub));
            }

            if has_client {
                attach_to_client(shared, &channel, &sub, &rsub);
            }
        }

        for (key, members) in queue_members {
            let (survivors, orphans): (Vec<_>, Vec<_>) = members
                .into_iter()
                .partition(|m| shared.clients.contains(&m.state.client_id));
            let is_durable = survivors
                .iter()
                .chain(orphans.iter())
                .any(|m| m.state.is_durable);
            let cursor = survivors
                .iter()
                .chain(orphans.iter())
                .map(|m| {
                    m.state
                        .last_sent
                        .max(m.pending.iter().next_back().copied().unwrap_or(0))
                })
                .max()
                .unwrap_or(0);

            if survivors.is_empty() {
                if is_durable {
                    park_orphan_group(&channel, &mut registry, key, orphans, cursor)?;
                } else {
                    for orphan in orphans {
                        if !orphan.pending.is_empty() {
                            warn!(
                                channel = %name,
                                sub_id = orphan.state.sub_id,
                                pending = orphan.pending.len(),
                                "dropping orphan queue member with in-flight messages"
                            );
                        }
                        channel.stores.subs.delete_sub(orphan.state.sub_id)?;
                    }
                }
                continue;
            }

            let subs: Vec<Arc<Subscription>> = survivors
                .iter()
                .map(|m| {
                    Arc::new(Subscription::recovered(
                        name.clone(),
                        m.state.clone(),
                        &m.pending,
                        now,
                    ))
                })
                .collect();

            // Orphan members' in-flight messages move to the survivors so
            // they are redelivered rather than lost.
            let mut rr = 0usize;
            for orphan in orphans {
                for &seq in &orphan.pending {
                    let target = &subs[rr % subs.len()];
                    rr += 1;
                    channel.stores.subs.add_seq_pending(target.sub_id(), seq)?;
                    target.lock().note_sent(seq, now);
                }
                channel.stores.subs.delete_sub(orphan.state.sub_id)?;
            }

            for sub in &subs {
                registry.by_id.insert(sub.sub_id(), Arc::clone(sub));
            }
            registry.queues.insert(
                key,
                QueueGroup {
                    members: subs.clone(),
                    last_sent: cursor,
                    next_member: 0,
                    is_durable,
                    shadow: None,
                },
            );
            for (sub, rsub) in subs.iter().zip(survivors.iter()) {
                attach_to_client(shared, &channel, sub, rsub);
            }
        }

        drop(registry);
        channel.signal(DeliverySignal::SubsChanged);
        let _ = shared.exp_tx.send(ExpirationCmd::Recompute {
            channel: name.clone(),
        });
    }

    Ok(())
}

fn attach_to_client(
    shared: &Arc<ServerShared>,
    channel: &Arc<super::channel::Channel>,
    sub: &Arc<Subscription>,
    rsub: &RecoveredSubscription,
) {
    shared.lock_ack_index_mut().insert(
        rsub.state.ack_inbox.clone(),
        AckTarget {
            channel: Arc::clone(channel),
            sub: Arc::clone(sub),
        },
    );
    if let Some(client) = shared.clients.get(&rsub.state.client_id) {
        super::clients_push_sub(&client, &channel.name, sub.sub_id());
    }
    let pending = {
        let inner = sub.lock();
        (!inner.acks_pending.is_empty()).then(|| inner.state.ack_wait_ns)
    };
    if let Some(ack_wait_ns) = pending {
        let _ = shared.redelivery_tx.send(RedeliveryCmd::Schedule {
            key: (channel.name.clone(), sub.sub_id()),
            deadline_ns: now_ns() + ack_wait_ns,
        });
    }
}

/// Every member of a durable queue group lost its client: keep one record
/// as the group's shadow, folding the others' pending rows into it.
fn park_orphan_group(
    channel: &Arc<super::channel::Channel>,
    registry: &mut super::channel::SubRegistry,
    key: String,
    mut orphans: Vec<RecoveredSubscription>,
    cursor: u64,
) -> Result<(), BrokerError> {
    orphans.sort_by_key(|m| m.state.last_sent);
    let Some(keeper) = orphans.pop() else {
        return Ok(());
    };
    let mut pending = keeper.pending.clone();
    for other in orphans {
        for &seq in &other.pending {
            channel
                .stores
                .subs
                .add_seq_pending(keeper.state.sub_id, seq)?;
            pending.insert(seq);
        }
        channel.stores.subs.delete_sub(other.state.sub_id)?;
    }
    let mut state = keeper.state;
    state.last_sent = state.last_sent.max(cursor);
    registry.queues.insert(
        key,
        QueueGroup {
            members: Vec::new(),
            last_sent: cursor,
            next_member: 0,
            is_durable: true,
            shadow: Some(ShadowState { state, pending }),
        },
    );
    Ok(())
}
