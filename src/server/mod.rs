//! The broker core: typed request surface, channel lifecycle, client
//! registry wiring, and shutdown fan-out.
//!
//! An external RPC layer decodes wire requests and calls the methods on
//! [`Server`]; outbound traffic (deliveries, heartbeat probes) goes through
//! the [`Transport`] seam.

mod channel;
mod clients;
mod delivery;
mod expiration;
mod recovery;
mod redelivery;
mod subscription;
pub mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use self::channel::{Channel, DeliverySignal, QueueGroup, ShadowState};
use self::clients::{Client, ClientRegistry, HeartbeatCmd};
use self::delivery::{publish_msg, spawn_delivery_loop, DeliveryCtx};
use self::expiration::{spawn_expiration_loop, ExpirationCmd};
use self::redelivery::{spawn_redelivery_loop, RedeliveryCmd, RedeliveryCtx};
use self::subscription::{durable_key, queue_key, resolve_start_position, Subscription};
pub use self::transport::{InMemoryTransport, Transport, TransportError};

use crate::config::Config;
use crate::core::{
    now_ns, validate_channel_name, validate_client_id, AckProto, ClientInfo, ConnectRequest,
    ConnectResponse, ServerInfo, SubscribeRequest, SubscribeResponse, UnsubscribeRequest,
};
use crate::error::Transience;
use crate::store::{ChannelStores, Store, StoreError, SubState};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid subject {name:?}")]
    InvalidSubject { name: String },
    #[error("invalid client id {id:?}")]
    InvalidClientId { id: String },
    #[error("client id {id:?} already registered")]
    DuplicateClientId { id: String },
    #[error("durable {durable:?} already active for client {client:?}")]
    DuplicateDurable { durable: String, client: String },
    #[error("unknown client {id:?}")]
    UnknownClient { id: String },
    #[error("unknown channel {name:?}")]
    UnknownChannel { name: String },
    #[error("unknown subscription for ack inbox {ack_inbox:?}")]
    UnknownSubscription { ack_inbox: String },
    #[error("start sequence {seq} is beyond last sequence {last}")]
    StartSequenceOutOfRange { seq: u64, last: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("server is shutting down")]
    ShuttingDown,
}

impl BrokerError {
    pub fn transience(&self) -> Transience {
        match self {
            BrokerError::Store(e) => e.transience(),
            BrokerError::ShuttingDown => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }
}

/// Timing and sizing knobs for the delivery engine.
#[derive(Clone, Debug)]
pub struct ServerOpts {
    pub cluster_id: String,
    pub hb_interval: Duration,
    pub hb_timeout: Duration,
    pub max_failed_hb: u32,
    pub dup_cid_timeout: Duration,
    pub dup_max_cid_probes: usize,
    pub default_ack_wait: Duration,
    pub default_max_in_flight: u32,
    pub grace_shutdown: Duration,
    pub expiration_error_backoff: Duration,
}

impl Default for ServerOpts {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ServerOpts {
    pub fn from_config(config: &Config) -> Self {
        let broker = &config.broker;
        Self {
            cluster_id: config.cluster_id.clone(),
            hb_interval: broker.hb_interval(),
            hb_timeout: broker.hb_timeout(),
            max_failed_hb: broker.max_failed_hb,
            dup_cid_timeout: broker.dup_cid_timeout(),
            dup_max_cid_probes: broker.dup_max_cid_probes,
            default_ack_wait: broker.default_ack_wait(),
            default_max_in_flight: broker.default_max_in_flight,
            grace_shutdown: broker.grace_shutdown(),
            expiration_error_backoff: broker.expiration_error_backoff(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct AckTarget {
    pub channel: Arc<Channel>,
    pub sub: Arc<Subscription>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum DetachMode {
    /// Client went away: durables (and durable queue groups) park.
    ClientClose,
    /// Explicit unsubscribe: the subscription is deleted for good.
    Unsubscribe,
}

pub(crate) struct ServerShared {
    pub info: ServerInfo,
    pub opts: ServerOpts,
    pub store: Arc<dyn Store>,
    pub transport: Arc<dyn Transport>,
    pub channels: Arc<RwLock<HashMap<String, Arc<Channel>>>>,
    pub ack_index: RwLock<HashMap<String, AckTarget>>,
    pub clients: ClientRegistry,
    pub redelivery_tx: Sender<RedeliveryCmd>,
    pub hb_tx: Sender<HeartbeatCmd>,
    pub exp_tx: Sender<ExpirationCmd>,
    pub shutdown_rx: Receiver<()>,
    pub threads: Mutex<Vec<JoinHandle<()>>>,
    pub shutting_down: AtomicBool,
}

/// The broker. One instance per store; construction runs recovery.
pub struct Server {
    shared: Arc<ServerShared>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

impl Server {
    pub fn start(
        opts: ServerOpts,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, BrokerError> {
        let info = ServerInfo::new(opts.cluster_id.clone());
        let recovered = store.recover()?;
        store.init(&info)?;

        let (shutdown_tx, shutdown_rx) = unbounded::<()>();
        let (redelivery_tx, redelivery_rx) = unbounded();
        let (hb_tx, hb_rx) = unbounded();
        let (exp_tx, exp_rx) = unbounded();
        let channels = Arc::new(RwLock::new(HashMap::new()));

        let shared = Arc::new(ServerShared {
            info,
            clients: ClientRegistry::new(opts.dup_max_cid_probes),
            opts,
            store,
            transport,
            channels: Arc::clone(&channels),
            ack_index: RwLock::new(HashMap::new()),
            redelivery_tx: redelivery_tx.clone(),
            hb_tx,
            exp_tx,
            shutdown_rx: shutdown_rx.clone(),
            threads: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        });

        let redelivery_handle = spawn_redelivery_loop(
            RedeliveryCtx {
                channels: Arc::clone(&channels),
                transport: Arc::clone(&shared.transport),
            },
            redelivery_rx,
            redelivery_tx,
            shutdown_rx.clone(),
        );
        let heartbeat_handle = clients::spawn_heartbeat_loop(
            Arc::clone(&shared),
            hb_rx,
            shutdown_rx.clone(),
        );
        let expiration_handle = spawn_expiration_loop(
            channels,
            shared.opts.expiration_error_backoff,
            exp_rx,
            shutdown_rx,
        );
        shared
            .lock_threads()
            .extend([redelivery_handle, heartbeat_handle, expiration_handle]);

        if let Some(state) = recovered {
            info!(
                clients = state.clients.len(),
                channels = state.channels.len(),
                "recovering persisted state"
            );
            recovery::apply(&shared, state)?;
        }

        Ok(Self {
            shared,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        })
    }

    pub fn info(&self) -> &ServerInfo {
        &self.shared.info
    }

    /// CONNECT: register a client, arbitrating duplicate ids by probing the
    /// existing owner's heartbeat inbox.
    pub fn client_connect(&self, req: ConnectRequest) -> Result<ConnectResponse, BrokerError> {
        self.check_running()?;
        let shared = &self.shared;
        if validate_client_id(&req.client_id).is_err() {
            return Err(BrokerError::InvalidClientId { id: req.client_id });
        }

        if let Some(existing) = shared.clients.get(&req.client_id) {
            if existing.is_online() {
                shared.clients.acquire_probe_permit();
                let probe = shared.transport.request(
                    &existing.heartbeat_inbox(),
                    Bytes::new(),
                    shared.opts.dup_cid_timeout,
                );
                shared.clients.release_probe_permit();
                if probe.is_ok() {
                    return Err(BrokerError::DuplicateClientId { id: req.client_id });
                }
                info!(client_id = %req.client_id, "existing owner unresponsive, replacing");
                shared.drop_client(&req.client_id)?;
            } else {
                // A recovered shell is reconnecting: close out the previous
                // incarnation so its durables park offline and resume when
                // the client resubscribes.
                shared.drop_client(&req.client_id)?;
            }
        }

        let client_info = ClientInfo {
            client_id: req.client_id.clone(),
            heartbeat_inbox: req.heartbeat_inbox,
        };
        shared.store.add_client(&client_info)?;
        shared
            .clients
            .insert(req.client_id.clone(), Client::new(client_info, true));
        let _ = shared.hb_tx.send(HeartbeatCmd::Watch {
            client_id: req.client_id,
        });

        Ok(ConnectResponse {
            publish_prefix: shared.info.publish_prefix.clone(),
            subscribe_subj: shared.info.subscribe_subj.clone(),
            unsub_subj: shared.info.unsub_subj.clone(),
            close_subj: shared.info.close_subj.clone(),
        })
    }

    /// CLOSE: remove the client; durable subscriptions go offline, the rest
    /// are deleted.
    pub fn client_close(&self, client_id: &str) -> Result<(), BrokerError> {
        self.check_running()?;
        self.shared.drop_client(client_id)
    }

    /// PUBLISH: store on the channel (creating it on demand) and wake its
    /// delivery loop. Returns the assigned sequence.
    pub fn publish(&self, channel_name: &str, data: Bytes) -> Result<u64, BrokerError> {
        self.check_running()?;
        validate_channel_name(channel_name).map_err(|_| BrokerError::InvalidSubject {
            name: channel_name.to_string(),
        })?;
        let channel = self.shared.get_or_create_channel(channel_name)?;
        let seq = channel.stores.msgs.store(data)?;
        channel.signal(DeliverySignal::NewMessages);
        let _ = self.shared.exp_tx.send(ExpirationCmd::Recompute {
            channel: channel_name.to_string(),
        });
        Ok(seq)
    }

    /// SUBSCRIBE: create, resume, or join depending on durable/queue
    /// configuration. Returns the ack inbox the client must ack on.
    pub fn subscribe(&self, req: SubscribeRequest) -> Result<SubscribeResponse, BrokerError> {
        self.check_running()?;
        let shared = &self.shared;
        validate_channel_name(&req.channel).map_err(|_| BrokerError::InvalidSubject {
            name: req.channel.clone(),
        })?;
        let client = shared
            .clients
            .get(&req.client_id)
            .filter(|c| c.is_online())
            .ok_or_else(|| BrokerError::UnknownClient {
                id: req.client_id.clone(),
            })?;
        if req.inbox.is_empty() {
            return Err(BrokerError::InvalidArgument("empty inbox".to_string()));
        }
        let cfg = &req.config;
        for (label, name) in [
            ("durable name", cfg.durable_name.as_deref()),
            ("queue group", cfg.queue_group.as_deref()),
        ] {
            if let Some(name) = name {
                if name.is_empty() || name.contains(':') {
                    return Err(BrokerError::InvalidArgument(format!(
                        "bad {label} {name:?}"
                    )));
                }
            }
        }
        let ack_wait_ns = match cfg.ack_wait_ns {
            Some(0) => return Err(BrokerError::InvalidArgument("zero ack wait".to_string())),
            Some(ns) => ns,
            None => shared.opts.default_ack_wait.as_nanos() as u64,
        };
        let max_in_flight = match cfg.max_in_flight {
            Some(0) => {
                return Err(BrokerError::InvalidArgument(
                    "zero max in flight".to_string(),
                ))
            }
            Some(n) => n,
            None => shared.opts.default_max_in_flight,
        };

        let channel = shared.get_or_create_channel(&req.channel)?;
        let ack_inbox = format!(
            "_ACK.{}.{}",
            shared.info.cluster_id,
            Uuid::new_v4().simple()
        );
        let now = now_ns();
        let base_state = SubState {
            sub_id: 0,
            client_id: req.client_id.clone(),
            inbox: req.inbox.clone(),
            ack_inbox: ack_inbox.clone(),
            durable_name: cfg.durable_name.clone(),
            queue_group: cfg.queue_group.clone(),
            ack_wait_ns,
            max_in_flight,
            manual_ack: cfg.manual_ack,
            is_durable: cfg.durable_name.is_some(),
            last_sent: 0,
        };

        let sub: Arc<Subscription> = {
            let mut registry = channel.subs();
            if let Some(queue) = cfg.queue_group.clone() {
                let key = queue_key(&queue, cfg.durable_name.as_deref());
                match registry.queues.get_mut(&key) {
                    Some(group) => {
                        if let Some(shadow) = group.shadow.take() {
                            // First member back into a parked durable group
                            // takes over the persisted record and pending.
                            let mut state = shadow.state;
                            state.client_id = base_state.client_id;
                            state.inbox = base_state.inbox;
                            state.ack_inbox = base_state.ack_inbox;
                            state.ack_wait_ns = ack_wait_ns;
                            state.max_in_flight = max_in_flight;
                            state.manual_ack = cfg.manual_ack;
                            state.last_sent = state.last_sent.max(group.last_sent);
                            channel.stores.subs.update_sub(&state)?;
                            let sub = Arc::new(Subscription::recovered(
                                channel.name.clone(),
                                state,
                                &shadow.pending,
                                now,
                            ));
                            if !shadow.pending.is_empty() {
                                let _ = shared.redelivery_tx.send(RedeliveryCmd::Schedule {
                                    key: (channel.name.clone(), sub.sub_id()),
                                    deadline_ns: now + ack_wait_ns,
                                });
                            }
                            group.members.push(Arc::clone(&sub));
                            registry.by_id.insert(sub.sub_id(), Arc::clone(&sub));
                            sub
                        } else {
                            // Joining an active group: start at the shared
                            // cursor, never replaying other members' flight.
                            let mut state = base_state;
                            state.last_sent = group.last_sent;
                            channel.stores.subs.create_sub(&mut state)?;
                            let sub =
                                Arc::new(Subscription::new(channel.name.clone(), state));
                            group.members.push(Arc::clone(&sub));
                            registry.by_id.insert(sub.sub_id(), Arc::clone(&sub));
                            sub
                        }
                    }
                    None => {
                        let start =
                            resolve_start_position(&*channel.stores.msgs, cfg.start, now)?;
                        let mut state = base_state;
                        state.last_sent = start;
                        channel.stores.subs.create_sub(&mut state)?;
                        let sub = Arc::new(Subscription::new(channel.name.clone(), state));
                        registry.by_id.insert(sub.sub_id(), Arc::clone(&sub));
                        registry.queues.insert(
                            key,
                            QueueGroup {
                                members: vec![Arc::clone(&sub)],
                                last_sent: start,
                                next_member: 0,
                                is_durable: cfg.durable_name.is_some(),
                                shadow: None,
                            },
                        );
                        sub
                    }
                }
            } else if let Some(durable) = cfg.durable_name.clone() {
                let key = durable_key(&req.client_id, &durable);
                match registry.durables.get(&key).cloned() {
                    Some(existing) => {
                        let resumed = {
                            let mut inner = existing.lock();
                            if !inner.offline {
                                return Err(BrokerError::DuplicateDurable {
                                    durable,
                                    client: req.client_id,
                                });
                            }
                            inner.offline = false;
                            inner.state.inbox = base_state.inbox;
                            inner.state.ack_inbox = base_state.ack_inbox;
                            inner.state.ack_wait_ns = ack_wait_ns;
                            inner.state.max_in_flight = max_in_flight;
                            inner.state.manual_ack = cfg.manual_ack;
                            let seqs: Vec<u64> = inner.acks_pending.keys().copied().collect();
                            for seq in seqs {
                                inner.acks_pending.insert(seq, now);
                            }
                            inner.stalled = inner.window_full();
                            (inner.state.clone(), !inner.acks_pending.is_empty())
                        };
                        channel.stores.subs.update_sub(&resumed.0)?;
                        if resumed.1 {
                            let _ = shared.redelivery_tx.send(RedeliveryCmd::Schedule {
                                key: (channel.name.clone(), existing.sub_id()),
                                deadline_ns: now + ack_wait_ns,
                            });
                        }
                        registry.plain.push(Arc::clone(&existing));
                        existing
                    }
                    None => {
                        let start =
                            resolve_start_position(&*channel.stores.msgs, cfg.start, now)?;
                        let mut state = base_state;
                        state.last_sent = start;
                        channel.stores.subs.create_sub(&mut state)?;
                        let sub = Arc::new(Subscription::new(channel.name.clone(), state));
                        registry.register_durable(key, Arc::clone(&sub));
                        sub
                    }
                }
            } else {
                let start = resolve_start_position(&*channel.stores.msgs, cfg.start, now)?;
                let mut state = base_state;
                state.last_sent = start;
                channel.stores.subs.create_sub(&mut state)?;
                let sub = Arc::new(Subscription::new(channel.name.clone(), state));
                registry.register_plain(Arc::clone(&sub));
                sub
            }
        };

        self.shared.lock_ack_index_mut().insert(
            ack_inbox.clone(),
            AckTarget {
                channel: Arc::clone(&channel),
                sub: Arc::clone(&sub),
            },
        );
        clients_push_sub(&client, &channel.name, sub.sub_id());
        channel.signal(DeliverySignal::SubsChanged);

        Ok(SubscribeResponse { ack_inbox })
    }

    /// UNSUBSCRIBE: permanent removal, durables included.
    pub fn unsubscribe(&self, req: UnsubscribeRequest) -> Result<(), BrokerError> {
        self.check_running()?;
        let shared = &self.shared;
        let client = shared
            .clients
            .get(&req.client_id)
            .ok_or_else(|| BrokerError::UnknownClient {
                id: req.client_id.clone(),
            })?;
        if shared.get_channel(&req.channel).is_none() {
            return Err(BrokerError::UnknownChannel {
                name: req.channel.clone(),
            });
        }
        let target = shared
            .lock_ack_index_mut()
            .remove(&req.ack_inbox)
            .ok_or_else(|| BrokerError::UnknownSubscription {
                ack_inbox: req.ack_inbox.clone(),
            })?;
        let sub_id = target.sub.sub_id();
        shared.detach_sub(&target.channel, sub_id, DetachMode::Unsubscribe)?;
        clients_remove_sub(&client, &target.channel.name, sub_id);
        Ok(())
    }

    /// ACK: client acknowledgement for one delivered sequence.
    pub fn ack(&self, ack_inbox: &str, ack: AckProto) -> Result<(), BrokerError> {
        let shared = &self.shared;
        let target = shared
            .lock_ack_index()
            .get(ack_inbox)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownSubscription {
                ack_inbox: ack_inbox.to_string(),
            })?;

        let (outcome, state) = {
            let mut inner = target.sub.lock();
            let outcome = inner.ack(ack.seq);
            (outcome, inner.state.clone())
        };
        if !outcome.existed {
            return Ok(());
        }
        target
            .channel
            .stores
            .subs
            .ack_seq_pending(state.sub_id, ack.seq)?;
        target.channel.stores.subs.update_sub(&state)?;

        if outcome.pending_empty {
            let _ = shared.redelivery_tx.send(RedeliveryCmd::Cancel {
                key: (target.channel.name.clone(), state.sub_id),
            });
        }
        if outcome.unstalled {
            target.channel.signal(DeliverySignal::SubsChanged);
        }
        Ok(())
    }

    /// Stop every loop, join them, and close the store. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender disconnects every loop's shutdown receiver.
        let tx = match self.shutdown_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(tx);

        let handles: Vec<JoinHandle<()>> = self.shared.lock_threads().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        if let Err(e) = self.shared.store.close() {
            warn!(error = %e, "store close failed");
        }
    }

    fn check_running(&self) -> Result<(), BrokerError> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(BrokerError::ShuttingDown);
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ServerShared {
    fn lock_threads(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.threads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_ack_index(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, AckTarget>> {
        match self.ack_index.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_ack_index_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, AckTarget>> {
        match self.ack_index.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn get_channel(&self, name: &str) -> Option<Arc<Channel>> {
        let map = match self.channels.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(name).cloned()
    }

    pub(crate) fn get_or_create_channel(
        self: &Arc<Self>,
        name: &str,
    ) -> Result<Arc<Channel>, BrokerError> {
        if let Some(channel) = self.get_channel(name) {
            return Ok(channel);
        }
        let stores = self.store.create_channel(name)?;
        Ok(self.install_channel(name, stores))
    }

    /// Wire a channel into the map and start its delivery loop. Idempotent
    /// under the map's write lock.
    pub(crate) fn install_channel(
        self: &Arc<Self>,
        name: &str,
        stores: ChannelStores,
    ) -> Arc<Channel> {
        let mut map = match self.channels.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = map.get(name) {
            return Arc::clone(existing);
        }
        let (delivery_tx, delivery_rx) = unbounded();
        let channel = Arc::new(Channel::new(name.to_string(), stores, delivery_tx));
        let handle = spawn_delivery_loop(
            DeliveryCtx {
                channel: Arc::clone(&channel),
                transport: Arc::clone(&self.transport),
                redelivery_tx: self.redelivery_tx.clone(),
            },
            delivery_rx,
            self.shutdown_rx.clone(),
        );
        self.lock_threads().push(handle);
        map.insert(name.to_string(), Arc::clone(&channel));
        channel
    }

    /// Remove a client and cascade over its subscriptions: durables park,
    /// everything else is deleted.
    pub(crate) fn drop_client(&self, client_id: &str) -> Result<(), BrokerError> {
        let client = self
            .clients
            .remove(client_id)
            .ok_or_else(|| BrokerError::UnknownClient {
                id: client_id.to_string(),
            })?;
        client.online.store(false, Ordering::SeqCst);
        let _ = self.hb_tx.send(HeartbeatCmd::Unwatch {
            client_id: client_id.to_string(),
        });

        let subs: Vec<(String, u64)> = {
            let mut list = match client.subs.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            list.drain(..).collect()
        };
        for (channel_name, sub_id) in subs {
            if let Some(channel) = self.get_channel(&channel_name) {
                if let Err(e) = self.detach_sub(&channel, sub_id, DetachMode::ClientClose) {
                    warn!(channel = %channel_name, sub_id, error = %e, "detach failed");
                }
            }
        }
        self.store.delete_client(client_id)?;
        info!(client_id, "client removed");
        Ok(())
    }

    /// Take one subscription out of delivery. `Unsubscribe` deletes it;
    /// `ClientClose` parks durables (plain and queue) instead.
    pub(crate) fn detach_sub(
        &self,
        channel: &Arc<Channel>,
        sub_id: u64,
        mode: DetachMode,
    ) -> Result<(), BrokerError> {
        let mut registry = channel.subs();
        let Some(sub) = registry.by_id.get(&sub_id).cloned() else {
            return Ok(());
        };
        let (queue_group, durable_name, ack_inbox, is_durable) = {
            let inner = sub.lock();
            (
                inner.state.queue_group.clone(),
                inner.state.durable_name.clone(),
                inner.state.ack_inbox.clone(),
                inner.state.is_durable,
            )
        };
        self.lock_ack_index_mut().remove(&ack_inbox);
        let _ = self.redelivery_tx.send(RedeliveryCmd::Cancel {
            key: (channel.name.clone(), sub_id),
        });

        if let Some(queue) = queue_group {
            let key = queue_key(&queue, durable_name.as_deref());
            self.queue_member_leave(channel, &mut registry, &key, &sub, mode)?;
        } else if is_durable && mode == DetachMode::ClientClose {
            sub.lock().offline = true;
            registry.park_durable(sub_id);
        } else {
            registry.remove_plain(sub_id);
            sub.lock().deleted = true;
            channel.stores.subs.delete_sub(sub_id)?;
        }
        Ok(())
    }

    fn queue_member_leave(
        &self,
        channel: &Arc<Channel>,
        registry: &mut channel::SubRegistry,
        key: &str,
        sub: &Arc<Subscription>,
        mode: DetachMode,
    ) -> Result<(), BrokerError> {
        let sub_id = sub.sub_id();
        registry.by_id.remove(&sub_id);
        let Some(group) = registry.queues.get_mut(key) else {
            sub.lock().deleted = true;
            channel.stores.subs.delete_sub(sub_id)?;
            return Ok(());
        };
        group.members.retain(|m| m.sub_id() != sub_id);

        let (state, pending) = {
            let mut inner = sub.lock();
            inner.deleted = true;
            let pending: Vec<u64> = std::mem::take(&mut inner.acks_pending)
                .into_keys()
                .collect();
            (inner.state.clone(), pending)
        };

        if group.members.is_empty() {
            let park = group.is_durable && mode == DetachMode::ClientClose;
            if park {
                // Park the record; the next joining member takes it over.
                group.last_sent = group.last_sent.max(state.last_sent);
                group.shadow = Some(ShadowState {
                    pending: pending.into_iter().collect(),
                    state,
                });
                return Ok(());
            }
            registry.queues.remove(key);
            channel.stores.subs.delete_sub(sub_id)?;
            return Ok(());
        }

        // Hand the leaver's in-flight messages to the remaining members.
        let now = now_ns();
        let members = group.members.clone();
        for seq in pending {
            let target = members
                .iter()
                .min_by_key(|m| m.lock().acks_pending.len())
                .expect("members is non-empty");
            channel.stores.subs.add_seq_pending(target.sub_id(), seq)?;
            let (inbox, count) = {
                let mut inner = target.lock();
                let count = inner.note_redelivered(seq);
                inner.note_sent(seq, now);
                (inner.state.inbox.clone(), count)
            };
            match channel.stores.msgs.lookup(seq) {
                Ok(Some(msg)) => {
                    publish_msg(&self.transport, &channel.name, &inbox, &msg, true, count)
                }
                Ok(None) => {}
                Err(e) => warn!(seq, error = %e, "transfer lookup failed"),
            }
            let _ = self.redelivery_tx.send(RedeliveryCmd::Schedule {
                key: (channel.name.clone(), target.sub_id()),
                deadline_ns: now + target.lock().state.ack_wait_ns,
            });
        }
        channel.stores.subs.delete_sub(sub_id)?;
        Ok(())
    }
}

fn clients_push_sub(client: &Arc<Client>, channel: &str, sub_id: u64) {
    let mut list = match client.subs.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    list.push((channel.to_string(), sub_id));
}

fn clients_remove_sub(client: &Arc<Client>, channel: &str, sub_id: u64) {
    let mut list = match client.subs.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    list.retain(|(c, s)| !(c == channel && *s == sub_id));
}
