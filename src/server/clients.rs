//! Client registry and heartbeat scheduling.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{after, bounded, never, Receiver, Sender};
use crossbeam::select;
use tracing::{info, warn};

use super::ServerShared;
use crate::core::{now_ns, ClientInfo};
use crate::server::transport::Transport;

pub(crate) struct Client {
    pub info: Mutex<ClientInfo>,
    /// (channel, sub_id) pairs owned by this client.
    pub subs: Mutex<Vec<(String, u64)>>,
    /// Recovered clients stay offline until they reconnect; heartbeats only
    /// probe online clients.
    pub online: AtomicBool,
    pub hb_failures: AtomicU32,
}

impl Client {
    pub fn new(info: ClientInfo, online: bool) -> Arc<Self> {
        Arc::new(Self {
            info: Mutex::new(info),
            subs: Mutex::new(Vec::new()),
            online: AtomicBool::new(online),
            hb_failures: AtomicU32::new(0),
        })
    }

    pub fn heartbeat_inbox(&self) -> String {
        lock_ignore_poison(&self.info).heartbeat_inbox.clone()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

pub(crate) struct ClientRegistry {
    clients: Mutex<HashMap<String, Arc<Client>>>,
    permit_tx: Sender<()>,
    permit_rx: Receiver<()>,
}

impl ClientRegistry {
    /// `max_probes` bounds concurrent duplicate-id probes; surplus connect
    /// attempts queue on the permit channel.
    pub fn new(max_probes: usize) -> Self {
        let capacity = max_probes.max(1);
        let (permit_tx, permit_rx) = bounded(capacity);
        for _ in 0..capacity {
            permit_tx.send(()).expect("fill probe permits");
        }
        Self {
            clients: Mutex::new(HashMap::new()),
            permit_tx,
            permit_rx,
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Client>> {
        lock_ignore_poison(&self.clients).get(client_id).cloned()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        lock_ignore_poison(&self.clients).contains_key(client_id)
    }

    pub fn insert(&self, client_id: String, client: Arc<Client>) {
        lock_ignore_poison(&self.clients).insert(client_id, client);
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<Client>> {
        lock_ignore_poison(&self.clients).remove(client_id)
    }

    pub fn acquire_probe_permit(&self) {
        let _ = self.permit_rx.recv();
    }

    pub fn release_probe_permit(&self) {
        let _ = self.permit_tx.try_send(());
    }
}

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) enum HeartbeatCmd {
    Watch { client_id: String },
    Unwatch { client_id: String },
}

/// Heartbeat scheduler: a deadline heap over online clients. Each firing
/// probes the client's heartbeat inbox; enough consecutive timeouts evict
/// the client (non-durable subscriptions cascade-closed).
pub(crate) fn spawn_heartbeat_loop(
    shared: Arc<ServerShared>,
    cmd_rx: Receiver<HeartbeatCmd>,
    shutdown: Receiver<()>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("heartbeats".to_string())
        .spawn(move || {
            let interval_ns = shared.opts.hb_interval.as_nanos() as u64;
            let mut pending: HashMap<String, u64> = HashMap::new();
            let mut heap: BinaryHeap<Reverse<(u64, String)>> = BinaryHeap::new();

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
                        Ok(HeartbeatCmd::Watch { client_id }) => {
                            let deadline = now_ns() + interval_ns;
                            pending.insert(client_id.clone(), deadline);
                            heap.push(Reverse((deadline, client_id)));
                        }
                        Ok(HeartbeatCmd::Unwatch { client_id }) => {
                            pending.remove(&client_id);
                        }
                        Err(_) => break,
                    },
                    recv(timer) -> _ => {
                        let now = now_ns();
                        loop {
                            pop_stale(&mut heap, &pending);
                            let due = matches!(
                                heap.peek(),
                                Some(Reverse((deadline_ns, _))) if *deadline_ns <= now
                            );
                            if !due {
                                break;
                            }
                            let Some(Reverse((_, client_id))) = heap.pop() else { break };
                            pending.remove(&client_id);
                            if let Some(next) = probe(&shared, &client_id) {
                                pending.insert(client_id.clone(), next);
                                heap.push(Reverse((next, client_id)));
                            }
                        }
                    }
                    recv(shutdown) -> _ => break,
                }
            }
        })
        .expect("spawn heartbeat thread")
}

fn pop_stale(heap: &mut BinaryHeap<Reverse<(u64, String)>>, pending: &HashMap<String, u64>) {
    while let Some(Reverse((deadline_ns, client_id))) = heap.peek() {
        match pending.get(client_id) {
            Some(current) if current == deadline_ns => break,
            _ => {
                let _ = heap.pop();
            }
        }
    }
}

/// Probe one client. Returns the next deadline, or `None` to stop watching.
fn probe(shared: &Arc<ServerShared>, client_id: &str) -> Option<u64> {
    let client = shared.clients.get(client_id)?;
    if !client.is_online() {
        return None;
    }
    let inbox = client.heartbeat_inbox();
    match shared
        .transport
        .request(&inbox, Bytes::new(), shared.opts.hb_timeout)
    {
        Ok(_) => {
            client.hb_failures.store(0, Ordering::SeqCst);
            Some(now_ns() + shared.opts.hb_interval.as_nanos() as u64)
        }
        Err(_) => {
            let failures = client.hb_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= shared.opts.max_failed_hb {
                warn!(client_id, failures, "heartbeat limit reached, evicting client");
                if let Err(e) = shared.drop_client(client_id) {
                    warn!(client_id, error = %e, "eviction failed");
                }
                None
            } else {
                info!(client_id, failures, "heartbeat missed");
                Some(now_ns() + shared.opts.hb_interval.as_nanos() as u64)
            }
        }
    }
}
