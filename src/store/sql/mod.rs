//! Relational back-end on SQLite.
//!
//! Six tables: `server_info` (single row pinned by a constant `uniquerow`
//! column), `clients`, `channels`, `messages`, `subscriptions` (proto BLOB,
//! soft-deleted), `subs_pending`. Statements go through the connection's
//! prepared-statement cache; `init` and `delete_sub` are transactional.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{bounded, Sender};
use rusqlite::{params, Connection, OptionalExtension};

use crate::core::{now_ns, ClientInfo, Message, ServerInfo, StoreLimits, PROTOCOL_VERSION};
use crate::store::{
    ChannelStores, MessageStore, RecoveredChannel, RecoveredState, RecoveredSubscription, Store,
    StoreError, SubState, SubStore,
};

const BUSY_TIMEOUT_MS: u64 = 5_000;
const NOW_TICK_INTERVAL: Duration = Duration::from_millis(250);

pub struct SqlStore {
    conn: Arc<Mutex<Connection>>,
    limits: Arc<RwLock<StoreLimits>>,
    next_sub_id: Arc<AtomicU64>,
    /// Monotonic wall clock maintained by the ticker thread; reads take the
    /// max of this and the live clock so time never runs backward.
    now_floor: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    channels: Mutex<HashMap<String, ChannelStores>>,
    ticker_stop: Sender<()>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl SqlStore {
    pub fn open(path: impl AsRef<Path>, limits: StoreLimits) -> Result<Self, StoreError> {
        limits.validate()?;
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        initialize_schema(&conn)?;

        // Sub ids are never reused: the allocator starts past every id ever
        // written, soft-deleted rows included.
        let max_sub_id: i64 =
            conn.query_row("SELECT COALESCE(MAX(subid), 0) FROM subscriptions", [], |r| {
                r.get(0)
            })?;

        let now_floor = Arc::new(AtomicU64::new(now_ns()));
        let closed = Arc::new(AtomicBool::new(false));
        let (ticker_stop, stop_rx) = bounded::<()>(1);
        let ticker = {
            let now_floor = Arc::clone(&now_floor);
            std::thread::Builder::new()
                .name("sqlstore-now".to_string())
                .spawn(move || loop {
                    match stop_rx.recv_timeout(NOW_TICK_INTERVAL) {
                        Ok(()) | Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                        Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                            now_floor.fetch_max(now_ns(), Ordering::SeqCst);
                        }
                    }
                })
                .expect("spawn sqlstore ticker")
        };

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            limits: Arc::new(RwLock::new(limits)),
            next_sub_id: Arc::new(AtomicU64::new(max_sub_id as u64)),
            now_floor,
            closed,
            channels: Mutex::new(HashMap::new()),
            ticker_stop,
            ticker: Mutex::new(Some(ticker)),
        })
    }

    /// In-memory store, for tests.
    pub fn open_in_memory(limits: StoreLimits) -> Result<Self, StoreError> {
        Self::open(":memory:", limits)
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        lock_ignore_poison(&self.conn)
    }

    fn build_channel(
        &self,
        conn: &Connection,
        id: u64,
        name: &str,
    ) -> Result<ChannelStores, StoreError> {
        let cache = MsgCache::load(conn, id)?;
        let msgs = Arc::new(SqlMsgStore {
            conn: Arc::clone(&self.conn),
            channel_id: id,
            channel: name.to_string(),
            limits: Arc::clone(&self.limits),
            now_floor: Arc::clone(&self.now_floor),
            cache: Mutex::new(cache),
        });
        msgs.enforce_caps_locked(conn, &mut lock_ignore_poison(&msgs.cache))?;
        let subs = Arc::new(SqlSubStore {
            conn: Arc::clone(&self.conn),
            channel_id: id,
            channel: name.to_string(),
            limits: Arc::clone(&self.limits),
            next_sub_id: Arc::clone(&self.next_sub_id),
        });
        let stores = ChannelStores { id, msgs, subs };
        lock_ignore_poison(&self.channels).insert(name.to_string(), stores.clone());
        Ok(stores)
    }
}

impl Store for SqlStore {
    fn init(&self, info: &ServerInfo) -> Result<(), StoreError> {
        self.check_open()?;
        let conn = self.lock_conn();
        let stored: Option<(Vec<u8>, i64)> = conn
            .query_row(
                "SELECT proto, version FROM server_info WHERE uniquerow = 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        if let Some((proto, version)) = stored {
            if version as u32 > PROTOCOL_VERSION {
                return Err(StoreError::VersionMismatch {
                    stored: version as u32,
                    supported: PROTOCOL_VERSION,
                });
            }
            let old: ServerInfo = serde_json::from_slice(&proto)
                .map_err(|e| StoreError::corrupt(format!("unparseable server info: {e}")))?;
            if old.cluster_id != info.cluster_id {
                return Err(StoreError::ClusterIdMismatch {
                    stored: old.cluster_id,
                    configured: info.cluster_id.clone(),
                });
            }
        }

        let proto = serde_json::to_vec(info)
            .map_err(|e| StoreError::corrupt(format!("server info encode failed: {e}")))?;
        conn.prepare_cached(
            "INSERT INTO server_info (uniquerow, id, proto, version) VALUES (1, ?1, ?2, ?3) \
             ON CONFLICT(uniquerow) DO UPDATE SET id = excluded.id, proto = excluded.proto, \
             version = excluded.version",
        )?
        .execute(params![info.cluster_id, proto, info.proto_version as i64])?;
        Ok(())
    }

    fn recover(&self) -> Result<Option<RecoveredState>, StoreError> {
        self.check_open()?;
        let channel_rows: Vec<(u64, String)>;
        let info: ServerInfo;
        let clients: Vec<ClientInfo>;
        {
            let conn = self.lock_conn();
            let stored: Option<(Vec<u8>, i64)> = conn
                .query_row(
                    "SELECT proto, version FROM server_info WHERE uniquerow = 1",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let Some((proto, version)) = stored else {
                return Ok(None);
            };
            if version as u32 > PROTOCOL_VERSION {
                return Err(StoreError::VersionMismatch {
                    stored: version as u32,
                    supported: PROTOCOL_VERSION,
                });
            }
            info = serde_json::from_slice(&proto)
                .map_err(|e| StoreError::corrupt(format!("unparseable server info: {e}")))?;

            let mut stmt = conn.prepare_cached("SELECT id, hbinbox FROM clients ORDER BY id")?;
            clients = stmt
                .query_map([], |r| {
                    Ok(ClientInfo {
                        client_id: r.get(0)?,
                        heartbeat_inbox: r.get(1)?,
                    })
                })?
                .collect::<Result<_, _>>()?;

            let mut stmt = conn
                .prepare_cached("SELECT id, name FROM channels WHERE deleted = 0 ORDER BY id")?;
            channel_rows = stmt
                .query_map([], |r| Ok((r.get::<_, i64>(0)? as u64, r.get(1)?)))?
                .collect::<Result<_, _>>()?;
        }

        let mut channels = BTreeMap::new();
        for (id, name) in channel_rows {
            let stores = {
                let conn = self.lock_conn();
                self.build_channel(&conn, id, &name)?
            };
            let subscriptions = {
                let conn = self.lock_conn();
                load_subscriptions(&conn, id)?
            };
            channels.insert(
                name,
                RecoveredChannel {
                    first_seq: stores.msgs.first_seq(),
                    last_seq: stores.msgs.last_seq(),
                    stores,
                    subscriptions,
                },
            );
        }

        Ok(Some(RecoveredState {
            info,
            clients,
            channels,
        }))
    }

    fn create_channel(&self, name: &str) -> Result<ChannelStores, StoreError> {
        self.check_open()?;
        if let Some(existing) = lock_ignore_poison(&self.channels).get(name).cloned() {
            return Ok(existing);
        }

        let conn = self.lock_conn();
        let existing: Option<i64> = conn
            .prepare_cached("SELECT id FROM channels WHERE name = ?1 AND deleted = 0")?
            .query_row(params![name], |r| r.get(0))
            .optional()?;
        if let Some(id) = existing {
            return self.build_channel(&conn, id as u64, name);
        }

        let max_channels = match self.limits.read() {
            Ok(limits) => limits.max_channels,
            Err(poisoned) => poisoned.into_inner().max_channels,
        };
        if max_channels > 0 {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM channels WHERE deleted = 0",
                [],
                |r| r.get(0),
            )?;
            if count >= max_channels {
                return Err(StoreError::ChannelLimitReached { max: max_channels });
            }
        }

        conn.prepare_cached(
            "INSERT INTO channels (id, name, maxseq, deleted) \
             VALUES ((SELECT COALESCE(MAX(id), 0) + 1 FROM channels), ?1, 0, 0)",
        )?
        .execute(params![name])?;
        let id: i64 = conn.query_row(
            "SELECT id FROM channels WHERE name = ?1",
            params![name],
            |r| r.get(0),
        )?;
        self.build_channel(&conn, id as u64, name)
    }

    fn add_client(&self, client: &ClientInfo) -> Result<(), StoreError> {
        self.check_open()?;
        let conn = self.lock_conn();
        conn.prepare_cached(
            "INSERT INTO clients (id, hbinbox) VALUES (?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET hbinbox = excluded.hbinbox",
        )?
        .execute(params![client.client_id, client.heartbeat_inbox])?;
        Ok(())
    }

    fn delete_client(&self, client_id: &str) -> Result<(), StoreError> {
        self.check_open()?;
        let conn = self.lock_conn();
        conn.prepare_cached("DELETE FROM clients WHERE id = ?1")?
            .execute(params![client_id])?;
        Ok(())
    }

    fn set_limits(&self, limits: &StoreLimits) -> Result<(), StoreError> {
        self.check_open()?;
        limits.validate()?;
        match self.limits.write() {
            Ok(mut slot) => *slot = limits.clone(),
            Err(poisoned) => *poisoned.into_inner() = limits.clone(),
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.ticker_stop.try_send(());
        if let Some(handle) = lock_ignore_poison(&self.ticker).take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS server_info (
           uniquerow INTEGER PRIMARY KEY CHECK (uniquerow = 1),
           id TEXT NOT NULL,
           proto BLOB NOT NULL,
           version INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS clients (
           id TEXT PRIMARY KEY,
           hbinbox TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS channels (
           id INTEGER PRIMARY KEY,
           name TEXT NOT NULL UNIQUE,
           maxseq INTEGER NOT NULL DEFAULT 0,
           deleted INTEGER NOT NULL DEFAULT 0
         );
         CREATE TABLE IF NOT EXISTS messages (
           id INTEGER NOT NULL,
           seq INTEGER NOT NULL,
           timestamp INTEGER NOT NULL,
           expiration INTEGER NOT NULL,
           size INTEGER NOT NULL,
           data BLOB NOT NULL,
           PRIMARY KEY (id, seq)
         );
         CREATE INDEX IF NOT EXISTS messages_by_timestamp
           ON messages (id, timestamp);
         CREATE TABLE IF NOT EXISTS subscriptions (
           id INTEGER NOT NULL,
           subid INTEGER NOT NULL,
           proto BLOB NOT NULL,
           deleted INTEGER NOT NULL DEFAULT 0,
           PRIMARY KEY (id, subid)
         );
         CREATE TABLE IF NOT EXISTS subs_pending (
           subid INTEGER NOT NULL,
           seq INTEGER NOT NULL,
           PRIMARY KEY (subid, seq)
         );",
    )?;
    Ok(())
}

fn load_subscriptions(
    conn: &Connection,
    channel_id: u64,
) -> Result<Vec<RecoveredSubscription>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT proto FROM subscriptions WHERE id = ?1 AND deleted = 0 ORDER BY subid",
    )?;
    let protos: Vec<Vec<u8>> = stmt
        .query_map(params![channel_id as i64], |r| r.get(0))?
        .collect::<Result<_, _>>()?;

    let mut out = Vec::with_capacity(protos.len());
    for proto in protos {
        let state: SubState = serde_json::from_slice(&proto)
            .map_err(|e| StoreError::corrupt(format!("unparseable subscription: {e}")))?;
        let mut pending_stmt = conn.prepare_cached(
            "SELECT seq FROM subs_pending WHERE subid = ?1 ORDER BY seq",
        )?;
        let pending = pending_stmt
            .query_map(params![state.sub_id as i64], |r| {
                r.get::<_, i64>(0).map(|s| s as u64)
            })?
            .collect::<Result<_, _>>()?;
        out.push(RecoveredSubscription { state, pending });
    }
    Ok(out)
}

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct MsgCache {
    first_seq: u64,
    last_seq: u64,
    last_timestamp: u64,
    count: u64,
    bytes: u64,
}

impl MsgCache {
    fn load(conn: &Connection, channel_id: u64) -> Result<Self, StoreError> {
        let maxseq: i64 = conn.query_row(
            "SELECT maxseq FROM channels WHERE id = ?1",
            params![channel_id as i64],
            |r| r.get(0),
        )?;
        let (count, bytes, min_seq, max_seq, max_ts): (i64, i64, Option<i64>, Option<i64>, Option<i64>) =
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(size), 0), MIN(seq), MAX(seq), MAX(timestamp) \
                 FROM messages WHERE id = ?1",
                params![channel_id as i64],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                    ))
                },
            )?;
        let last_seq = (maxseq as u64).max(max_seq.unwrap_or(0) as u64);
        Ok(Self {
            first_seq: min_seq.map(|s| s as u64).unwrap_or(last_seq + 1),
            last_seq,
            last_timestamp: max_ts.unwrap_or(0) as u64,
            count: count as u64,
            bytes: bytes as u64,
        })
    }
}

struct SqlMsgStore {
    conn: Arc<Mutex<Connection>>,
    channel_id: u64,
    channel: String,
    limits: Arc<RwLock<StoreLimits>>,
    now_floor: Arc<AtomicU64>,
    cache: Mutex<MsgCache>,
}

impl SqlMsgStore {
    fn channel_limits(&self) -> crate::core::ChannelLimits {
        match self.limits.read() {
            Ok(limits) => limits.limits_for(&self.channel),
            Err(poisoned) => poisoned.into_inner().limits_for(&self.channel),
        }
    }

    fn monotonic_now(&self) -> u64 {
        self.now_floor.fetch_max(now_ns(), Ordering::SeqCst).max(now_ns())
    }

    /// Evict oldest rows until count/byte caps hold. Also run after
    /// recovery so pre-crash evictions cannot resurface.
    fn enforce_caps_locked(
        &self,
        conn: &Connection,
        cache: &mut MsgCache,
    ) -> Result<(), StoreError> {
        let limits = self.channel_limits();
        loop {
            let over_count = limits.max_msgs > 0 && cache.count as i64 > limits.max_msgs;
            let over_bytes = limits.max_bytes > 0 && cache.bytes as i64 > limits.max_bytes;
            if !(over_count || over_bytes) || cache.count == 0 {
                return Ok(());
            }
            let size: i64 = conn.query_row(
                "SELECT size FROM messages WHERE id = ?1 AND seq = ?2",
                params![self.channel_id as i64, cache.first_seq as i64],
                |r| r.get(0),
            )?;
            conn.prepare_cached("DELETE FROM messages WHERE id = ?1 AND seq = ?2")?
                .execute(params![self.channel_id as i64, cache.first_seq as i64])?;
            cache.count -= 1;
            cache.bytes -= size as u64;
            cache.first_seq = match conn
                .prepare_cached("SELECT MIN(seq) FROM messages WHERE id = ?1")?
                .query_row(params![self.channel_id as i64], |r| r.get::<_, Option<i64>>(0))?
            {
                Some(seq) => seq as u64,
                None => cache.last_seq + 1,
            };
        }
    }
}

impl MessageStore for SqlMsgStore {
    fn store(&self, data: Bytes) -> Result<u64, StoreError> {
        let limits = self.channel_limits();
        let conn = lock_ignore_poison(&self.conn);
        let mut cache = lock_ignore_poison(&self.cache);

        let seq = cache.last_seq + 1;
        let timestamp_ns = self.monotonic_now().max(cache.last_timestamp);
        let expiration_ns = if limits.max_age_ns > 0 {
            timestamp_ns + limits.max_age_ns as u64
        } else {
            0
        };

        conn.prepare_cached(
            "INSERT INTO messages (id, seq, timestamp, expiration, size, data) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?
        .execute(params![
            self.channel_id as i64,
            seq as i64,
            timestamp_ns as i64,
            expiration_ns as i64,
            data.len() as i64,
            data.as_ref(),
        ])?;
        conn.prepare_cached("UPDATE channels SET maxseq = ?1 WHERE id = ?2")?
            .execute(params![seq as i64, self.channel_id as i64])?;

        if cache.count == 0 {
            cache.first_seq = seq;
        }
        cache.last_seq = seq;
        cache.last_timestamp = timestamp_ns;
        cache.count += 1;
        cache.bytes += data.len() as u64;

        self.enforce_caps_locked(&conn, &mut cache)?;
        Ok(seq)
    }

    fn lookup(&self, seq: u64) -> Result<Option<Message>, StoreError> {
        let now = self.monotonic_now();
        let conn = lock_ignore_poison(&self.conn);
        let row: Option<(i64, i64, Vec<u8>)> = conn
            .prepare_cached(
                "SELECT timestamp, expiration, data FROM messages \
                 WHERE id = ?1 AND seq = ?2 AND (expiration = 0 OR expiration > ?3)",
            )?
            .query_row(
                params![self.channel_id as i64, seq as i64, now as i64],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        Ok(row.map(|(timestamp, expiration, data)| Message {
            seq,
            timestamp_ns: timestamp as u64,
            expiration_ns: expiration as u64,
            data: Bytes::from(data),
        }))
    }

    fn first_seq(&self) -> u64 {
        lock_ignore_poison(&self.cache).first_seq
    }

    fn last_seq(&self) -> u64 {
        lock_ignore_poison(&self.cache).last_seq
    }

    fn first_msg(&self) -> Result<Option<Message>, StoreError> {
        let now = self.monotonic_now();
        let conn = lock_ignore_poison(&self.conn);
        let row: Option<(i64, i64, i64, Vec<u8>)> = conn
            .prepare_cached(
                "SELECT seq, timestamp, expiration, data FROM messages \
                 WHERE id = ?1 AND (expiration = 0 OR expiration > ?2) \
                 ORDER BY seq ASC LIMIT 1",
            )?
            .query_row(params![self.channel_id as i64, now as i64], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
            })
            .optional()?;
        Ok(row.map(|(seq, timestamp, expiration, data)| Message {
            seq: seq as u64,
            timestamp_ns: timestamp as u64,
            expiration_ns: expiration as u64,
            data: Bytes::from(data),
        }))
    }

    fn last_msg(&self) -> Result<Option<Message>, StoreError> {
        let seq = self.last_seq();
        self.lookup(seq)
    }

    fn seq_for_timestamp(&self, ts_ns: u64) -> Result<u64, StoreError> {
        let conn = lock_ignore_poison(&self.conn);
        let seq: Option<i64> = conn
            .prepare_cached(
                "SELECT MIN(seq) FROM messages WHERE id = ?1 AND timestamp >= ?2",
            )?
            .query_row(params![self.channel_id as i64, ts_ns as i64], |r| {
                r.get::<_, Option<i64>>(0)
            })?;
        match seq {
            Some(seq) => Ok(seq as u64),
            None => Ok(self.last_seq() + 1),
        }
    }

    fn expire(&self, now_ns: u64) -> Result<Option<u64>, StoreError> {
        let conn = lock_ignore_poison(&self.conn);
        let mut cache = lock_ignore_poison(&self.cache);

        conn.prepare_cached(
            "DELETE FROM messages WHERE id = ?1 AND expiration > 0 AND expiration <= ?2",
        )?
        .execute(params![self.channel_id as i64, now_ns as i64])?;

        let (count, bytes, min_seq): (i64, i64, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0), MIN(seq) FROM messages WHERE id = ?1",
            params![self.channel_id as i64],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        cache.count = count as u64;
        cache.bytes = bytes as u64;
        cache.first_seq = min_seq.map(|s| s as u64).unwrap_or(cache.last_seq + 1);

        let next: Option<i64> = conn
            .prepare_cached(
                "SELECT MIN(expiration) FROM messages WHERE id = ?1 AND expiration > 0",
            )?
            .query_row(params![self.channel_id as i64], |r| {
                r.get::<_, Option<i64>>(0)
            })?;
        Ok(next.map(|n| n as u64))
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct SqlSubStore {
    conn: Arc<Mutex<Connection>>,
    channel_id: u64,
    channel: String,
    limits: Arc<RwLock<StoreLimits>>,
    next_sub_id: Arc<AtomicU64>,
}

impl SubStore for SqlSubStore {
    fn create_sub(&self, state: &mut SubState) -> Result<(), StoreError> {
        let max_subs = match self.limits.read() {
            Ok(limits) => limits.limits_for(&self.channel).max_subscriptions,
            Err(poisoned) => poisoned
                .into_inner()
                .limits_for(&self.channel)
                .max_subscriptions,
        };
        let conn = lock_ignore_poison(&self.conn);
        if max_subs > 0 {
            let count: i64 = conn
                .prepare_cached(
                    "SELECT COUNT(*) FROM subscriptions WHERE id = ?1 AND deleted = 0",
                )?
                .query_row(params![self.channel_id as i64], |r| r.get(0))?;
            if count >= max_subs {
                return Err(StoreError::SubscriptionLimitReached { max: max_subs });
            }
        }

        if state.sub_id == 0 {
            state.sub_id = self.next_sub_id.fetch_add(1, Ordering::SeqCst) + 1;
        } else {
            self.next_sub_id.fetch_max(state.sub_id, Ordering::SeqCst);
        }
        let proto = encode_sub(state)?;
        conn.prepare_cached(
            "INSERT INTO subscriptions (id, subid, proto, deleted) VALUES (?1, ?2, ?3, 0)",
        )?
        .execute(params![
            self.channel_id as i64,
            state.sub_id as i64,
            proto
        ])?;
        Ok(())
    }

    fn update_sub(&self, state: &SubState) -> Result<(), StoreError> {
        let proto = encode_sub(state)?;
        let conn = lock_ignore_poison(&self.conn);
        conn.prepare_cached(
            "UPDATE subscriptions SET proto = ?1 WHERE id = ?2 AND subid = ?3",
        )?
        .execute(params![proto, self.channel_id as i64, state.sub_id as i64])?;
        Ok(())
    }

    fn delete_sub(&self, sub_id: u64) -> Result<(), StoreError> {
        let mut conn = lock_ignore_poison(&self.conn);
        let tx = conn.transaction()?;
        tx.prepare_cached(
            "UPDATE subscriptions SET deleted = 1 WHERE id = ?1 AND subid = ?2",
        )?
        .execute(params![self.channel_id as i64, sub_id as i64])?;
        tx.prepare_cached("DELETE FROM subs_pending WHERE subid = ?1")?
            .execute(params![sub_id as i64])?;
        tx.commit()?;
        Ok(())
    }

    fn add_seq_pending(&self, sub_id: u64, seq: u64) -> Result<(), StoreError> {
        let conn = lock_ignore_poison(&self.conn);
        conn.prepare_cached(
            "INSERT OR IGNORE INTO subs_pending (subid, seq) VALUES (?1, ?2)",
        )?
        .execute(params![sub_id as i64, seq as i64])?;
        Ok(())
    }

    fn ack_seq_pending(&self, sub_id: u64, seq: u64) -> Result<(), StoreError> {
        let conn = lock_ignore_poison(&self.conn);
        conn.prepare_cached("DELETE FROM subs_pending WHERE subid = ?1 AND seq = ?2")?
            .execute(params![sub_id as i64, seq as i64])?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn encode_sub(state: &SubState) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(state)
        .map_err(|e| StoreError::corrupt(format!("subscription encode failed: {e}")))
}
