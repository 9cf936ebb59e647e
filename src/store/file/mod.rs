//! Append-only file back-end.
//!
//! Layout under the store root:
//! - `server.dat` — identity, client, and channel registration log
//! - `c:<name>/msgs.<first_seq>.dat` — segmented message log per channel
//! - `c:<name>/subs.dat` — subscription log per channel

mod frame;
mod msglog;
mod sublog;

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use self::frame::{write_frame, FrameOutcome, FrameReader};
use self::msglog::MsgLog;
use self::sublog::SubLog;
use crate::core::{ClientInfo, Message, ServerInfo, StoreLimits, PROTOCOL_VERSION};
use crate::store::{
    ChannelStores, MessageStore, RecoveredChannel, RecoveredState, Store, StoreError, SubState,
    SubStore,
};

const SERVER_LOG: &str = "server.dat";
const CHANNEL_DIR_PREFIX: &str = "c:";

const REC_INFO: u8 = 1;
const REC_CLIENT_ADD: u8 = 2;
const REC_CLIENT_DEL: u8 = 3;
const REC_CHANNEL: u8 = 4;

#[derive(Serialize, Deserialize)]
struct ChannelRecord {
    id: u64,
    name: String,
}

pub struct FileStore {
    root: PathBuf,
    limits: Arc<RwLock<StoreLimits>>,
    segment_max_bytes: u64,
    next_sub_id: Arc<AtomicU64>,
    closed: AtomicBool,
    inner: Mutex<FileStoreInner>,
}

struct FileStoreInner {
    server_log: Option<File>,
    info: Option<ServerInfo>,
    clients: BTreeMap<String, ClientInfo>,
    channel_ids: BTreeMap<String, u64>,
    channels: HashMap<String, ChannelStores>,
    sublogs: HashMap<String, Arc<SubLog>>,
    next_channel_id: u64,
}

impl FileStore {
    pub fn open(
        root: impl Into<PathBuf>,
        limits: StoreLimits,
        segment_max_bytes: u64,
    ) -> Result<Self, StoreError> {
        limits.validate()?;
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;

        let mut inner = FileStoreInner {
            server_log: None,
            info: None,
            clients: BTreeMap::new(),
            channel_ids: BTreeMap::new(),
            channels: HashMap::new(),
            sublogs: HashMap::new(),
            next_channel_id: 1,
        };
        let log_path = root.join(SERVER_LOG);
        if log_path.exists() {
            load_server_log(&log_path, &mut inner)?;
        }

        Ok(Self {
            root,
            limits: Arc::new(RwLock::new(limits)),
            segment_max_bytes,
            next_sub_id: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FileStoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn channel_dir(&self, name: &str) -> PathBuf {
        self.root.join(format!("{CHANNEL_DIR_PREFIX}{name}"))
    }

    fn append_record(
        &self,
        inner: &mut FileStoreInner,
        kind: u8,
        body: &[u8],
    ) -> Result<(), StoreError> {
        let path = self.root.join(SERVER_LOG);
        if inner.server_log.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(&path)
                .map_err(|e| StoreError::io(&path, e))?;
            inner.server_log = Some(file);
        }
        let file = inner.server_log.as_mut().expect("server log just opened");
        let mut payload = Vec::with_capacity(1 + body.len());
        payload.push(kind);
        payload.extend_from_slice(body);
        write_frame(file, &payload).map_err(|e| match e {
            StoreError::Io { path: None, source } => StoreError::io(&path, source),
            other => other,
        })?;
        file.sync_data().map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    fn instantiate_channel(
        &self,
        inner: &mut FileStoreInner,
        name: &str,
        id: u64,
    ) -> Result<ChannelStores, StoreError> {
        let dir = self.channel_dir(name);
        let msgs = MsgLog::open(
            dir.clone(),
            name.to_string(),
            Arc::clone(&self.limits),
            self.segment_max_bytes,
        )?;
        let subs = Arc::new(SubLog::open(
            dir.join("subs.dat"),
            name.to_string(),
            Arc::clone(&self.limits),
            Arc::clone(&self.next_sub_id),
        )?);
        let stores = ChannelStores {
            id,
            msgs: Arc::new(FileMsgStore { log: msgs }),
            subs: Arc::new(FileSubStore {
                log: Arc::clone(&subs),
            }),
        };
        inner.sublogs.insert(name.to_string(), subs);
        inner.channels.insert(name.to_string(), stores.clone());
        Ok(stores)
    }
}

impl Store for FileStore {
    fn init(&self, info: &ServerInfo) -> Result<(), StoreError> {
        self.check_open()?;
        let mut inner = self.lock();
        if let Some(stored) = &inner.info {
            if stored.proto_version > PROTOCOL_VERSION {
                return Err(StoreError::VersionMismatch {
                    stored: stored.proto_version,
                    supported: PROTOCOL_VERSION,
                });
            }
            if stored.cluster_id != info.cluster_id {
                return Err(StoreError::ClusterIdMismatch {
                    stored: stored.cluster_id.clone(),
                    configured: info.cluster_id.clone(),
                });
            }
            if stored == info {
                return Ok(());
            }
        }
        let body = serde_json::to_vec(info)
            .map_err(|e| StoreError::corrupt(format!("server info encode failed: {e}")))?;
        self.append_record(&mut inner, REC_INFO, &body)?;
        inner.info = Some(info.clone());
        Ok(())
    }

    fn recover(&self) -> Result<Option<RecoveredState>, StoreError> {
        self.check_open()?;
        let mut inner = self.lock();
        let Some(info) = inner.info.clone() else {
            return Ok(None);
        };
        if info.proto_version > PROTOCOL_VERSION {
            return Err(StoreError::VersionMismatch {
                stored: info.proto_version,
                supported: PROTOCOL_VERSION,
            });
        }

        let mut channels = BTreeMap::new();
        let ids: Vec<(String, u64)> = inner
            .channel_ids
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect();
        for (name, id) in ids {
            let stores = match inner.channels.get(&name).cloned() {
                Some(stores) => stores,
                None => self.instantiate_channel(&mut inner, &name, id)?,
            };
            let subs = inner
                .sublogs
                .get(&name)
                .map(|log| log.recovered_subscriptions())
                .unwrap_or_default();
            channels.insert(
                name,
                RecoveredChannel {
                    first_seq: stores.msgs.first_seq(),
                    last_seq: stores.msgs.last_seq(),
                    stores,
                    subscriptions: subs,
                },
            );
        }

        Ok(Some(RecoveredState {
            info,
            clients: inner.clients.values().cloned().collect(),
            channels,
        }))
    }

    fn create_channel(&self, name: &str) -> Result<ChannelStores, StoreError> {
        self.check_open()?;
        let mut inner = self.lock();
        if let Some(existing) = inner.channels.get(name) {
            return Ok(existing.clone());
        }
        if let Some(&id) = inner.channel_ids.get(name) {
            return self.instantiate_channel(&mut inner, name, id);
        }

        let max_channels = match self.limits.read() {
            Ok(limits) => limits.max_channels,
            Err(poisoned) => poisoned.into_inner().max_channels,
        };
        if max_channels > 0 && inner.channel_ids.len() as i64 >= max_channels {
            return Err(StoreError::ChannelLimitReached { max: max_channels });
        }

        let id = inner.next_channel_id;
        let record = ChannelRecord {
            id,
            name: name.to_string(),
        };
        let body = serde_json::to_vec(&record)
            .map_err(|e| StoreError::corrupt(format!("channel record encode failed: {e}")))?;
        self.append_record(&mut inner, REC_CHANNEL, &body)?;
        inner.next_channel_id = id + 1;
        inner.channel_ids.insert(name.to_string(), id);
        self.instantiate_channel(&mut inner, name, id)
    }

    fn add_client(&self, client: &ClientInfo) -> Result<(), StoreError> {
        self.check_open()?;
        let mut inner = self.lock();
        let body = serde_json::to_vec(client)
            .map_err(|e| StoreError::corrupt(format!("client encode failed: {e}")))?;
        self.append_record(&mut inner, REC_CLIENT_ADD, &body)?;
        inner
            .clients
            .insert(client.client_id.clone(), client.clone());
        Ok(())
    }

    fn delete_client(&self, client_id: &str) -> Result<(), StoreError> {
        self.check_open()?;
        let mut inner = self.lock();
        self.append_record(&mut inner, REC_CLIENT_DEL, client_id.as_bytes())?;
        inner.clients.remove(client_id);
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
        let inner = self.lock();
        if let Some(file) = &inner.server_log {
            let path = self.root.join(SERVER_LOG);
            file.sync_data().map_err(|e| StoreError::io(path, e))?;
        }
        for stores in inner.channels.values() {
            stores.msgs.flush()?;
            stores.subs.flush()?;
        }
        Ok(())
    }
}

fn load_server_log(path: &Path, inner: &mut FileStoreInner) -> Result<(), StoreError> {
    let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
    let file_len = file.metadata().map_err(|e| StoreError::io(path, e))?.len();
    let mut keep_len = file_len;
    {
        let mut reader = FrameReader::new(BufReader::new(&file), file_len);
        loop {
            match reader.read_next()? {
                FrameOutcome::Record(payload) => apply_server_record(inner, &payload, path)?,
                FrameOutcome::Eof => break,
                FrameOutcome::Torn { offset } => {
                    keep_len = offset;
                    break;
                }
            }
        }
    }
    if keep_len < file_len {
        let writable = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;
        writable
            .set_len(keep_len)
            .map_err(|e| StoreError::io(path, e))?;
        writable.sync_data().map_err(|e| StoreError::io(path, e))?;
    }
    Ok(())
}

fn apply_server_record(
    inner: &mut FileStoreInner,
    payload: &[u8],
    path: &Path,
) -> Result<(), StoreError> {
    let Some((&kind, body)) = payload.split_first() else {
        return Err(StoreError::corrupt(format!(
            "empty record in {}",
            path.display()
        )));
    };
    match kind {
        REC_INFO => {
            let info: ServerInfo = serde_json::from_slice(body).map_err(|e| {
                StoreError::corrupt(format!("unparseable server info in {}: {e}", path.display()))
            })?;
            inner.info = Some(info);
        }
        REC_CLIENT_ADD => {
            let client: ClientInfo = serde_json::from_slice(body).map_err(|e| {
                StoreError::corrupt(format!("unparseable client in {}: {e}", path.display()))
            })?;
            inner.clients.insert(client.client_id.clone(), client);
        }
        REC_CLIENT_DEL => {
            let id = std::str::from_utf8(body).map_err(|_| {
                StoreError::corrupt(format!("non-utf8 client id in {}", path.display()))
            })?;
            inner.clients.remove(id);
        }
        REC_CHANNEL => {
            let record: ChannelRecord = serde_json::from_slice(body).map_err(|e| {
                StoreError::corrupt(format!("unparseable channel in {}: {e}", path.display()))
            })?;
            inner.next_channel_id = inner.next_channel_id.max(record.id + 1);
            inner.channel_ids.insert(record.name, record.id);
        }
        other => {
            return Err(StoreError::corrupt(format!(
                "unknown record kind {other} in {}",
                path.display()
            )));
        }
    }
    Ok(())
}

struct FileMsgStore {
    log: MsgLog,
}

impl MessageStore for FileMsgStore {
    fn store(&self, data: Bytes) -> Result<u64, StoreError> {
        self.log.store(data)
    }

    fn lookup(&self, seq: u64) -> Result<Option<Message>, StoreError> {
        self.log.lookup(seq)
    }

    fn first_seq(&self) -> u64 {
        self.log.first_seq()
    }

    fn last_seq(&self) -> u64 {
        self.log.last_seq()
    }

    fn first_msg(&self) -> Result<Option<Message>, StoreError> {
        self.log.first_msg()
    }

    fn last_msg(&self) -> Result<Option<Message>, StoreError> {
        self.log.last_msg()
    }

    fn seq_for_timestamp(&self, ts_ns: u64) -> Result<u64, StoreError> {
        self.log.seq_for_timestamp(ts_ns)
    }

    fn expire(&self, now_ns: u64) -> Result<Option<u64>, StoreError> {
        self.log.expire(now_ns)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.log.flush()
    }
}

struct FileSubStore {
    log: Arc<SubLog>,
}

impl SubStore for FileSubStore {
    fn create_sub(&self, state: &mut SubState) -> Result<(), StoreError> {
        self.log.create_sub(state)
    }

    fn update_sub(&self, state: &SubState) -> Result<(), StoreError> {
        self.log.update_sub(state)
    }

    fn delete_sub(&self, sub_id: u64) -> Result<(), StoreError> {
        self.log.delete_sub(sub_id)
    }

    fn add_seq_pending(&self, sub_id: u64, seq: u64) -> Result<(), StoreError> {
        self.log.add_seq_pending(sub_id, seq)
    }

    fn ack_seq_pending(&self, sub_id: u64, seq: u64) -> Result<(), StoreError> {
        self.log.ack_seq_pending(sub_id, seq)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.log.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(root: &Path) -> FileStore {
        FileStore::open(root, StoreLimits::default(), 1024 * 1024).unwrap()
    }

    #[test]
    fn empty_store_recovers_to_none() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path());
        assert!(store.recover().unwrap().is_none());
    }

    #[test]
    fn init_is_idempotent_but_rejects_cluster_change() {
        let temp = TempDir::new().unwrap();
        let info = ServerInfo::new("alpha");
        {
            let store = open_store(temp.path());
            store.init(&info).unwrap();
            store.init(&info).unwrap();
        }
        let store = open_store(temp.path());
        store.init(&info).unwrap();

        let err = store.init(&ServerInfo::new("beta")).unwrap_err();
        assert!(matches!(err, StoreError::ClusterIdMismatch { .. }));
    }

    #[test]
    fn init_rejects_newer_store_version() {
        let temp = TempDir::new().unwrap();
        let mut future = ServerInfo::new("alpha");
        future.proto_version = PROTOCOL_VERSION + 1;
        {
            let store = open_store(temp.path());
            store.init(&future).unwrap();
        }
        let store = open_store(temp.path());
        let err = store.init(&ServerInfo::new("alpha")).unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionMismatch { supported: PROTOCOL_VERSION, .. }
        ));
    }

    #[test]
    fn create_channel_is_idempotent_and_capped() {
        let temp = TempDir::new().unwrap();
        let mut limits = StoreLimits::default();
        limits.max_channels = 2;
        let store = FileStore::open(temp.path(), limits, 1024 * 1024).unwrap();
        store.init(&ServerInfo::new("alpha")).unwrap();

        let first = store.create_channel("foo").unwrap();
        let again = store.create_channel("foo").unwrap();
        assert_eq!(first.id, again.id);

        store.create_channel("bar").unwrap();
        let err = store.create_channel("baz").unwrap_err();
        assert!(matches!(err, StoreError::ChannelLimitReached { max: 2 }));
    }

    #[test]
    fn full_state_round_trips_through_recovery() {
        let temp = TempDir::new().unwrap();
        let info = ServerInfo::new("alpha");
        let (foo_id, sub_id);
        {
            let store = open_store(temp.path());
            store.init(&info).unwrap();
            store
                .add_client(&ClientInfo {
                    client_id: "me".to_string(),
                    heartbeat_inbox: "_HB.me".to_string(),
                })
                .unwrap();
            store
                .add_client(&ClientInfo {
                    client_id: "gone".to_string(),
                    heartbeat_inbox: "_HB.gone".to_string(),
                })
                .unwrap();
            store.delete_client("gone").unwrap();

            let foo = store.create_channel("foo").unwrap();
            foo_id = foo.id;
            foo.msgs.store(Bytes::from_static(b"one")).unwrap();
            foo.msgs.store(Bytes::from_static(b"two")).unwrap();

            let mut sub = SubState {
                client_id: "me".to_string(),
                inbox: "_INBOX.me".to_string(),
                ack_inbox: "_ACK.me".to_string(),
                ack_wait_ns: 1_000,
                max_in_flight: 8,
                manual_ack: true,
                ..SubState::default()
            };
            foo.subs.create_sub(&mut sub).unwrap();
            sub_id = sub.sub_id;
            foo.subs.add_seq_pending(sub_id, 1).unwrap();
            foo.subs.add_seq_pending(sub_id, 2).unwrap();
            foo.subs.ack_seq_pending(sub_id, 1).unwrap();
            store.close().unwrap();
        }

        let store = open_store(temp.path());
        let state = store.recover().unwrap().unwrap();
        assert_eq!(state.info, info);
        assert_eq!(state.clients.len(), 1);
        assert_eq!(state.clients[0].client_id, "me");

        let foo = state.channels.get("foo").unwrap();
        assert_eq!(foo.stores.id, foo_id);
        assert_eq!((foo.first_seq, foo.last_seq), (1, 2));
        assert_eq!(foo.subscriptions.len(), 1);
        let sub = &foo.subscriptions[0];
        assert_eq!(sub.state.sub_id, sub_id);
        assert_eq!(sub.pending.iter().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn closed_store_rejects_writes() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path());
        store.init(&ServerInfo::new("alpha")).unwrap();
        store.close().unwrap();
        assert!(matches!(
            store.create_channel("foo"),
            Err(StoreError::Closed)
        ));
    }
}
