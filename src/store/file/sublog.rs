//! Append-only subscription log for one channel (`subs.dat`).
//!
//! Create/update/delete/pending/ack records are framed like every other log
//! and folded into final state on recovery. Deleting a subscription appends
//! a tombstone rather than rewriting the log, so a deleted sub's id stays
//! visible to the id allocator and is never reassigned.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use super::frame::{write_frame, FrameOutcome, FrameReader};
use crate::core::StoreLimits;
use crate::store::{RecoveredSubscription, StoreError, SubState};

const REC_NEW: u8 = 1;
const REC_UPDATE: u8 = 2;
const REC_DELETE: u8 = 3;
const REC_PENDING: u8 = 4;
const REC_ACK: u8 = 5;

pub(crate) struct SubLog {
    path: PathBuf,
    channel: String,
    limits: Arc<RwLock<StoreLimits>>,
    /// Store-wide sub id allocator; recovery raises it past every id seen,
    /// deleted rows included.
    next_sub_id: Arc<AtomicU64>,
    inner: Mutex<SubLogInner>,
}

struct SubLogInner {
    file: std::fs::File,
    subs: BTreeMap<u64, SubEntry>,
}

struct SubEntry {
    state: SubState,
    pending: BTreeSet<u64>,
}

impl SubLog {
    pub fn open(
        path: PathBuf,
        channel: String,
        limits: Arc<RwLock<StoreLimits>>,
        next_sub_id: Arc<AtomicU64>,
    ) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        let file_len = file.metadata().map_err(|e| StoreError::io(&path, e))?.len();

        let mut subs: BTreeMap<u64, SubEntry> = BTreeMap::new();
        let mut max_id_seen = 0u64;
        let mut keep_len = file_len;
        {
            let mut reader = FrameReader::new(BufReader::new(&file), file_len);
            loop {
                match reader.read_next()? {
                    FrameOutcome::Record(payload) => {
                        max_id_seen =
                            max_id_seen.max(apply_record(&mut subs, &payload, &path)?);
                    }
                    FrameOutcome::Eof => break,
                    FrameOutcome::Torn { offset } => {
                        keep_len = offset;
                        break;
                    }
                }
            }
        }
        if keep_len < file_len {
            file.set_len(keep_len).map_err(|e| StoreError::io(&path, e))?;
            file.sync_data().map_err(|e| StoreError::io(&path, e))?;
        }

        next_sub_id.fetch_max(max_id_seen, Ordering::SeqCst);

        Ok(Self {
            path,
            channel,
            limits,
            next_sub_id,
            inner: Mutex::new(SubLogInner { file, subs }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SubLogInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn recovered_subscriptions(&self) -> Vec<RecoveredSubscription> {
        self.lock()
            .subs
            .values()
            .map(|entry| RecoveredSubscription {
                state: entry.state.clone(),
                pending: entry.pending.clone(),
            })
            .collect()
    }

    pub fn create_sub(&self, state: &mut SubState) -> Result<(), StoreError> {
        let max_subs = match self.limits.read() {
            Ok(limits) => limits.limits_for(&self.channel).max_subscriptions,
            Err(poisoned) => poisoned
                .into_inner()
                .limits_for(&self.channel)
                .max_subscriptions,
        };
        let mut inner = self.lock();
        if max_subs > 0 && inner.subs.len() as i64 >= max_subs {
            return Err(StoreError::SubscriptionLimitReached { max: max_subs });
        }
        if state.sub_id == 0 {
            state.sub_id = self.next_sub_id.fetch_add(1, Ordering::SeqCst) + 1;
        } else {
            self.next_sub_id.fetch_max(state.sub_id, Ordering::SeqCst);
        }

        self.append(&mut inner, REC_NEW, &encode_state(state)?)?;
        inner.subs.insert(
            state.sub_id,
            SubEntry {
                state: state.clone(),
                pending: BTreeSet::new(),
            },
        );
        Ok(())
    }

    pub fn update_sub(&self, state: &SubState) -> Result<(), StoreError> {
        let mut inner = self.lock();
        self.append(&mut inner, REC_UPDATE, &encode_state(state)?)?;
        match inner.subs.get_mut(&state.sub_id) {
            Some(entry) => entry.state = state.clone(),
            None => {
                inner.subs.insert(
                    state.sub_id,
                    SubEntry {
                        state: state.clone(),
                        pending: BTreeSet::new(),
                    },
                );
            }
        }
        Ok(())
    }

    pub fn delete_sub(&self, sub_id: u64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        self.append(&mut inner, REC_DELETE, &sub_id.to_le_bytes())?;
        inner.subs.remove(&sub_id);
        Ok(())
    }

    pub fn add_seq_pending(&self, sub_id: u64, seq: u64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        self.append(&mut inner, REC_PENDING, &encode_pair(sub_id, seq))?;
        if let Some(entry) = inner.subs.get_mut(&sub_id) {
            entry.pending.insert(seq);
        }
        Ok(())
    }

    pub fn ack_seq_pending(&self, sub_id: u64, seq: u64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        self.append(&mut inner, REC_ACK, &encode_pair(sub_id, seq))?;
        if let Some(entry) = inner.subs.get_mut(&sub_id) {
            entry.pending.remove(&seq);
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        let inner = self.lock();
        inner
            .file
            .sync_data()
            .map_err(|e| StoreError::io(&self.path, e))
    }

    fn append(
        &self,
        inner: &mut SubLogInner,
        kind: u8,
        body: &[u8],
    ) -> Result<(), StoreError> {
        let mut payload = Vec::with_capacity(1 + body.len());
        payload.push(kind);
        payload.extend_from_slice(body);
        write_frame(&mut inner.file, &payload)
            .map_err(|e| relabel_io(e, &self.path))?;
        inner
            .file
            .sync_data()
            .map_err(|e| StoreError::io(&self.path, e))?;
        Ok(())
    }
}

fn relabel_io(err: StoreError, path: &PathBuf) -> StoreError {
    match err {
        StoreError::Io { path: None, source } => StoreError::io(path, source),
        other => other,
    }
}

fn encode_state(state: &SubState) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(state)
        .map_err(|e| StoreError::corrupt(format!("subscription encode failed: {e}")))
}

fn encode_pair(sub_id: u64, seq: u64) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&sub_id.to_le_bytes());
    buf[8..].copy_from_slice(&seq.to_le_bytes());
    buf
}

fn decode_pair(body: &[u8], path: &std::path::Path) -> Result<(u64, u64), StoreError> {
    if body.len() != 16 {
        return Err(StoreError::corrupt(format!(
            "bad pending record length in {}",
            path.display()
        )));
    }
    let mut a = [0u8; 8];
    let mut b = [0u8; 8];
    a.copy_from_slice(&body[..8]);
    b.copy_from_slice(&body[8..]);
    Ok((u64::from_le_bytes(a), u64::from_le_bytes(b)))
}

/// Fold one record into the map; returns the highest sub id it mentions.
fn apply_record(
    subs: &mut BTreeMap<u64, SubEntry>,
    payload: &[u8],
    path: &std::path::Path,
) -> Result<u64, StoreError> {
    let Some((&kind, body)) = payload.split_first() else {
        return Err(StoreError::corrupt(format!(
            "empty subscription record in {}",
            path.display()
        )));
    };
    match kind {
        REC_NEW | REC_UPDATE => {
            let state: SubState = serde_json::from_slice(body).map_err(|e| {
                StoreError::corrupt(format!(
                    "unparseable subscription record in {}: {e}",
                    path.display()
                ))
            })?;
            let sub_id = state.sub_id;
            match subs.get_mut(&sub_id) {
                Some(entry) => entry.state = state,
                None => {
                    subs.insert(
                        sub_id,
                        SubEntry {
                            state,
                            pending: BTreeSet::new(),
                        },
                    );
                }
            }
            Ok(sub_id)
        }
        REC_DELETE => {
            if body.len() != 8 {
                return Err(StoreError::corrupt(format!(
                    "bad delete record length in {}",
                    path.display()
                )));
            }
            let mut id = [0u8; 8];
            id.copy_from_slice(body);
            let sub_id = u64::from_le_bytes(id);
            subs.remove(&sub_id);
            Ok(sub_id)
        }
        REC_PENDING => {
            let (sub_id, seq) = decode_pair(body, path)?;
            if let Some(entry) = subs.get_mut(&sub_id) {
                entry.pending.insert(seq);
            }
            Ok(sub_id)
        }
        REC_ACK => {
            let (sub_id, seq) = decode_pair(body, path)?;
            if let Some(entry) = subs.get_mut(&sub_id) {
                entry.pending.remove(&seq);
            }
            Ok(sub_id)
        }
        other => Err(StoreError::corrupt(format!(
            "unknown subscription record kind {other} in {}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_log(path: PathBuf, next_id: Arc<AtomicU64>) -> SubLog {
        SubLog::open(
            path,
            "chan".to_string(),
            Arc::new(RwLock::new(StoreLimits::default())),
            next_id,
        )
        .unwrap()
    }

    fn sample_state(client: &str) -> SubState {
        SubState {
            sub_id: 0,
            client_id: client.to_string(),
            inbox: format!("_INBOX.{client}"),
            ack_inbox: format!("_ACK.{client}"),
            durable_name: None,
            queue_group: None,
            ack_wait_ns: 30_000_000_000,
            max_in_flight: 16,
            manual_ack: true,
            is_durable: false,
            last_sent: 0,
        }
    }

    #[test]
    fn fold_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("subs.dat");
        let next_id = Arc::new(AtomicU64::new(0));
        {
            let log = open_log(path.clone(), Arc::clone(&next_id));
            let mut a = sample_state("alice");
            let mut b = sample_state("bob");
            log.create_sub(&mut a).unwrap();
            log.create_sub(&mut b).unwrap();
            assert_eq!((a.sub_id, b.sub_id), (1, 2));

            log.add_seq_pending(a.sub_id, 3).unwrap();
            log.add_seq_pending(a.sub_id, 4).unwrap();
            log.ack_seq_pending(a.sub_id, 3).unwrap();

            a.last_sent = 4;
            log.update_sub(&a).unwrap();
            log.delete_sub(b.sub_id).unwrap();
        }

        let next_id = Arc::new(AtomicU64::new(0));
        let log = open_log(path, Arc::clone(&next_id));
        let recovered = log.recovered_subscriptions();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].state.client_id, "alice");
        assert_eq!(recovered[0].state.last_sent, 4);
        assert_eq!(
            recovered[0].pending.iter().copied().collect::<Vec<_>>(),
            vec![4]
        );
        // The deleted sub's id stays burned.
        assert_eq!(next_id.load(Ordering::SeqCst), 2);
        let mut fresh = sample_state("carol");
        log.create_sub(&mut fresh).unwrap();
        assert_eq!(fresh.sub_id, 3);
    }

    #[test]
    fn subscription_limit_enforced() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("subs.dat");
        let mut limits = StoreLimits::default();
        limits.channel.max_subscriptions = 1;
        let log = SubLog::open(
            path,
            "chan".to_string(),
            Arc::new(RwLock::new(limits)),
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap();

        let mut first = sample_state("one");
        log.create_sub(&mut first).unwrap();
        let mut second = sample_state("two");
        let err = log.create_sub(&mut second).unwrap_err();
        assert!(matches!(
            err,
            StoreError::SubscriptionLimitReached { max: 1 }
        ));
    }

    #[test]
    fn pending_for_deleted_sub_is_dropped_by_fold() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("subs.dat");
        {
            let log = open_log(path.clone(), Arc::new(AtomicU64::new(0)));
            let mut sub = sample_state("gone");
            log.create_sub(&mut sub).unwrap();
            log.add_seq_pending(sub.sub_id, 9).unwrap();
            log.delete_sub(sub.sub_id).unwrap();
        }
        let log = open_log(path, Arc::new(AtomicU64::new(0)));
        assert!(log.recovered_subscriptions().is_empty());
    }
}
