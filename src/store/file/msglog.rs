//! Segmented append-only message log for one channel.
//!
//! Segments are named `msgs.<first_seq>.dat`; each record is a framed
//! `[seq | timestamp | expiration | data]` payload. An in-memory index maps
//! sequence to segment offset so lookup stays O(log n) over live messages.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;

use super::frame::{encode_frame, FrameOutcome, FrameReader, FRAME_HEADER_LEN};
use crate::core::{now_ns, ChannelLimits, Message, StoreLimits};
use crate::store::StoreError;

const SEGMENT_PREFIX: &str = "msgs.";
const SEGMENT_SUFFIX: &str = ".dat";
const MSG_HEADER_LEN: u64 = 24;

pub(crate) struct MsgLog {
    dir: PathBuf,
    channel: String,
    limits: Arc<RwLock<StoreLimits>>,
    segment_max_bytes: u64,
    inner: Mutex<MsgLogInner>,
}

struct MsgLogInner {
    segments: Vec<Segment>,
    index: BTreeMap<u64, IndexEntry>,
    /// Highest sequence ever assigned; never decremented.
    last_seq: u64,
    last_timestamp: u64,
    total_bytes: u64,
}

struct Segment {
    first_seq: u64,
    path: PathBuf,
    file: File,
    len: u64,
    max_seq: u64,
}

#[derive(Clone, Copy)]
struct IndexEntry {
    segment_first: u64,
    /// Offset of the frame header within the segment file.
    offset: u64,
    timestamp_ns: u64,
    expiration_ns: u64,
    size: u32,
}

fn encode_msg(seq: u64, timestamp_ns: u64, expiration_ns: u64, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MSG_HEADER_LEN as usize + data.len());
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(&timestamp_ns.to_le_bytes());
    buf.extend_from_slice(&expiration_ns.to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

fn decode_msg(payload: &[u8]) -> Result<(u64, u64, u64, &[u8]), StoreError> {
    if payload.len() < MSG_HEADER_LEN as usize {
        return Err(StoreError::corrupt("message record truncated"));
    }
    let read_u64 = |at: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&payload[at..at + 8]);
        u64::from_le_bytes(bytes)
    };
    Ok((
        read_u64(0),
        read_u64(8),
        read_u64(16),
        &payload[MSG_HEADER_LEN as usize..],
    ))
}

fn segment_path(dir: &Path, first_seq: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{first_seq}{SEGMENT_SUFFIX}"))
}

impl MsgLog {
    pub fn open(
        dir: PathBuf,
        channel: String,
        limits: Arc<RwLock<StoreLimits>>,
        segment_max_bytes: u64,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let mut starts = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(mid) = name
                .strip_prefix(SEGMENT_PREFIX)
                .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
            else {
                continue;
            };
            let Ok(first_seq) = mid.parse::<u64>() else {
                return Err(StoreError::corrupt(format!(
                    "unparseable segment name {name:?}"
                )));
            };
            starts.push(first_seq);
        }
        starts.sort_unstable();

        let mut inner = MsgLogInner {
            segments: Vec::with_capacity(starts.len()),
            index: BTreeMap::new(),
            last_seq: 0,
            last_timestamp: 0,
            total_bytes: 0,
        };

        let last_start = starts.last().copied();
        for first_seq in starts {
            let path = segment_path(&dir, first_seq);
            let is_last = Some(first_seq) == last_start;
            let segment = recover_segment(&path, first_seq, is_last, &mut inner)?;
            inner.segments.push(segment);
        }

        let log = Self {
            dir,
            channel,
            limits,
            segment_max_bytes,
            inner: Mutex::new(inner),
        };
        // Count/byte caps and age expiry are re-applied after recovery so
        // messages evicted before the crash do not come back; the retained
        // newest segment still pins the channel's max sequence.
        {
            let channel_limits = log.channel_limits();
            let mut inner = log.lock();
            log.enforce_caps(&mut inner, &channel_limits)?;
        }
        log.expire(now_ns())?;
        Ok(log)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MsgLogInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn channel_limits(&self) -> ChannelLimits {
        match self.limits.read() {
            Ok(limits) => limits.limits_for(&self.channel),
            Err(poisoned) => poisoned.into_inner().limits_for(&self.channel),
        }
    }

    pub fn store(&self, data: Bytes) -> Result<u64, StoreError> {
        let channel_limits = self.channel_limits();
        let mut inner = self.lock();

        let seq = inner.last_seq + 1;
        let timestamp_ns = now_ns().max(inner.last_timestamp);
        let expiration_ns = if channel_limits.max_age_ns > 0 {
            timestamp_ns + channel_limits.max_age_ns as u64
        } else {
            0
        };

        let payload = encode_msg(seq, timestamp_ns, expiration_ns, &data);
        let frame = encode_frame(&payload);

        let segment = self.writable_segment(&mut inner, seq, frame.len() as u64)?;
        let offset = segment.len;
        segment
            .file
            .write_all(&frame)
            .map_err(|e| StoreError::io(&segment.path, e))?;
        segment
            .file
            .sync_data()
            .map_err(|e| StoreError::io(&segment.path, e))?;
        segment.len += frame.len() as u64;
        segment.max_seq = seq;
        let segment_first = segment.first_seq;

        inner.index.insert(
            seq,
            IndexEntry {
                segment_first,
                offset,
                timestamp_ns,
                expiration_ns,
                size: data.len() as u32,
            },
        );
        inner.last_seq = seq;
        inner.last_timestamp = timestamp_ns;
        inner.total_bytes += data.len() as u64;

        self.enforce_caps(&mut inner, &channel_limits)?;
        Ok(seq)
    }

    pub fn lookup(&self, seq: u64) -> Result<Option<Message>, StoreError> {
        let now = now_ns();
        let mut inner = self.lock();
        let Some(entry) = inner.index.get(&seq).copied() else {
            return Ok(None);
        };
        if entry.expiration_ns != 0 && entry.expiration_ns <= now {
            return Ok(None);
        }
        read_message(&mut inner, seq, entry)
    }

    pub fn first_seq(&self) -> u64 {
        let inner = self.lock();
        inner
            .index
            .keys()
            .next()
            .copied()
            .unwrap_or(inner.last_seq + 1)
    }

    pub fn last_seq(&self) -> u64 {
        self.lock().last_seq
    }

    pub fn first_msg(&self) -> Result<Option<Message>, StoreError> {
        let now = now_ns();
        let mut inner = self.lock();
        let found = inner
            .index
            .iter()
            .find(|(_, e)| e.expiration_ns == 0 || e.expiration_ns > now)
            .map(|(seq, e)| (*seq, *e));
        match found {
            Some((seq, entry)) => read_message(&mut inner, seq, entry),
            None => Ok(None),
        }
    }

    pub fn last_msg(&self) -> Result<Option<Message>, StoreError> {
        let seq = self.last_seq();
        self.lookup(seq)
    }

    pub fn seq_for_timestamp(&self, ts_ns: u64) -> Result<u64, StoreError> {
        let inner = self.lock();
        for (seq, entry) in &inner.index {
            if entry.timestamp_ns >= ts_ns {
                return Ok(*seq);
            }
        }
        Ok(inner.last_seq + 1)
    }

    pub fn expire(&self, now_ns: u64) -> Result<Option<u64>, StoreError> {
        let mut inner = self.lock();
        let dead: Vec<u64> = inner
            .index
            .iter()
            .filter(|(_, e)| e.expiration_ns != 0 && e.expiration_ns <= now_ns)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in dead {
            if let Some(entry) = inner.index.remove(&seq) {
                inner.total_bytes -= entry.size as u64;
            }
        }
        self.drop_dead_segments(&mut inner)?;

        Ok(inner
            .index
            .values()
            .filter(|e| e.expiration_ns != 0)
            .map(|e| e.expiration_ns)
            .min())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        let inner = self.lock();
        if let Some(segment) = inner.segments.last() {
            segment
                .file
                .sync_data()
                .map_err(|e| StoreError::io(&segment.path, e))?;
        }
        Ok(())
    }

    fn writable_segment<'a>(
        &self,
        inner: &'a mut MsgLogInner,
        next_seq: u64,
        frame_len: u64,
    ) -> Result<&'a mut Segment, StoreError> {
        let needs_new = match inner.segments.last() {
            None => true,
            Some(active) => {
                active.max_seq != 0 && active.len + frame_len > self.segment_max_bytes
            }
        };
        if needs_new {
            let path = segment_path(&self.dir, next_seq);
            let file = OpenOptions::new()
                .read(true)
                .append(true)
                .create_new(true)
                .open(&path)
                .map_err(|e| StoreError::io(&path, e))?;
            fsync_dir(&self.dir)?;
            inner.segments.push(Segment {
                first_seq: next_seq,
                path,
                file,
                len: 0,
                max_seq: 0,
            });
        }
        Ok(inner.segments.last_mut().expect("segment just ensured"))
    }

    fn enforce_caps(
        &self,
        inner: &mut MsgLogInner,
        limits: &ChannelLimits,
    ) -> Result<(), StoreError> {
        loop {
            let over_count =
                limits.max_msgs > 0 && inner.index.len() as i64 > limits.max_msgs;
            let over_bytes =
                limits.max_bytes > 0 && inner.total_bytes as i64 > limits.max_bytes;
            if !(over_count || over_bytes) {
                break;
            }
            let Some((&seq, _)) = inner.index.iter().next() else {
                break;
            };
            if let Some(entry) = inner.index.remove(&seq) {
                inner.total_bytes -= entry.size as u64;
            }
        }
        self.drop_dead_segments(inner)
    }

    /// Remove segment files that no longer hold any live message. The
    /// newest segment is always kept so the channel's max sequence survives
    /// a restart even when everything in it has expired.
    fn drop_dead_segments(&self, inner: &mut MsgLogInner) -> Result<(), StoreError> {
        let first_live = match inner.index.keys().next() {
            Some(seq) => *seq,
            None => u64::MAX,
        };
        while inner.segments.len() > 1 {
            if inner.segments[0].max_seq >= first_live {
                break;
            }
            let segment = inner.segments.remove(0);
            fs::remove_file(&segment.path).map_err(|e| StoreError::io(&segment.path, e))?;
        }
        Ok(())
    }
}

fn read_message(
    inner: &mut MsgLogInner,
    seq: u64,
    entry: IndexEntry,
) -> Result<Option<Message>, StoreError> {
    let segment = inner
        .segments
        .iter_mut()
        .find(|s| s.first_seq == entry.segment_first)
        .ok_or_else(|| StoreError::corrupt(format!("no segment for seq {seq}")))?;

    let data_at = entry.offset + FRAME_HEADER_LEN + MSG_HEADER_LEN;
    segment
        .file
        .seek(SeekFrom::Start(data_at))
        .map_err(|e| StoreError::io(&segment.path, e))?;
    let mut data = vec![0u8; entry.size as usize];
    segment
        .file
        .read_exact(&mut data)
        .map_err(|e| StoreError::io(&segment.path, e))?;

    Ok(Some(Message {
        seq,
        timestamp_ns: entry.timestamp_ns,
        expiration_ns: entry.expiration_ns,
        data: Bytes::from(data),
    }))
}

fn recover_segment(
    path: &Path,
    first_seq: u64,
    is_last: bool,
    inner: &mut MsgLogInner,
) -> Result<Segment, StoreError> {
    let file = OpenOptions::new()
        .read(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;
    let file_len = file
        .metadata()
        .map_err(|e| StoreError::io(path, e))?
        .len();

    let mut max_seq = 0u64;
    let mut len = file_len;
    {
        let mut reader = FrameReader::new(BufReader::new(&file), file_len);
        loop {
            let record_offset = reader.offset();
            match reader.read_next()? {
                FrameOutcome::Record(payload) => {
                    let (seq, timestamp_ns, expiration_ns, data) = decode_msg(&payload)?;
                    if seq <= max_seq {
                        return Err(StoreError::corrupt(format!(
                            "non-increasing seq {seq} in {}",
                            path.display()
                        )));
                    }
                    inner.index.insert(
                        seq,
                        IndexEntry {
                            segment_first: first_seq,
                            offset: record_offset,
                            timestamp_ns,
                            expiration_ns,
                            size: data.len() as u32,
                        },
                    );
                    inner.total_bytes += data.len() as u64;
                    inner.last_seq = inner.last_seq.max(seq);
                    inner.last_timestamp = inner.last_timestamp.max(timestamp_ns);
                    max_seq = seq;
                }
                FrameOutcome::Eof => break,
                FrameOutcome::Torn { offset } => {
                    if !is_last {
                        return Err(StoreError::corrupt(format!(
                            "torn record in non-final segment {}",
                            path.display()
                        )));
                    }
                    len = offset;
                    break;
                }
            }
        }
    }
    if len < file_len {
        file.set_len(len).map_err(|e| StoreError::io(path, e))?;
        file.sync_data().map_err(|e| StoreError::io(path, e))?;
    }

    Ok(Segment {
        first_seq,
        path: path.to_path_buf(),
        file,
        len,
        max_seq,
    })
}

fn fsync_dir(dir: &Path) -> Result<(), StoreError> {
    let handle = File::open(dir).map_err(|e| StoreError::io(dir, e))?;
    handle.sync_all().map_err(|e| StoreError::io(dir, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_log(dir: &Path, limits: StoreLimits, segment_max: u64) -> MsgLog {
        MsgLog::open(
            dir.to_path_buf(),
            "chan".to_string(),
            Arc::new(RwLock::new(limits)),
            segment_max,
        )
        .unwrap()
    }

    #[test]
    fn sequences_are_dense_from_one() {
        let temp = TempDir::new().unwrap();
        let log = open_log(temp.path(), StoreLimits::default(), 1024 * 1024);

        for expected in 1..=5u64 {
            let seq = log.store(Bytes::from(format!("m{expected}"))).unwrap();
            assert_eq!(seq, expected);
        }
        assert_eq!(log.first_seq(), 1);
        assert_eq!(log.last_seq(), 5);

        let msg = log.lookup(3).unwrap().unwrap();
        assert_eq!(msg.data.as_ref(), b"m3");
        assert!(log.lookup(6).unwrap().is_none());
    }

    #[test]
    fn survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let log = open_log(temp.path(), StoreLimits::default(), 64);
            for i in 0..10 {
                log.store(Bytes::from(format!("payload-{i}"))).unwrap();
            }
        }
        let log = open_log(temp.path(), StoreLimits::default(), 64);
        assert_eq!(log.first_seq(), 1);
        assert_eq!(log.last_seq(), 10);
        assert_eq!(log.lookup(7).unwrap().unwrap().data.as_ref(), b"payload-6");
        // Small segment cap means rotation happened.
        assert!(log.lock().segments.len() > 1);
    }

    #[test]
    fn torn_tail_is_truncated_on_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let log = open_log(temp.path(), StoreLimits::default(), 1024 * 1024);
            log.store(Bytes::from_static(b"kept")).unwrap();
            log.store(Bytes::from_static(b"torn")).unwrap();
        }
        let path = segment_path(temp.path(), 1);
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 2).unwrap();

        let log = open_log(temp.path(), StoreLimits::default(), 1024 * 1024);
        assert_eq!(log.last_seq(), 1);
        assert_eq!(log.lookup(1).unwrap().unwrap().data.as_ref(), b"kept");
        assert!(log.lookup(2).unwrap().is_none());
    }

    #[test]
    fn max_msgs_evicts_oldest() {
        let mut limits = StoreLimits::default();
        limits.channel.max_msgs = 3;
        let temp = TempDir::new().unwrap();
        let log = open_log(temp.path(), limits, 1024 * 1024);

        for i in 1..=5u64 {
            log.store(Bytes::from(format!("m{i}"))).unwrap();
        }
        assert_eq!(log.first_seq(), 3);
        assert_eq!(log.last_seq(), 5);
        assert!(log.lookup(2).unwrap().is_none());
        assert!(log.lookup(3).unwrap().is_some());
    }

    #[test]
    fn max_bytes_evicts_oldest() {
        let mut limits = StoreLimits::default();
        limits.channel.max_bytes = 10;
        let temp = TempDir::new().unwrap();
        let log = open_log(temp.path(), limits, 1024 * 1024);

        log.store(Bytes::from_static(b"aaaaa")).unwrap();
        log.store(Bytes::from_static(b"bbbbb")).unwrap();
        log.store(Bytes::from_static(b"ccccc")).unwrap();
        assert_eq!(log.first_seq(), 2);
    }

    #[test]
    fn expired_messages_vanish_from_lookup_before_sweep() {
        let mut limits = StoreLimits::default();
        limits.channel.max_age_ns = 1; // everything expires immediately
        let temp = TempDir::new().unwrap();
        let log = open_log(temp.path(), limits, 1024 * 1024);

        log.store(Bytes::from_static(b"gone")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(log.lookup(1).unwrap().is_none());
        assert!(log.first_msg().unwrap().is_none());
    }

    #[test]
    fn expire_deletes_and_reports_next_deadline() {
        let mut limits = StoreLimits::default();
        limits.channel.max_age_ns = 50_000_000; // 50ms
        let temp = TempDir::new().unwrap();
        let log = open_log(temp.path(), limits, 1024 * 1024);

        log.store(Bytes::from_static(b"old")).unwrap();
        let deadline = log.expire(now_ns()).unwrap().unwrap();
        assert!(deadline > now_ns());

        let next = log.expire(now_ns() + 60_000_000).unwrap();
        assert_eq!(next, None);
        assert_eq!(log.first_seq(), 2);
        // Max sequence is not decremented by expiration.
        assert_eq!(log.last_seq(), 1);
    }

    #[test]
    fn max_seq_survives_reopen_after_full_expiry() {
        let mut limits = StoreLimits::default();
        limits.channel.max_age_ns = 1;
        let temp = TempDir::new().unwrap();
        {
            let log = open_log(temp.path(), limits.clone(), 1024 * 1024);
            for _ in 0..4 {
                log.store(Bytes::from_static(b"x")).unwrap();
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
            log.expire(now_ns()).unwrap();
            assert_eq!(log.last_seq(), 4);
        }
        let log = open_log(temp.path(), limits, 1024 * 1024);
        assert_eq!(log.last_seq(), 4);
        assert_eq!(log.first_seq(), 5);
    }

    #[test]
    fn seq_for_timestamp_picks_first_at_or_after() {
        let temp = TempDir::new().unwrap();
        let log = open_log(temp.path(), StoreLimits::default(), 1024 * 1024);

        log.store(Bytes::from_static(b"a")).unwrap();
        let mid = now_ns();
        std::thread::sleep(std::time::Duration::from_millis(2));
        log.store(Bytes::from_static(b"b")).unwrap();

        assert_eq!(log.seq_for_timestamp(0).unwrap(), 1);
        assert_eq!(log.seq_for_timestamp(mid).unwrap(), 2);
        assert_eq!(log.seq_for_timestamp(now_ns() + 1_000_000).unwrap(), 3);
    }
}
