//! Record framing for the append-only logs: `[len: u32 LE | crc32c | payload]`.

use std::io::{Read, Write};

use crc32c::crc32c;

use crate::store::StoreError;

pub(crate) const FRAME_HEADER_LEN: u64 = 8;

/// Anything larger is assumed to be a torn length field, not a real record.
const MAX_FRAME_PAYLOAD: u64 = 64 * 1024 * 1024;

/// Outcome of reading one frame while scanning a log.
#[derive(Debug)]
pub(crate) enum FrameOutcome {
    Record(Vec<u8>),
    Eof,
    /// The record starting at this offset does not fit or fails its CRC at
    /// the tail of the file. Recovery truncates here.
    Torn { offset: u64 },
}

/// Sequential scanner over a log, tracking its offset so callers can
/// truncate a torn tail.
pub(crate) struct FrameReader<R> {
    reader: R,
    offset: u64,
    file_len: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, file_len: u64) -> Self {
        Self {
            reader,
            offset: 0,
            file_len,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn read_next(&mut self) -> Result<FrameOutcome, StoreError> {
        let start = self.offset;
        if start == self.file_len {
            return Ok(FrameOutcome::Eof);
        }
        if self.file_len - start < FRAME_HEADER_LEN {
            return Ok(FrameOutcome::Torn { offset: start });
        }

        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        self.read_exact(&mut header)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let end = start + FRAME_HEADER_LEN + len;
        if len > MAX_FRAME_PAYLOAD || end > self.file_len {
            return Ok(FrameOutcome::Torn { offset: start });
        }

        let mut payload = vec![0u8; len as usize];
        self.read_exact(&mut payload)?;

        if crc32c(&payload) != expected_crc {
            // A bad checksum on the final record is a torn write; anywhere
            // else the log is corrupt.
            if end == self.file_len {
                return Ok(FrameOutcome::Torn { offset: start });
            }
            return Err(StoreError::corrupt(format!(
                "crc mismatch at offset {start}"
            )));
        }

        Ok(FrameOutcome::Record(payload))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StoreError> {
        self.reader
            .read_exact(buf)
            .map_err(|source| StoreError::Io { path: None, source })?;
        self.offset += buf.len() as u64;
        Ok(())
    }
}

pub(crate) fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN as usize + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32c(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub(crate) fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<u64, StoreError> {
    let frame = encode_frame(payload);
    writer
        .write_all(&frame)
        .map_err(|source| StoreError::Io { path: None, source })?;
    Ok(frame.len() as u64)
}
