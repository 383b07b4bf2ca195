// WAL record framing.
//
// On disk every record is: 4-byte length prefix, 1-byte kind, 8-byte LSN,
// 8-byte prev-LSN (per transaction), 8-byte txid, variable payload, 4-byte
// CRC32C of all preceding bytes. The length prefix counts everything after
// itself, trailer included.

use crate::common::{FileId, Lsn, PageId, TxId};
use crate::error::{DbError, Result};
use crate::storage::checksum::log_checksum;
use serde::{Deserialize, Serialize};

/// Non-LSN sentinel for "no previous record".
pub const NO_LSN: Lsn = 0;

const HEADER_LEN: usize = 1 + 8 + 8 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Begin = 1,
    Commit = 2,
    Abort = 3,
    PageUpdate = 4,
    AllocPage = 5,
    FreePage = 6,
    Checkpoint = 7,
}

impl RecordKind {
    fn from_u8(v: u8) -> Option<RecordKind> {
        match v {
            1 => Some(RecordKind::Begin),
            2 => Some(RecordKind::Commit),
            3 => Some(RecordKind::Abort),
            4 => Some(RecordKind::PageUpdate),
            5 => Some(RecordKind::AllocPage),
            6 => Some(RecordKind::FreePage),
            7 => Some(RecordKind::Checkpoint),
            _ => None,
        }
    }
}

/// Physiological image of one page change: page id plus before and after
/// images of the affected slot range (structural modifications cover the
/// whole page so redo is all-or-nothing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageDelta {
    pub page_id: PageId,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

/// Logical inverse of a tree mutation, applied by the undo pass through the
/// normal tree code so interleaved writers on shared pages stay intact.
/// Compensation records written during undo carry no hint, which makes a
/// re-run of undo after a crash-in-undo idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TreeUndo {
    /// Revert an insert-or-replace: delete the key, or put back the value
    /// it displaced.
    Insert {
        file: FileId,
        key: Vec<u8>,
        old_value: Option<Vec<u8>>,
    },
    /// Revert a delete: reinsert the removed value.
    Delete {
        file: FileId,
        key: Vec<u8>,
        old_value: Vec<u8>,
    },
}

/// Typed payload per record kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Begin,
    Commit,
    Abort,
    /// One logical mutation; a structural split logs every touched page in
    /// a single record so recovery sees it fully present or fully absent.
    PageUpdate {
        deltas: Vec<PageDelta>,
        undo: Option<TreeUndo>,
    },
    AllocPage {
        file: FileId,
        page_no: u32,
        kind: u32,
    },
    FreePage { page_id: PageId },
    Checkpoint {
        active_txs: Vec<(TxId, Lsn)>,
        dirty_pages: Vec<(PageId, Lsn)>,
    },
}

impl Payload {
    pub fn kind(&self) -> RecordKind {
        match self {
            Payload::Begin => RecordKind::Begin,
            Payload::Commit => RecordKind::Commit,
            Payload::Abort => RecordKind::Abort,
            Payload::PageUpdate { .. } => RecordKind::PageUpdate,
            Payload::AllocPage { .. } => RecordKind::AllocPage,
            Payload::FreePage { .. } => RecordKind::FreePage,
            Payload::Checkpoint { .. } => RecordKind::Checkpoint,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalRecord {
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub txid: TxId,
    pub payload: Payload,
}

impl WalRecord {
    /// Serialize into the framed wire format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serde::encode_to_vec(&self.payload, bincode::config::standard())?;
        let total = HEADER_LEN + body.len() + 4;
        let mut out = Vec::with_capacity(4 + total);
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.push(self.payload.kind() as u8);
        out.extend_from_slice(&self.lsn.to_le_bytes());
        out.extend_from_slice(&self.prev_lsn.to_le_bytes());
        out.extend_from_slice(&self.txid.to_le_bytes());
        out.extend_from_slice(&body);
        let crc = log_checksum(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    /// Decode one record starting at `buf[0]`.
    ///
    /// Returns `Ok(None)` when the buffer ends before a complete record —
    /// the torn-tail case recovery truncates at. A checksum or framing
    /// failure inside a complete record is `CorruptLog`.
    pub fn decode(buf: &[u8]) -> Result<Option<(WalRecord, usize)>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let total = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
        if total < HEADER_LEN + 4 {
            return Err(DbError::CorruptLog(format!(
                "record length {} below header size",
                total
            )));
        }
        if buf.len() < 4 + total {
            return Ok(None);
        }
        let frame = &buf[..4 + total];
        let crc_stored = u32::from_le_bytes(frame[4 + total - 4..].try_into().unwrap());
        let crc_actual = log_checksum(&frame[..4 + total - 4]);
        if crc_stored != crc_actual {
            return Err(DbError::CorruptLog(format!(
                "CRC mismatch: stored {:#x}, actual {:#x}",
                crc_stored, crc_actual
            )));
        }
        let kind_byte = frame[4];
        let kind = RecordKind::from_u8(kind_byte)
            .ok_or_else(|| DbError::CorruptLog(format!("unknown record kind {}", kind_byte)))?;
        let lsn = u64::from_le_bytes(frame[5..13].try_into().unwrap());
        let prev_lsn = u64::from_le_bytes(frame[13..21].try_into().unwrap());
        let txid = u64::from_le_bytes(frame[21..29].try_into().unwrap());
        let body = &frame[29..4 + total - 4];
        let (payload, _): (Payload, usize) =
            bincode::serde::decode_from_slice(body, bincode::config::standard())?;
        if payload.kind() != kind {
            return Err(DbError::CorruptLog("kind byte disagrees with payload".into()));
        }
        Ok(Some((
            WalRecord {
                lsn,
                prev_lsn,
                txid,
                payload,
            },
            4 + total,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WalRecord {
        WalRecord {
            lsn: 42,
            prev_lsn: 7,
            txid: 3,
            payload: Payload::PageUpdate {
                deltas: vec![PageDelta {
                    page_id: 99,
                    before: vec![1, 2, 3],
                    after: vec![4, 5, 6],
                }],
                undo: Some(TreeUndo::Insert {
                    file: 0,
                    key: vec![9],
                    old_value: None,
                }),
            },
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let rec = sample();
        let bytes = rec.encode().unwrap();
        let (decoded, consumed) = WalRecord::decode(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.lsn, 42);
        assert_eq!(decoded.prev_lsn, 7);
        assert_eq!(decoded.txid, 3);
        assert!(matches!(decoded.payload, Payload::PageUpdate { .. }));
    }

    #[test]
    fn test_truncated_tail_is_not_corruption() {
        let bytes = sample().encode().unwrap();
        let cut = &bytes[..bytes.len() - 3];
        assert!(WalRecord::decode(cut).unwrap().is_none());
    }

    #[test]
    fn test_bitflip_is_corruption() {
        let mut bytes = sample().encode().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        assert!(matches!(
            WalRecord::decode(&bytes),
            Err(DbError::CorruptLog(_))
        ));
    }

    #[test]
    fn test_frame_prefix_layout() {
        let bytes = sample().encode().unwrap();
        // kind byte sits immediately after the 4-byte length prefix
        assert_eq!(bytes[4], RecordKind::PageUpdate as u8);
        let total = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
        assert_eq!(total + 4, bytes.len());
    }
}
