//! Document log format.
//!
//! ```text
//! +--------------------+
//! | "DSLOG" | ver | 00 |  8-byte file header
//! +--------------------+
//! | len u32 | crc32 u32 |  frame header (little endian)
//! | CBOR payload        |  `LogEntry`
//! +--------------------+
//! | ...                 |
//! ```
//!
//! The log is append-only. Replay keeps the last entry per document id
//! and per checkpoint name. A frame that is cut short or fails its checksum
//! ends the readable log; everything after it is discarded on open.

use crate::document::ReplicatedDocument;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// Magic bytes at the start of every log file.
pub(crate) const LOG_MAGIC: [u8; 5] = *b"DSLOG";

/// Current log format version.
pub(crate) const LOG_VERSION: u8 = 1;

/// Size of the file header.
pub(crate) const FILE_HEADER_LEN: usize = 8;

const FRAME_HEADER_LEN: usize = 8;

/// Largest payload written or accepted on replay. A bigger length read
/// back is a corrupt length.
pub(crate) const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// A persisted write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum LogEntry {
    /// A document became current at `sequence`.
    Document {
        /// Local sequence assigned to the write.
        sequence: u64,
        /// The document and its ancestry.
        document: ReplicatedDocument,
    },
    /// A named replication checkpoint moved.
    Checkpoint {
        /// Checkpoint name.
        name: String,
        /// New checkpoint value.
        sequence: u64,
    },
}

/// Returns the header written at the start of a new log.
pub(crate) fn file_header() -> [u8; FILE_HEADER_LEN] {
    let mut header = [0u8; FILE_HEADER_LEN];
    header[..5].copy_from_slice(&LOG_MAGIC);
    header[5] = LOG_VERSION;
    header
}

/// Encodes an entry as a complete frame.
pub(crate) fn encode_frame(entry: &LogEntry) -> CoreResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(entry, &mut payload).map_err(|e| CoreError::codec(e.to_string()))?;

    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CoreError::codec(format!(
            "log entry too large: {} bytes, limit is {MAX_PAYLOAD_LEN}",
            payload.len()
        )));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::codec(format!("log entry too large: {} bytes", payload.len())))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&compute_crc32(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Result of reading a log from the start.
#[derive(Debug)]
pub(crate) struct Replay {
    /// Entries in write order.
    pub entries: Vec<LogEntry>,
    /// Byte length of the readable prefix, header included.
    pub valid_len: u64,
    /// Why reading stopped early, if it did.
    pub torn_tail: Option<String>,
}

/// Reads every intact entry in `bytes`.
///
/// An empty input is a new log. A bad file header is an error because it
/// means the file is not a document log at all; a bad frame only ends the
/// replay.
pub(crate) fn replay(bytes: &[u8]) -> CoreResult<Replay> {
    if bytes.is_empty() {
        return Ok(Replay {
            entries: Vec::new(),
            valid_len: 0,
            torn_tail: None,
        });
    }

    if bytes.len() < FILE_HEADER_LEN || bytes[..5] != LOG_MAGIC {
        return Err(CoreError::corrupted("missing document log header"));
    }
    if bytes[5] != LOG_VERSION {
        return Err(CoreError::corrupted(format!(
            "unsupported log version {} (expected {LOG_VERSION})",
            bytes[5]
        )));
    }

    let mut entries = Vec::new();
    let mut offset = FILE_HEADER_LEN;
    let mut torn_tail = None;

    while offset < bytes.len() {
        match read_frame(&bytes[offset..]) {
            Ok((entry, consumed)) => {
                entries.push(entry);
                offset += consumed;
            }
            Err(reason) => {
                torn_tail = Some(format!("{reason} at offset {offset}"));
                break;
            }
        }
    }

    Ok(Replay {
        entries,
        valid_len: offset as u64,
        torn_tail,
    })
}

fn read_frame(bytes: &[u8]) -> Result<(LogEntry, usize), String> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err("truncated frame header".into());
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let expected_crc = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if len > MAX_PAYLOAD_LEN {
        return Err(format!("implausible frame length {len}"));
    }

    let end = FRAME_HEADER_LEN + len;
    if bytes.len() < end {
        return Err("truncated frame payload".into());
    }
    let payload = &bytes[FRAME_HEADER_LEN..end];

    let actual_crc = compute_crc32(payload);
    if actual_crc != expected_crc {
        return Err(format!(
            "checksum mismatch (expected {expected_crc:08x}, got {actual_crc:08x})"
        ));
    }

    let entry: LogEntry =
        ciborium::from_reader(payload).map_err(|e| format!("undecodable entry: {e}"))?;
    Ok((entry, end))
}

/// CRC-32 (IEEE) of `data`.
pub(crate) fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{body_from_value, Document, DocumentId};
    use crate::revision::Revision;
    use serde_json::json;

    fn document_entry(sequence: u64, name: &str) -> LogEntry {
        let body = body_from_value(json!({"name": name, "age": 36, "tags": ["a"]})).unwrap();
        LogEntry::Document {
            sequence,
            document: ReplicatedDocument {
                document: Document {
                    id: DocumentId::new(name).unwrap(),
                    revision: Revision::next(None, &body),
                    body,
                },
                ancestors: Vec::new(),
            },
        }
    }

    fn log_of(entries: &[LogEntry]) -> Vec<u8> {
        let mut bytes = file_header().to_vec();
        for entry in entries {
            bytes.extend(encode_frame(entry).unwrap());
        }
        bytes
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn replay_reads_entries_in_order() {
        let entries = vec![
            document_entry(1, "ada"),
            LogEntry::Checkpoint {
                name: "pull:memory://remote/db".into(),
                sequence: 4,
            },
            document_entry(2, "grace"),
        ];
        let bytes = log_of(&entries);

        let replay = replay(&bytes).unwrap();
        assert_eq!(replay.entries, entries);
        assert_eq!(replay.valid_len, bytes.len() as u64);
        assert!(replay.torn_tail.is_none());
    }

    #[test]
    fn replay_stops_at_torn_tail() {
        let mut bytes = log_of(&[document_entry(1, "ada")]);
        let intact = bytes.len();
        let second = encode_frame(&document_entry(2, "grace")).unwrap();
        bytes.extend_from_slice(&second[..second.len() - 3]);

        let replay = replay(&bytes).unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(replay.valid_len, intact as u64);
        assert!(replay.torn_tail.unwrap().contains("truncated"));
    }

    #[test]
    fn replay_stops_at_checksum_mismatch() {
        let mut bytes = log_of(&[document_entry(1, "ada"), document_entry(2, "grace")]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let replay = replay(&bytes).unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert!(replay.torn_tail.unwrap().contains("checksum"));
    }

    #[test]
    fn encode_refuses_payloads_replay_would_reject() {
        let body = body_from_value(json!({ "blob": "x".repeat(MAX_PAYLOAD_LEN) })).unwrap();
        let entry = LogEntry::Document {
            sequence: 1,
            document: ReplicatedDocument {
                document: Document {
                    id: DocumentId::new("big").unwrap(),
                    revision: Revision::next(None, &body),
                    body,
                },
                ancestors: Vec::new(),
            },
        };
        assert!(matches!(encode_frame(&entry), Err(CoreError::Codec { .. })));
    }

    #[test]
    fn foreign_file_is_rejected() {
        assert!(matches!(
            replay(b"not a document log"),
            Err(CoreError::Corrupted { .. })
        ));

        let mut bytes = file_header().to_vec();
        bytes[5] = 99;
        assert!(replay(&bytes).is_err());
    }

    #[test]
    fn empty_input_is_a_new_log() {
        let replay = replay(&[]).unwrap();
        assert!(replay.entries.is_empty());
        assert_eq!(replay.valid_len, 0);
    }
}
