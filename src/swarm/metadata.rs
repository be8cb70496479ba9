//! Fetching the info dictionary of a magnet job from peers (BEP 9 over BEP 10).

use crate::job::InfoHash;
use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use serde_bencode::de;
use std::collections::BTreeMap;

/// Extended-message id of the extension handshake.
pub const HANDSHAKE_ID: u8 = 0;
/// The id we ask peers to use when they send us `ut_metadata` messages.
pub const UT_METADATA_ID: u8 = 1;
pub const METADATA_PIECE_LEN: usize = 16384;
pub const MAX_METADATA_SIZE: usize = 16 << 20;

const MSG_REQUEST: i64 = 0;
const MSG_DATA: i64 = 1;
const MSG_REJECT: i64 = 2;

#[derive(Debug, Serialize)]
struct OutgoingHandshake<'a> {
    m: BTreeMap<&'a str, i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata_size: Option<i64>,
    v: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct ExtHandshake {
    #[serde(default)]
    pub m: BTreeMap<String, i64>,
    pub metadata_size: Option<i64>,
}

impl ExtHandshake {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        de::from_bytes::<ExtHandshake>(payload).context("Failed to parse extension handshake")
    }

    /// The peer's id for `ut_metadata`; 0 means disabled.
    pub fn ut_metadata(&self) -> Option<u8> {
        match self.m.get("ut_metadata") {
            Some(&id) if id > 0 && id <= i64::from(u8::MAX) => Some(id as u8),
            _ => None,
        }
    }

    pub fn metadata_size(&self) -> Option<usize> {
        match self.metadata_size {
            Some(size) if size > 0 && size as usize <= MAX_METADATA_SIZE => Some(size as usize),
            _ => None,
        }
    }
}

pub fn handshake_payload(metadata_size: Option<usize>, client: &str) -> Result<Vec<u8>> {
    let mut m = BTreeMap::new();
    m.insert("ut_metadata", i64::from(UT_METADATA_ID));
    let hs = OutgoingHandshake {
        m,
        metadata_size: metadata_size.map(|s| s as i64),
        v: client,
    };
    serde_bencode::to_bytes(&hs).context("Failed to encode extension handshake")
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    msg_type: i64,
    piece: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_size: Option<i64>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum MetadataMessage {
    Request(usize),
    Data { piece: usize, data: Vec<u8> },
    Reject(usize),
}

fn encode(msg_type: i64, piece: usize, total_size: Option<usize>, data: &[u8]) -> Result<Vec<u8>> {
    let header = Header {
        msg_type,
        piece: piece as i64,
        total_size: total_size.map(|s| s as i64),
    };
    let mut out = serde_bencode::to_bytes(&header).context("Failed to encode metadata message")?;
    out.extend_from_slice(data);
    Ok(out)
}

impl MetadataMessage {
    pub fn to_payload(&self, total_size: usize) -> Result<Vec<u8>> {
        match self {
            MetadataMessage::Request(piece) => encode(MSG_REQUEST, *piece, None, &[]),
            MetadataMessage::Data { piece, data } => {
                encode(MSG_DATA, *piece, Some(total_size), data)
            }
            MetadataMessage::Reject(piece) => encode(MSG_REJECT, *piece, None, &[]),
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        let header_len = bencode_len(payload).context("Truncated metadata message")?;
        let header = de::from_bytes::<Header>(&payload[..header_len])
            .context("Failed to parse metadata message")?;
        ensure!(header.piece >= 0, "Negative metadata piece");
        let piece = header.piece as usize;
        Ok(match header.msg_type {
            MSG_REQUEST => MetadataMessage::Request(piece),
            MSG_DATA => MetadataMessage::Data {
                piece,
                data: payload[header_len..].to_vec(),
            },
            MSG_REJECT => MetadataMessage::Reject(piece),
            other => bail!("Unknown metadata message type {}", other),
        })
    }
}

/// Length of the first bencoded value in `buf`.
fn bencode_len(buf: &[u8]) -> Option<usize> {
    fn value_end(buf: &[u8], pos: usize, depth: usize) -> Option<usize> {
        if depth > 32 {
            return None;
        }
        match *buf.get(pos)? {
            b'i' => {
                let end = buf[pos..].iter().position(|&b| b == b'e')?;
                Some(pos + end + 1)
            }
            b'l' | b'd' => {
                let mut p = pos + 1;
                while *buf.get(p)? != b'e' {
                    p = value_end(buf, p, depth + 1)?;
                }
                Some(p + 1)
            }
            b'0'..=b'9' => {
                let colon = pos + buf[pos..].iter().position(|&b| b == b':')?;
                let len: usize = std::str::from_utf8(&buf[pos..colon]).ok()?.parse().ok()?;
                let end = colon.checked_add(1 + len)?;
                if end > buf.len() {
                    None
                } else {
                    Some(end)
                }
            }
            _ => None,
        }
    }
    value_end(buf, 0, 0)
}

/// Collects metadata pieces until the whole dictionary is present.
#[derive(Debug)]
pub struct MetadataFetch {
    size: usize,
    pieces: Vec<Option<Vec<u8>>>,
}

impl MetadataFetch {
    pub fn new(size: usize) -> Result<Self> {
        ensure!(
            size > 0 && size <= MAX_METADATA_SIZE,
            "Metadata size {} out of range",
            size
        );
        let count = (size + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN;
        Ok(MetadataFetch {
            size,
            pieces: vec![None; count],
        })
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    fn expected_len(&self, piece: usize) -> usize {
        (self.size - piece * METADATA_PIECE_LEN).min(METADATA_PIECE_LEN)
    }

    pub fn insert(&mut self, piece: usize, data: Vec<u8>) -> Result<()> {
        ensure!(piece < self.pieces.len(), "Metadata piece {} out of range", piece);
        ensure!(
            data.len() == self.expected_len(piece),
            "Metadata piece {} has {} bytes, expected {}",
            piece,
            data.len(),
            self.expected_len(piece)
        );
        self.pieces[piece] = Some(data);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(Option::is_some)
    }

    /// Joins the pieces and checks them against the job's info hash.
    pub fn assemble(self, info_hash: &InfoHash) -> Result<Vec<u8>> {
        ensure!(self.is_complete(), "Metadata is incomplete");
        let raw: Vec<u8> = self.pieces.into_iter().flatten().flatten().collect();
        ensure!(
            InfoHash::of(&raw) == *info_hash,
            "Metadata does not match the info hash"
        );
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_roundtrip_through_peer_view() {
        let payload = handshake_payload(Some(1234), "TorFrog/test").unwrap();
        let parsed = ExtHandshake::parse(&payload).unwrap();
        assert_eq!(parsed.ut_metadata(), Some(UT_METADATA_ID));
        assert_eq!(parsed.metadata_size(), Some(1234));
    }

    #[test]
    fn peer_handshake_with_extra_fields() {
        let payload = b"d1:md11:ut_metadatai3e6:ut_pexi0ee13:metadata_sizei31235e1:v5:uT3.4e";
        let parsed = ExtHandshake::parse(payload).unwrap();
        assert_eq!(parsed.ut_metadata(), Some(3));
        assert_eq!(parsed.metadata_size(), Some(31235));
    }

    #[test]
    fn data_message_splits_header_from_bytes() {
        let mut payload = b"d8:msg_typei1e5:piecei0e10:total_sizei3ee".to_vec();
        payload.extend_from_slice(b"abc");
        assert_eq!(
            MetadataMessage::parse(&payload).unwrap(),
            MetadataMessage::Data {
                piece: 0,
                data: b"abc".to_vec()
            }
        );
    }

    #[test]
    fn request_payload_is_plain_dict() {
        let payload = MetadataMessage::Request(2).to_payload(0).unwrap();
        assert_eq!(payload, b"d8:msg_typei0e5:piecei2ee".to_vec());
        assert_eq!(
            MetadataMessage::parse(&payload).unwrap(),
            MetadataMessage::Request(2)
        );
    }

    #[test]
    fn bencode_len_stops_at_first_value() {
        assert_eq!(bencode_len(b"i42eXYZ"), Some(4));
        assert_eq!(bencode_len(b"d1:ali1ei2eee"), Some(13));
        assert_eq!(bencode_len(b"4:spa"), None);
        assert_eq!(bencode_len(b"x"), None);
    }

    #[test]
    fn fetch_verifies_hash() {
        let raw = crate::job::metainfo::tests::single_file_info();
        let hash = InfoHash::of(&raw);
        let mut fetch = MetadataFetch::new(raw.len()).unwrap();
        assert_eq!(fetch.piece_count(), 1);
        assert!(fetch.insert(0, raw[..10].to_vec()).is_err());
        fetch.insert(0, raw.clone()).unwrap();
        assert!(fetch.is_complete());
        assert_eq!(fetch.assemble(&hash).unwrap(), raw);

        let mut wrong = MetadataFetch::new(raw.len()).unwrap();
        wrong.insert(0, raw.clone()).unwrap();
        assert!(wrong.assemble(&InfoHash([0; 20])).is_err());
    }

    #[test]
    fn size_limits() {
        assert!(MetadataFetch::new(0).is_err());
        assert!(MetadataFetch::new(MAX_METADATA_SIZE + 1).is_err());
        assert_eq!(MetadataFetch::new(40_000).unwrap().piece_count(), 3);
    }
}
