use super::InfoHash;
use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;
use serde_bencode::de;
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use std::fs::File as F;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

pub const PIECE_HASH_LEN: usize = 20;

#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Info {
    pub name: String,
    pub pieces: ByteBuf,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<FileEntry>>,
    pub private: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    info: Value,
    announce: Option<String>,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
}

/// A decoded `.torrent` file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info: Info,
    pub info_hash: InfoHash,
    /// The bencoded info dictionary the hash was taken over.
    pub raw_info: Vec<u8>,
    pub announce: Option<String>,
    pub announce_list: Vec<Vec<String>>,
}

fn check_component(part: &str) -> Result<()> {
    let mut components = Path::new(part).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => bail!("Unsafe path component {:?}", part),
    }
}

impl Info {
    /// Decodes and validates a bencoded info dictionary.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let info = de::from_bytes::<Info>(raw).context("Failed to parse info dictionary")?;
        info.validate()?;
        Ok(info)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.piece_length > 0, "Piece length is zero");
        ensure!(
            self.pieces.len() % PIECE_HASH_LEN == 0,
            "Piece hash table has {} bytes, not a multiple of {}",
            self.pieces.len(),
            PIECE_HASH_LEN
        );
        check_component(&self.name)?;
        match (&self.length, &self.files) {
            (Some(_), None) => {}
            (None, Some(files)) => {
                ensure!(!files.is_empty(), "Multi-file torrent lists no files");
                for file in files {
                    ensure!(!file.path.is_empty(), "File entry with an empty path");
                    for part in &file.path {
                        check_component(part)?;
                    }
                }
            }
            _ => bail!("Info dictionary needs exactly one of `length` or `files`"),
        }
        let expected = (self.total_length() + self.piece_length - 1) / self.piece_length;
        ensure!(
            self.piece_count() as u64 == expected,
            "Torrent has {} piece hashes but {} pieces of data",
            self.piece_count(),
            expected
        );
        Ok(())
    }

    pub fn total_length(&self) -> u64 {
        match (&self.length, &self.files) {
            (Some(length), _) => *length,
            (None, Some(files)) => files.iter().map(|f| f.length).sum(),
            (None, None) => 0,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len() / PIECE_HASH_LEN
    }

    pub fn piece_hash(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(PIECE_HASH_LEN)?;
        self.pieces.get(start..start + PIECE_HASH_LEN)
    }

    /// Size of piece `index`; the last piece is usually short.
    pub fn piece_size(&self, index: usize) -> u64 {
        let offset = index as u64 * self.piece_length;
        self.total_length()
            .saturating_sub(offset)
            .min(self.piece_length)
    }

    /// Files relative to the save directory, in torrent order.
    pub fn layout(&self) -> Vec<(PathBuf, u64)> {
        match &self.files {
            None => vec![(PathBuf::from(&self.name), self.length.unwrap_or(0))],
            Some(files) => files
                .iter()
                .map(|f| {
                    let mut path = PathBuf::from(&self.name);
                    path.extend(&f.path);
                    (path, f.length)
                })
                .collect(),
        }
    }
}

impl Metainfo {
    pub fn from_bytes(content: &[u8]) -> Result<Self> {
        let raw = de::from_bytes::<RawMetainfo>(content).context("Failed to parse torrent file")?;
        let raw_info =
            serde_bencode::to_bytes(&raw.info).context("Failed to encode info dictionary")?;
        let info = Info::from_bytes(&raw_info)?;
        Ok(Metainfo {
            info_hash: InfoHash::of(&raw_info),
            info,
            raw_info,
            announce: raw.announce,
            announce_list: raw.announce_list.unwrap_or_default(),
        })
    }

    pub fn from_file(file_name: &Path) -> Result<Self> {
        let mut f = F::open(file_name).context("Failed to open torrent file")?;
        let mut content = Vec::with_capacity(100_000);
        f.read_to_end(&mut content)
            .context("Failed to read torrent file")?;
        Self::from_bytes(&content)
    }

    /// Tier order from `announce-list`, falling back to `announce`.
    pub fn trackers(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let tiers = self.announce_list.iter().flatten();
        for url in tiers.chain(self.announce.iter()) {
            if !out.contains(url) {
                out.push(url.clone());
            }
        }
        out
    }
}
