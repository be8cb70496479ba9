//! What the user asked us to download: a magnet link or a `.torrent` file.

pub mod magnet;
pub mod metainfo;

pub use magnet::MagnetLink;
pub use metainfo::{FileEntry, Info, Metainfo};

use crate::error::Error;
use sha1::{Digest, Sha1};
use std::fmt;
use std::path::Path;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// SHA-1 of a bencoded info dictionary.
    pub fn of(info_bytes: &[u8]) -> Self {
        InfoHash(Sha1::digest(info_bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Every byte percent-escaped, as trackers expect in a query string.
    pub fn url_encoded(&self) -> String {
        self.0.iter().map(|b| format!("%{:02X}", b)).collect()
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

#[derive(Debug, Clone)]
pub enum JobDescriptor {
    Magnet(MagnetLink),
    Metainfo(Box<Metainfo>),
}

pub fn is_magnet(input: &str) -> bool {
    input.starts_with("magnet:?")
}

impl JobDescriptor {
    /// Magnet links are parsed in place; anything else is read as a
    /// `.torrent` path.
    pub fn from_input(input: &str) -> Result<Self, Error> {
        if is_magnet(input) {
            MagnetLink::parse(input)
                .map(JobDescriptor::Magnet)
                .map_err(|err| Error::InvalidMagnet(format!("{:#}", err)))
        } else {
            let path = Path::new(input);
            Metainfo::from_file(path)
                .map(|m| JobDescriptor::Metainfo(Box::new(m)))
                .map_err(|err| Error::Unreadable {
                    path: path.to_path_buf(),
                    reason: format!("{:#}", err),
                })
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        match self {
            JobDescriptor::Magnet(m) => m.info_hash,
            JobDescriptor::Metainfo(m) => m.info_hash,
        }
    }

    pub fn name(&self) -> String {
        match self {
            JobDescriptor::Magnet(m) => m
                .display_name
                .clone()
                .unwrap_or_else(|| m.info_hash.to_hex()),
            JobDescriptor::Metainfo(m) => m.info.name.clone(),
        }
    }

    pub fn trackers(&self) -> Vec<String> {
        match self {
            JobDescriptor::Magnet(m) => m.trackers.clone(),
            JobDescriptor::Metainfo(m) => m.trackers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magnet_detection() {
        assert!(is_magnet("magnet:?xt=urn:btih:abc"));
        assert!(!is_magnet("magnet.torrent"));
        assert!(!is_magnet("./magnet:?x"));
    }

    #[test]
    fn bad_magnet_maps_to_exit_code_3() {
        let err = JobDescriptor::from_input("magnet:?dn=nothing").unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn missing_file_maps_to_exit_code_2() {
        let err = JobDescriptor::from_input("/definitely/not/here.torrent").unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn magnet_name_falls_back_to_hash() {
        let job =
            JobDescriptor::from_input("magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a")
                .unwrap();
        assert_eq!(job.name(), "c12fe1c06bba254a9dc9f519b335aa7c1367a88a");
        assert!(job.trackers().is_empty());
    }

    #[test]
    fn url_encoding_escapes_every_byte() {
        let hash = InfoHash([0xab; 20]);
        assert_eq!(hash.url_encoded(), "%AB".repeat(20));
        assert_eq!(hash.to_string(), "ab".repeat(20));
    }
}
