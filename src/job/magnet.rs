use super::InfoHash;
use anyhow::{bail, Context, Result};
use url::Url;

const BTIH_PREFIX: &str = "urn:btih:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

impl MagnetLink {
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).context("Failed to parse magnet URI")?;
        if url.scheme() != "magnet" {
            bail!("Not a magnet URI: {}", url.scheme());
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers: Vec<String> = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if let Some(encoded) = value.strip_prefix(BTIH_PREFIX) {
                        info_hash = Some(decode_btih(encoded)?);
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                k if k == "tr" || k.starts_with("tr.") => {
                    let tracker = value.into_owned();
                    if !trackers.contains(&tracker) {
                        trackers.push(tracker);
                    }
                }
                _ => {}
            }
        }

        let info_hash = info_hash.context("Missing urn:btih exact topic")?;
        Ok(MagnetLink {
            info_hash,
            display_name,
            trackers,
        })
    }
}

fn decode_btih(encoded: &str) -> Result<InfoHash> {
    match encoded.len() {
        40 => {
            let mut out = [0u8; 20];
            hex::decode_to_slice(encoded, &mut out).context("Invalid hex info hash")?;
            Ok(InfoHash(out))
        }
        32 => decode_base32(encoded).map(InfoHash),
        n => bail!("Info hash has {} characters, expected 40 (hex) or 32 (base32)", n),
    }
}

/// RFC 4648 base32 of exactly 20 bytes, case-insensitive, no padding.
fn decode_base32(encoded: &str) -> Result<[u8; 20]> {
    let mut out = [0u8; 20];
    let mut buffer: u64 = 0;
    let mut bits = 0;
    let mut i = 0;
    for c in encoded.bytes() {
        let v = match c.to_ascii_uppercase() {
            u @ b'A'..=b'Z' => u - b'A',
            d @ b'2'..=b'7' => d - b'2' + 26,
            _ => bail!("Invalid base32 character {:?} in info hash", c as char),
        };
        buffer = (buffer << 5) | u64::from(v);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out[i] = (buffer >> bits) as u8;
            buffer &= (1 << bits) - 1;
            i += 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

    #[test]
    fn hex_hash_with_name_and_trackers() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=Sintel%20Movie&tr=udp%3A%2F%2Fexplodie.org%3A6969&tr=wss%3A%2F%2Ftracker.btorrent.xyz",
            HEX
        );
        let m = MagnetLink::parse(&uri).unwrap();
        assert_eq!(m.info_hash.to_hex(), HEX);
        assert_eq!(m.display_name.as_deref(), Some("Sintel Movie"));
        assert_eq!(
            m.trackers,
            vec!["udp://explodie.org:6969", "wss://tracker.btorrent.xyz"]
        );
    }

    #[test]
    fn base32_hash() {
        let m = MagnetLink::parse("magnet:?xt=urn:btih:YEX6DQDLXISUVHOJ6UM3GNNKPQJWPKEK").unwrap();
        assert_eq!(m.info_hash.to_hex(), HEX);

        let lower = MagnetLink::parse("magnet:?xt=urn:btih:yex6dqdlxisuvhoj6um3gnnkpqjwpkek").unwrap();
        assert_eq!(lower.info_hash, m.info_hash);
    }

    #[test]
    fn duplicate_trackers_are_dropped() {
        let uri = format!("magnet:?xt=urn:btih:{}&tr=http%3A%2F%2Fa&tr=http%3A%2F%2Fa", HEX);
        assert_eq!(MagnetLink::parse(&uri).unwrap().trackers.len(), 1);
    }

    #[test]
    fn malformed_links() {
        assert!(MagnetLink::parse("magnet:?dn=no-hash").is_err());
        assert!(MagnetLink::parse("magnet:?xt=urn:btih:1234").is_err());
        assert!(MagnetLink::parse("magnet:?xt=urn:btih:zz2fe1c06bba254a9dc9f519b335aa7c1367a88a").is_err());
        assert!(MagnetLink::parse("magnet:?xt=urn:btih:11111111111111111111111111111111").is_err());
    }
}
