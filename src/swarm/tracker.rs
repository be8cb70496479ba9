use super::state::DownloadState;
use crate::job::InfoHash;
use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use serde::Deserialize;
use serde_bencode::de;
use serde_bencode::value::Value;
use std::convert::TryInto;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use url::Url;

pub const MIN_INTERVAL: Duration = Duration::from_secs(60);
pub const MAX_INTERVAL: Duration = Duration::from_secs(1800);
const DEFAULT_INTERVAL: u64 = 300;
const HTTP_TIMEOUT: Duration = Duration::from_secs(20);
const UDP_TIMEOUT: Duration = Duration::from_secs(15);
const UDP_ATTEMPTS: usize = 2;
const UDP_PROTOCOL_ID: u64 = 0x0417_2710_1980;
const NUM_WANT: i32 = 50;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
}

impl AnnounceEvent {
    fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Completed => "completed",
        }
    }

    fn udp_code(event: Option<Self>) -> u32 {
        match event {
            None => 0,
            Some(AnnounceEvent::Completed) => 1,
            Some(AnnounceEvent::Started) => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub state: DownloadState,
    pub event: Option<AnnounceEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug, Deserialize)]
struct HttpResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<u64>,
    peers: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct DictPeer {
    ip: String,
    port: u16,
}

pub fn is_supported(tracker: &str) -> bool {
    match Url::parse(tracker) {
        Ok(url) => matches!(url.scheme(), "http" | "https" | "udp"),
        Err(_) => false,
    }
}

fn clamp_interval(secs: u64) -> Duration {
    Duration::from_secs(secs).clamp(MIN_INTERVAL, MAX_INTERVAL)
}

pub async fn announce(
    client: &reqwest::Client,
    tracker: &str,
    req: &AnnounceRequest,
) -> Result<AnnounceResponse> {
    let url = Url::parse(tracker).with_context(|| format!("Invalid tracker URL {}", tracker))?;
    match url.scheme() {
        "http" | "https" => announce_http(client, &url, req).await,
        "udp" => announce_udp(&url, req).await,
        other => bail!("Unsupported tracker scheme {}", other),
    }
}

fn http_query(req: &AnnounceRequest) -> String {
    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
        req.info_hash.url_encoded(),
        req.peer_id
            .iter()
            .map(|b| format!("%{:02X}", b))
            .collect::<String>(),
        req.port,
        req.state.uploaded,
        req.state.downloaded,
        req.state.left,
        NUM_WANT
    );
    if let Some(event) = req.event {
        query.push_str("&event=");
        query.push_str(event.as_str());
    }
    query
}

async fn announce_http(
    client: &reqwest::Client,
    url: &Url,
    req: &AnnounceRequest,
) -> Result<AnnounceResponse> {
    let separator = if url.query().is_some() { '&' } else { '?' };
    let full = format!("{}{}{}", url, separator, http_query(req));
    log::debug!("url={}", url);

    let res = client
        .get(full)
        .timeout(HTTP_TIMEOUT)
        .send()
        .await
        .context("Failed to contact tracker")?
        .bytes()
        .await
        .context("Failed to read tracker response")?;
    parse_http_response(&res)
}

fn parse_http_response(body: &[u8]) -> Result<AnnounceResponse> {
    let decoded = de::from_bytes::<HttpResponse>(body)
        .with_context(|| "Failed to deserialize tracker response")?;
    if let Some(reason) = decoded.failure_reason {
        bail!("Tracker refused announce: {}", reason);
    }
    let peers = match decoded.peers {
        None => Vec::new(),
        Some(Value::Bytes(compact)) => decode_compact_peers(&compact)?,
        Some(Value::List(entries)) => entries
            .into_iter()
            .filter_map(|entry| {
                let bytes = serde_bencode::to_bytes(&entry).ok()?;
                let peer = de::from_bytes::<DictPeer>(&bytes).ok()?;
                let ip: IpAddr = peer.ip.parse().ok()?;
                Some(SocketAddr::new(ip, peer.port))
            })
            .collect(),
        Some(_) => bail!("Tracker sent peers in an unknown format"),
    };
    Ok(AnnounceResponse {
        interval: clamp_interval(decoded.interval.unwrap_or(DEFAULT_INTERVAL)),
        peers,
    })
}

fn decode_compact_peers(compact_peers: &[u8]) -> Result<Vec<SocketAddr>> {
    if compact_peers.len() % 6 != 0 {
        bail!(
            "The compact peers list has the wrong size: {}",
            compact_peers.len()
        );
    }
    compact_peers
        .chunks(6)
        .map(|bytes| -> Result<SocketAddr> {
            let ip_bytes: [u8; 4] = bytes[0..4]
                .try_into()
                .with_context(|| "Failed to get 4 bytes for the peer ip")?;
            let port = BigEndian::read_u16(&bytes[4..6]);
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip_bytes)), port))
        })
        .collect()
}

fn transaction_id() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    nanos ^ std::process::id().rotate_left(16)
}

async fn udp_exchange(socket: &UdpSocket, packet: &[u8], tid: u32) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; 2048];
    for attempt in 1..=UDP_ATTEMPTS {
        socket
            .send(packet)
            .await
            .context("Failed to send to tracker")?;
        match timeout(UDP_TIMEOUT, socket.recv(&mut buf)).await {
            Ok(received) => {
                let n = received.context("Failed to receive from tracker")?;
                if n < 8 {
                    bail!("Tracker reply is too short: {} bytes", n);
                }
                let action = BigEndian::read_u32(&buf[0..4]);
                if BigEndian::read_u32(&buf[4..8]) != tid {
                    bail!("Tracker reply has the wrong transaction id");
                }
                if action == ACTION_ERROR {
                    bail!(
                        "Tracker refused announce: {}",
                        String::from_utf8_lossy(&buf[8..n])
                    );
                }
                buf.truncate(n);
                return Ok(buf);
            }
            Err(_) => log::debug!("udp tracker timeout, attempt {}", attempt),
        }
    }
    bail!("Tracker did not answer after {} attempts", UDP_ATTEMPTS)
}

fn udp_announce_packet(
    connection_id: u64,
    tid: u32,
    req: &AnnounceRequest,
) -> std::io::Result<Vec<u8>> {
    let mut packet = Vec::with_capacity(98);
    packet.write_u64::<BigEndian>(connection_id)?;
    packet.write_u32::<BigEndian>(ACTION_ANNOUNCE)?;
    packet.write_u32::<BigEndian>(tid)?;
    packet.extend_from_slice(req.info_hash.as_bytes());
    packet.extend_from_slice(&req.peer_id);
    packet.write_u64::<BigEndian>(req.state.downloaded)?;
    packet.write_u64::<BigEndian>(req.state.left)?;
    packet.write_u64::<BigEndian>(req.state.uploaded)?;
    packet.write_u32::<BigEndian>(AnnounceEvent::udp_code(req.event))?;
    packet.write_u32::<BigEndian>(0)?; // ip: default
    packet.write_u32::<BigEndian>(tid.rotate_left(8))?; // key
    packet.write_i32::<BigEndian>(NUM_WANT)?;
    packet.write_u16::<BigEndian>(req.port)?;
    Ok(packet)
}

async fn announce_udp(url: &Url, req: &AnnounceRequest) -> Result<AnnounceResponse> {
    let host = url.host_str().context("Tracker URL has no host")?;
    let port = url.port().context("Tracker URL has no port")?;
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("Failed to bind UDP socket")?;
    socket
        .connect((host, port))
        .await
        .with_context(|| format!("Failed to resolve {}:{}", host, port))?;
    log::debug!("udp tracker {}:{}", host, port);

    let tid = transaction_id();
    let mut connect = Vec::with_capacity(16);
    connect.write_u64::<BigEndian>(UDP_PROTOCOL_ID)?;
    connect.write_u32::<BigEndian>(ACTION_CONNECT)?;
    connect.write_u32::<BigEndian>(tid)?;
    let reply = udp_exchange(&socket, &connect, tid).await?;
    if reply.len() < 16 || BigEndian::read_u32(&reply[0..4]) != ACTION_CONNECT {
        bail!("Malformed connect reply from tracker");
    }
    let connection_id = BigEndian::read_u64(&reply[8..16]);

    let tid = tid.wrapping_add(1);
    let packet = udp_announce_packet(connection_id, tid, req)?;
    let reply = udp_exchange(&socket, &packet, tid).await?;
    parse_udp_announce(&reply)
}

fn parse_udp_announce(reply: &[u8]) -> Result<AnnounceResponse> {
    if reply.len() < 20 || BigEndian::read_u32(&reply[0..4]) != ACTION_ANNOUNCE {
        bail!("Malformed announce reply from tracker");
    }
    let interval = BigEndian::read_u32(&reply[8..12]);
    // reply[12..20] carries leecher and seeder counts.
    let peers_len = (reply.len() - 20) / 6 * 6;
    Ok(AnnounceResponse {
        interval: clamp_interval(u64::from(interval)),
        peers: decode_compact_peers(&reply[20..20 + peers_len])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash([0xab; 20]),
            peer_id: *b"-TF0100-123456789012",
            port: 6881,
            state: DownloadState {
                uploaded: 1,
                downloaded: 2,
                left: 3,
            },
            event: Some(AnnounceEvent::Started),
        }
    }

    #[test]
    fn supported_schemes() {
        assert!(is_supported("udp://tracker.opentrackr.org:1337/announce"));
        assert!(is_supported("https://tracker.test/announce"));
        assert!(!is_supported("wss://tracker.btorrent.xyz"));
        assert!(!is_supported("not a url"));
    }

    #[test]
    fn compact_peers() {
        let peers = decode_compact_peers(&[127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80]).unwrap();
        assert_eq!(
            peers,
            vec![
                "127.0.0.1:6881".parse().unwrap(),
                "10.0.0.2:80".parse().unwrap()
            ]
        );
        assert!(decode_compact_peers(&[1, 2, 3]).is_err());
    }

    #[test]
    fn http_response_variants() {
        let compact = b"d8:intervali900e5:peers6:\x7f\x00\x00\x01\x1a\xe1e";
        let res = parse_http_response(compact).unwrap();
        assert_eq!(res.interval, Duration::from_secs(900));
        assert_eq!(res.peers, vec!["127.0.0.1:6881".parse().unwrap()]);

        let dict = b"d8:intervali5e5:peersld2:ip8:10.0.0.24:porti80eeee";
        let res = parse_http_response(dict).unwrap();
        assert_eq!(res.interval, MIN_INTERVAL);
        assert_eq!(res.peers, vec!["10.0.0.2:80".parse().unwrap()]);

        let failed = b"d14:failure reason9:not founde";
        let err = parse_http_response(failed).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn query_has_every_field() {
        let query = http_query(&request());
        assert!(query.starts_with(&format!("info_hash={}", "%AB".repeat(20))));
        assert!(query.contains("&port=6881&uploaded=1&downloaded=2&left=3&compact=1"));
        assert!(query.ends_with("&event=started"));
    }

    #[test]
    fn udp_announce_layout() {
        let packet = udp_announce_packet(0x1122_3344_5566_7788, 7, &request()).unwrap();
        assert_eq!(packet.len(), 98);
        assert_eq!(BigEndian::read_u32(&packet[8..12]), ACTION_ANNOUNCE);
        assert_eq!(&packet[16..36], &[0xab; 20]);
        assert_eq!(BigEndian::read_u64(&packet[56..64]), 2);
        assert_eq!(BigEndian::read_u32(&packet[80..84]), 2);
        assert_eq!(BigEndian::read_u16(&packet[96..98]), 6881);

        let mut reply = vec![0, 0, 0, 1, 0, 0, 0, 7, 0, 0, 0x07, 0x08, 0, 0, 0, 0, 0, 0, 0, 0];
        reply.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        let res = parse_udp_announce(&reply).unwrap();
        assert_eq!(res.interval, Duration::from_secs(1800));
        assert_eq!(res.peers.len(), 1);
    }
}
