use super::message::{
    take_frame, Handshake, Message, BLOCK_LENGTH, HANDSHAKE_LEN, MAX_MESSAGE_LEN,
};
use super::metadata::{
    self, ExtHandshake, MetadataFetch, MetadataMessage, METADATA_PIECE_LEN, UT_METADATA_ID,
};
use super::state::{lock, JobState, Torrent};
use crate::engine::EngineEvent;
use anyhow::{bail, Context, Result};
use bit_vec::BitVec;
use derivative::Derivative;
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const TICK: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);
const IDLE_TIMEOUT: Duration = Duration::from_secs(180);
const PIPELINE_DEPTH: usize = 8;
const MAX_REQUEST_LEN: u32 = 128 * 1024;
const READ_CHUNK: usize = 32 * 1024;
/// As many pieces as the largest bitfield frame can describe.
const MAX_PIECES: usize = MAX_MESSAGE_LEN * 8;

/// A piece being assembled from blocks.
#[derive(Derivative)]
#[derivative(Debug)]
struct PieceJob {
    index: u32,
    size: u32,
    next_begin: u32,
    outstanding: usize,
    blocks: BitVec,
    received: u32,
    #[derivative(Debug = "ignore")]
    buf: Vec<u8>,
}

impl PieceJob {
    fn new(index: u32, size: u32) -> Self {
        let block_count = ((size + BLOCK_LENGTH - 1) / BLOCK_LENGTH) as usize;
        PieceJob {
            index,
            size,
            next_begin: 0,
            outstanding: 0,
            blocks: BitVec::from_elem(block_count, false),
            received: 0,
            buf: vec![0; size as usize],
        }
    }

    /// Requests to send so that at most `PIPELINE_DEPTH` are in flight.
    fn next_requests(&mut self) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        while self.outstanding < PIPELINE_DEPTH && self.next_begin < self.size {
            let length = BLOCK_LENGTH.min(self.size - self.next_begin);
            out.push((self.next_begin, length));
            self.next_begin += length;
            self.outstanding += 1;
        }
        out
    }

    /// Stores a block. Returns false for blocks we did not ask for.
    fn accept(&mut self, begin: u32, data: &[u8]) -> bool {
        let slot = (begin / BLOCK_LENGTH) as usize;
        let expected = BLOCK_LENGTH.min(self.size.saturating_sub(begin));
        if begin % BLOCK_LENGTH != 0
            || begin >= self.next_begin
            || data.len() as u32 != expected
            || self.blocks.get(slot).unwrap_or(true)
        {
            return false;
        }
        self.buf[begin as usize..begin as usize + data.len()].copy_from_slice(data);
        self.blocks.set(slot, true);
        self.received += expected;
        self.outstanding = self.outstanding.saturating_sub(1);
        true
    }

    fn is_complete(&self) -> bool {
        self.received == self.size
    }
}

enum Wake {
    Shutdown,
    Tick,
    Read(usize),
}

#[derive(Derivative)]
#[derivative(Debug)]
struct Peer {
    addr: SocketAddr,
    job: Arc<JobState>,
    #[derivative(Debug = "ignore")]
    stream: TcpStream,
    #[derivative(Debug = "ignore")]
    inbox: Vec<u8>,
    torrent: Option<Arc<Torrent>>,
    bits: BitVec,
    registered: bool,
    am_choked: bool,
    am_interested: bool,
    peer_choked: bool,
    extensions: bool,
    ut_metadata: Option<u8>,
    fetch: Option<MetadataFetch>,
    current: Option<PieceJob>,
    last_sent: Instant,
    last_received: Instant,
}

async fn handshake(stream: &mut TcpStream, job: &JobState, addr: &SocketAddr) -> Result<bool> {
    let ours = Handshake {
        info_hash: job.info_hash.0,
        peer_id: job.peer_id,
        extensions: true,
    };
    stream
        .write_all(&ours.to_bytes())
        .await
        .with_context(|| "Failed to write handshake to peer")?;
    log::debug!("{}: Sent handshake", addr);

    let mut buf = [0u8; HANDSHAKE_LEN];
    stream
        .read_exact(&mut buf)
        .await
        .with_context(|| "Failed to read handshake from peer")?;
    let theirs = Handshake::parse(&buf)?;
    if theirs.info_hash != job.info_hash.0 {
        bail!("{}: Peer answered for another torrent", addr);
    }
    log::debug!(
        "{}: Validated handshake, extensions={}",
        addr,
        theirs.extensions
    );
    Ok(theirs.extensions)
}

/// Connects to `addr` and trades pieces until the connection dies or the
/// job shuts down.
pub async fn run(job: Arc<JobState>, addr: SocketAddr) -> Result<()> {
    log::debug!("{}: Trying to connect", addr);
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .with_context(|| "Timed out connecting")?
        .with_context(|| "Failed to connect")?;
    log::debug!("{}: Connected", addr);

    let extensions = timeout(HANDSHAKE_TIMEOUT, handshake(&mut stream, &job, &addr))
        .await
        .with_context(|| "Timed out during handshake")??;

    let mut peer = Peer::new(addr, job, stream, extensions);
    peer.start().await?;
    peer.talk().await
}

impl Peer {
    fn new(addr: SocketAddr, job: Arc<JobState>, stream: TcpStream, extensions: bool) -> Self {
        job.peers.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        Peer {
            addr,
            job,
            stream,
            inbox: Vec::with_capacity(READ_CHUNK),
            torrent: None,
            bits: BitVec::new(),
            registered: false,
            am_choked: true,
            am_interested: false,
            peer_choked: true,
            extensions,
            ut_metadata: None,
            fetch: None,
            current: None,
            last_sent: now,
            last_received: now,
        }
    }

    async fn send(&mut self, msg: &Message) -> Result<()> {
        let mut buf = Vec::new();
        msg.write_to(&mut buf)?;
        self.stream
            .write_all(&buf)
            .await
            .with_context(|| format!("Failed to write {:?} to peer", msg.tag()))?;
        self.last_sent = Instant::now();
        Ok(())
    }

    fn torrent(&mut self) -> Option<Arc<Torrent>> {
        if self.torrent.is_none() {
            self.torrent = self.job.torrent();
        }
        self.torrent.clone()
    }

    async fn start(&mut self) -> Result<()> {
        let torrent = self.torrent();
        if self.extensions {
            let size = torrent.as_ref().map(|t| t.raw_info.len());
            let payload = metadata::handshake_payload(size, &self.job.client_name)?;
            self.send(&Message::Extended {
                id: metadata::HANDSHAKE_ID,
                payload,
            })
            .await?;
            log::debug!("{}: Sent extension handshake", self.addr);
        }
        if let Some(torrent) = torrent {
            let have = lock(&torrent.picker).bitfield().clone();
            if have.any() {
                self.send(&Message::Bitfield(have)).await?;
            }
        }
        Ok(())
    }

    async fn talk(&mut self) -> Result<()> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            self.fill_requests().await?;

            let wake = tokio::select! {
                _ = self.job.shutdown.cancelled() => Wake::Shutdown,
                _ = sleep(TICK) => Wake::Tick,
                read = self.stream.read(&mut chunk) => {
                    Wake::Read(read.with_context(|| "Failed to read from peer")?)
                }
            };
            match wake {
                Wake::Shutdown => return Ok(()),
                Wake::Tick => {
                    if self.last_received.elapsed() > IDLE_TIMEOUT {
                        bail!("{}: Peer went quiet", self.addr);
                    }
                    if self.last_sent.elapsed() >= KEEPALIVE_INTERVAL {
                        self.send(&Message::KeepAlive).await?;
                    }
                }
                Wake::Read(0) => {
                    log::debug!("{}: Connection closed", self.addr);
                    return Ok(());
                }
                Wake::Read(n) => {
                    self.last_received = Instant::now();
                    self.inbox.extend_from_slice(&chunk[..n]);
                    while let Some(msg) = take_frame(&mut self.inbox)? {
                        self.handle(msg).await?;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::KeepAlive | Message::Cancel { .. } | Message::Port(_) => {}
            Message::Choke => {
                log::debug!("{}: Choked", self.addr);
                self.am_choked = true;
                self.release_current();
            }
            Message::Unchoke => {
                log::debug!("{}: Unchoked", self.addr);
                self.am_choked = false;
            }
            Message::Interested => {
                if self.peer_choked {
                    self.peer_choked = false;
                    self.send(&Message::Unchoke).await?;
                }
            }
            Message::NotInterested => {}
            Message::Have(index) => {
                let index = index as usize;
                if index >= MAX_PIECES {
                    bail!("{}: Have for piece {} is out of range", self.addr, index);
                }
                if index >= self.bits.len() {
                    self.bits.grow(index + 1 - self.bits.len(), false);
                }
                self.bits.set(index, true);
                if self.registered {
                    if let Some(t) = &self.torrent {
                        lock(&t.picker).peer_has(index);
                    }
                }
            }
            Message::Bitfield(bits) => {
                if self.registered {
                    if let Some(t) = &self.torrent {
                        let mut picker = lock(&t.picker);
                        picker.remove_peer(&self.bits);
                        picker.add_peer(&bits);
                    }
                }
                self.bits = bits;
            }
            Message::Request {
                index,
                begin,
                length,
            } => self.serve(index, begin, length).await?,
            Message::Piece { index, begin, data } => self.on_block(index, begin, data).await?,
            Message::Extended { id, payload } => self.on_extended(id, &payload).await?,
        }
        Ok(())
    }

    async fn serve(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        let torrent = match self.torrent() {
            Some(t) => t,
            None => return Ok(()),
        };
        let piece = index as usize;
        let size = torrent.info.piece_size(piece);
        if self.peer_choked
            || length == 0
            || length > MAX_REQUEST_LEN
            || u64::from(begin) + u64::from(length) > size
            || !lock(&torrent.picker).has(piece)
        {
            log::debug!("{}: Ignoring request {}:{}+{}", self.addr, index, begin, length);
            return Ok(());
        }
        let mut data = vec![0u8; length as usize];
        let offset = piece as u64 * torrent.info.piece_length + u64::from(begin);
        lock(&torrent.storage).read(offset, &mut data)?;
        self.job.limits.upload.acquire(data.len()).await;
        self.send(&Message::Piece { index, begin, data }).await?;
        self.job
            .uploaded
            .fetch_add(u64::from(length), Ordering::Relaxed);
        Ok(())
    }

    async fn on_block(&mut self, index: u32, begin: u32, data: Vec<u8>) -> Result<()> {
        let accepted = match self.current.as_mut() {
            Some(job) if job.index == index => job.accept(begin, &data),
            _ => false,
        };
        if !accepted {
            log::debug!("{}: Unexpected block {}:{}", self.addr, index, begin);
            return Ok(());
        }
        self.job
            .downloaded
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        let done = self.current.as_ref().map_or(false, PieceJob::is_complete);
        if !done {
            return Ok(());
        }
        let (job, torrent) = match (self.current.take(), self.torrent()) {
            (Some(job), Some(torrent)) => (job, torrent),
            _ => return Ok(()),
        };
        let piece = job.index as usize;
        let expected = torrent.info.piece_hash(piece).unwrap_or_default();
        if Sha1::digest(&job.buf).as_slice() != expected {
            log::warn!("{}: Piece {} failed verification", self.addr, piece);
            lock(&torrent.picker).release(piece);
            return Ok(());
        }

        let offset = piece as u64 * torrent.info.piece_length;
        let written = lock(&torrent.storage).write(offset, &job.buf);
        if let Err(e) = written {
            lock(&torrent.picker).release(piece);
            self.job.emit(EngineEvent::Error(format!(
                "Failed to write piece {}: {:#}",
                piece, e
            )));
            return Ok(());
        }

        let complete = {
            let mut picker = lock(&torrent.picker);
            picker.complete(piece);
            picker.is_complete()
        };
        log::debug!("{}: Piece {} verified", self.addr, piece);
        self.send(&Message::Have(job.index)).await?;
        if complete {
            self.job.mark_finished(&torrent);
        }
        Ok(())
    }

    async fn on_extended(&mut self, id: u8, payload: &[u8]) -> Result<()> {
        if id == metadata::HANDSHAKE_ID {
            let hs = ExtHandshake::parse(payload)?;
            self.ut_metadata = hs.ut_metadata();
            log::debug!(
                "{}: Extension handshake ut_metadata={:?} metadata_size={:?}",
                self.addr,
                self.ut_metadata,
                hs.metadata_size
            );
            if let (None, Some(ext), Some(size)) =
                (self.torrent(), self.ut_metadata, hs.metadata_size())
            {
                let fetch = MetadataFetch::new(size)?;
                for piece in 0..fetch.piece_count() {
                    let payload = MetadataMessage::Request(piece).to_payload(size)?;
                    self.send(&Message::Extended { id: ext, payload }).await?;
                }
                self.fetch = Some(fetch);
            }
            return Ok(());
        }
        if id != UT_METADATA_ID {
            return Ok(());
        }

        match MetadataMessage::parse(payload)? {
            MetadataMessage::Request(piece) => self.serve_metadata(piece).await?,
            MetadataMessage::Reject(piece) => {
                log::debug!("{}: Metadata piece {} rejected", self.addr, piece);
                self.fetch = None;
            }
            MetadataMessage::Data { piece, data } => {
                let fetch = match self.fetch.as_mut() {
                    Some(f) => f,
                    None => return Ok(()),
                };
                fetch.insert(piece, data)?;
                if !fetch.is_complete() {
                    return Ok(());
                }
                if let Some(fetch) = self.fetch.take() {
                    let installed = fetch
                        .assemble(&self.job.info_hash)
                        .and_then(|raw| self.job.install_metadata(raw));
                    match installed {
                        Ok(torrent) => self.torrent = Some(torrent),
                        Err(e) => self.job.emit(EngineEvent::Error(format!(
                            "Invalid metadata from {}: {:#}",
                            self.addr, e
                        ))),
                    }
                }
            }
        }
        Ok(())
    }

    async fn serve_metadata(&mut self, piece: usize) -> Result<()> {
        let ext = match self.ut_metadata {
            Some(ext) => ext,
            None => return Ok(()),
        };
        let reply = match self.torrent() {
            Some(t) => {
                let start = piece.saturating_mul(METADATA_PIECE_LEN);
                match t.raw_info.get(start..) {
                    Some(rest) if !rest.is_empty() => {
                        let end = rest.len().min(METADATA_PIECE_LEN);
                        let msg = MetadataMessage::Data {
                            piece,
                            data: rest[..end].to_vec(),
                        };
                        msg.to_payload(t.raw_info.len())?
                    }
                    _ => MetadataMessage::Reject(piece).to_payload(0)?,
                }
            }
            None => MetadataMessage::Reject(piece).to_payload(0)?,
        };
        self.send(&Message::Extended { id: ext, payload: reply })
            .await
    }

    async fn fill_requests(&mut self) -> Result<()> {
        let torrent = match self.torrent() {
            Some(t) => t,
            None => return Ok(()),
        };
        if !self.registered {
            lock(&torrent.picker).add_peer(&self.bits);
            self.registered = true;
        }
        if self.job.is_finished() {
            return Ok(());
        }

        let wants = self.current.is_some() || lock(&torrent.picker).wants_any(&self.bits);
        if wants != self.am_interested {
            self.am_interested = wants;
            let msg = match wants {
                true => Message::Interested,
                false => Message::NotInterested,
            };
            self.send(&msg).await?;
        }
        if self.am_choked || !wants {
            return Ok(());
        }

        if self.current.is_none() {
            let picked = lock(&torrent.picker).pick(&self.bits, self.job.is_sequential());
            match picked {
                Some(index) => {
                    let size = torrent.info.piece_size(index) as u32;
                    log::debug!("{}: Downloading piece {}", self.addr, index);
                    self.current = Some(PieceJob::new(index as u32, size));
                }
                None => return Ok(()),
            }
        }

        let (index, requests) = match self.current.as_mut() {
            Some(job) => (job.index, job.next_requests()),
            None => return Ok(()),
        };
        for (begin, length) in requests {
            self.job.limits.download.acquire(length as usize).await;
            self.send(&Message::Request {
                index,
                begin,
                length,
            })
            .await?;
        }
        Ok(())
    }

    fn release_current(&mut self) {
        if let (Some(job), Some(t)) = (self.current.take(), &self.torrent) {
            lock(&t.picker).release(job.index as usize);
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.job.peers.fetch_sub(1, Ordering::Relaxed);
        self.release_current();
        if self.registered {
            if let Some(t) = &self.torrent {
                lock(&t.picker).remove_peer(&self.bits);
            }
        }
        lock(&self.job.known_peers).remove(&self.addr);
    }
}
