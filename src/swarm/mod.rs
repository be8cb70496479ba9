//! A small BitTorrent engine: trackers, peers, verified pieces on disk.

pub mod message;
pub mod metadata;
pub mod peer;
pub mod pieces;
pub mod rate;
pub mod state;
pub mod storage;
pub mod tracker;

use crate::config::SwarmConfig;
use crate::engine::{EngineEvent, JobHandle, Session, StatusSnapshot};
use crate::error::Error;
use crate::job::JobDescriptor;
use anyhow::{Context, Result};
use rate::{Limits, RateMeter};
use sha1::{Digest, Sha1};
use state::{lock, JobState, Torrent};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracker::{AnnounceEvent, AnnounceRequest};

const PEER_ID_PREFIX: &[u8; 8] = b"-TF0100-";
const RATE_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Azureus-style peer id: client prefix plus twelve pseudo-random digits.
fn generate_peer_id() -> [u8; 20] {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut hasher = Sha1::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    let digest = hasher.finalize();

    let mut id = [0u8; 20];
    id[..8].copy_from_slice(PEER_ID_PREFIX);
    for (slot, byte) in id[8..].iter_mut().zip(digest.iter()) {
        *slot = b'0' + byte % 10;
    }
    id
}

pub struct SwarmSession {
    config: SwarmConfig,
    client: reqwest::Client,
    limits: Arc<Limits>,
    peer_id: [u8; 20],
    events_tx: UnboundedSender<EngineEvent>,
    events_rx: UnboundedReceiver<EngineEvent>,
    shutdown: CancellationToken,
}

impl SwarmSession {
    pub fn new(config: SwarmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        log::info!(
            "session: download limit {} B/s, upload limit {} B/s, {} extra tracker(s)",
            config.download_limit,
            config.upload_limit,
            config.extra_trackers.len()
        );
        Ok(SwarmSession {
            limits: Arc::new(Limits::new(config.download_limit, config.upload_limit)),
            config,
            client,
            peer_id: generate_peer_id(),
            events_tx,
            events_rx,
            shutdown: CancellationToken::new(),
        })
    }

    fn trackers_for(&self, job: &JobDescriptor) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for url in job.trackers().into_iter().chain(self.config.extra_trackers.clone()) {
            if !tracker::is_supported(&url) {
                log::debug!("skipping tracker {}", url);
                continue;
            }
            if !out.contains(&url) {
                out.push(url);
            }
        }
        out
    }
}

impl Session for SwarmSession {
    type Handle = SwarmHandle;

    fn add_job(&mut self, job: JobDescriptor, save_path: &Path) -> Result<SwarmHandle, Error> {
        let trackers = self.trackers_for(&job);
        let state = Arc::new(JobState::new(
            job.info_hash(),
            self.peer_id,
            self.config.user_agent.clone(),
            save_path.to_path_buf(),
            job.name(),
            self.events_tx.clone(),
            self.limits.clone(),
            self.shutdown.child_token(),
        ));

        if let JobDescriptor::Metainfo(meta) = job {
            let meta = *meta;
            let torrent = Torrent::open(save_path, meta.info, meta.raw_info)
                .map_err(|e| Error::Rejected(format!("{:#}", e)))?;
            state.install(torrent);
        }
        log::info!(
            "{}: added, {} tracker(s), saving to {}",
            state.info_hash,
            trackers.len(),
            save_path.display()
        );

        let (found_tx, found_rx) = mpsc::unbounded_channel();
        if trackers.is_empty() {
            state.emit(EngineEvent::Error("No trackers to announce to".into()));
        }
        for url in trackers {
            let state = state.clone();
            let client = self.client.clone();
            let found = found_tx.clone();
            let port = self.config.listen_port;
            tokio::spawn(async move {
                let shutdown = state.shutdown.clone();
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = announce_loop(state, client, url, port, found) => {}
                }
            });
        }
        drop(found_tx);

        let dialer = state.clone();
        let max = self.config.max_connections;
        tokio::spawn(async move {
            let shutdown = dialer.shutdown.clone();
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = dial_peers(dialer, found_rx, max) => {}
            }
        });

        let sampler = state.clone();
        tokio::spawn(async move {
            let shutdown = sampler.shutdown.clone();
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = sample_rates(sampler) => {}
            }
        });

        Ok(SwarmHandle { job: state })
    }

    fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Drop for SwarmSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct SwarmHandle {
    job: Arc<JobState>,
}

impl JobHandle for SwarmHandle {
    fn status(&self) -> StatusSnapshot {
        self.job.snapshot()
    }

    fn set_sequential(&self, enabled: bool) {
        log::debug!("{}: sequential={}", self.job.info_hash, enabled);
        self.job.set_sequential(enabled);
    }
}

async fn announce_loop(
    job: Arc<JobState>,
    client: reqwest::Client,
    url: String,
    port: u16,
    found: UnboundedSender<Vec<SocketAddr>>,
) {
    let mut event = Some(AnnounceEvent::Started);
    let mut reported_completion = job.is_finished();
    loop {
        let req = AnnounceRequest {
            info_hash: job.info_hash,
            peer_id: job.peer_id,
            port,
            state: job.announce_state(),
            event,
        };
        let wait = match tracker::announce(&client, &url, &req).await {
            Ok(res) => {
                log::info!("{}: {} peer(s) from {}", job.info_hash, res.peers.len(), url);
                event = None;
                if found.send(res.peers).is_err() {
                    return;
                }
                res.interval
            }
            Err(e) => {
                log::warn!("{}: announce to {} failed: {:#}", job.info_hash, url, e);
                RETRY_INTERVAL
            }
        };

        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            tokio::time::sleep(RATE_SAMPLE_INTERVAL).await;
            if !reported_completion && job.is_finished() {
                reported_completion = true;
                event = Some(AnnounceEvent::Completed);
                break;
            }
        }
    }
}

async fn dial_peers(
    job: Arc<JobState>,
    mut found: UnboundedReceiver<Vec<SocketAddr>>,
    max_connections: usize,
) {
    let slots = Arc::new(Semaphore::new(max_connections));
    while let Some(peers) = found.recv().await {
        for addr in peers {
            if job.is_finished() {
                break;
            }
            if !lock(&job.known_peers).insert(addr) {
                continue;
            }
            let permit = match slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    lock(&job.known_peers).remove(&addr);
                    break;
                }
            };
            let job = job.clone();
            tokio::spawn(async move {
                if let Err(e) = peer::run(job.clone(), addr).await {
                    log::debug!("{}: {:#}", addr, e);
                    lock(&job.known_peers).remove(&addr);
                }
                drop(permit);
            });
        }
    }
}

async fn sample_rates(job: Arc<JobState>) {
    let mut down = RateMeter::default();
    let mut up = RateMeter::default();
    let mut ticker = tokio::time::interval(RATE_SAMPLE_INTERVAL);
    loop {
        ticker.tick().await;
        let now = Instant::now();
        let d = down.sample(job.downloaded.load(std::sync::atomic::Ordering::Relaxed), now);
        let u = up.sample(job.uploaded.load(std::sync::atomic::Ordering::Relaxed), now);
        job.set_rates(d, u);
    }
}
