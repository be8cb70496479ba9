use super::pieces::PiecePicker;
use super::rate::Limits;
use super::storage::Storage;
use crate::engine::{EngineEvent, StatusSnapshot};
use crate::job::{Info, InfoHash};
use anyhow::{ensure, Context, Result};
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// What trackers are told about our progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadState {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Poisoning only means another task panicked mid-update; the data is still usable.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A job whose info dictionary is known.
#[derive(Debug)]
pub struct Torrent {
    pub info: Info,
    pub raw_info: Vec<u8>,
    pub storage: Mutex<Storage>,
    pub picker: Mutex<PiecePicker>,
}

/// Hashes every piece already on disk and marks the good ones as ours.
fn recheck(storage: &Storage, info: &Info, picker: &mut PiecePicker) -> Result<usize> {
    let mut buf = Vec::new();
    let mut found = 0;
    let mut offset = 0;
    for index in 0..info.piece_count() {
        let size = info.piece_size(index);
        buf.resize(size as usize, 0);
        storage
            .read(offset, &mut buf)
            .with_context(|| format!("Failed to read piece {} for recheck", index))?;
        offset += size;
        let digest = Sha1::digest(&buf);
        if info.piece_hash(index) == Some(digest.as_slice()) && picker.complete(index) {
            found += 1;
        }
    }
    Ok(found)
}

impl Torrent {
    /// Opens the files under `save_path`. Files that already hold data are
    /// rechecked so verified pieces are not fetched again.
    pub fn open(save_path: &std::path::Path, info: Info, raw_info: Vec<u8>) -> Result<Self> {
        let storage = Storage::create(save_path, &info)?;
        let mut picker = PiecePicker::new(&info);
        if storage.has_existing_data() {
            let found = recheck(&storage, &info, &mut picker)?;
            log::info!(
                "{}: {} of {} piece(s) already on disk ({} bytes checked)",
                info.name,
                found,
                info.piece_count(),
                storage.total()
            );
        }
        Ok(Torrent {
            info,
            raw_info,
            storage: Mutex::new(storage),
            picker: Mutex::new(picker),
        })
    }
}

/// Everything the peer, tracker and sampler tasks of one job share.
#[derive(Debug)]
pub struct JobState {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub client_name: String,
    pub save_path: PathBuf,
    name: Mutex<String>,
    torrent: RwLock<Option<Arc<Torrent>>>,
    pub downloaded: AtomicU64,
    pub uploaded: AtomicU64,
    download_rate: AtomicU64,
    upload_rate: AtomicU64,
    pub peers: AtomicU32,
    sequential: AtomicBool,
    finished: AtomicBool,
    pub known_peers: Mutex<HashSet<SocketAddr>>,
    events: UnboundedSender<EngineEvent>,
    pub limits: Arc<Limits>,
    pub shutdown: CancellationToken,
}

impl JobState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        info_hash: InfoHash,
        peer_id: [u8; 20],
        client_name: String,
        save_path: PathBuf,
        name: String,
        events: UnboundedSender<EngineEvent>,
        limits: Arc<Limits>,
        shutdown: CancellationToken,
    ) -> Self {
        JobState {
            info_hash,
            peer_id,
            client_name,
            save_path,
            name: Mutex::new(name),
            torrent: RwLock::new(None),
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            download_rate: AtomicU64::new(0f64.to_bits()),
            upload_rate: AtomicU64::new(0f64.to_bits()),
            peers: AtomicU32::new(0),
            sequential: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            known_peers: Mutex::new(HashSet::new()),
            events,
            limits,
            shutdown,
        }
    }

    pub fn torrent(&self) -> Option<Arc<Torrent>> {
        self.torrent
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Installs the info dictionary. The first caller wins; later calls get
    /// the already installed torrent back.
    pub fn install(&self, torrent: Torrent) -> Arc<Torrent> {
        let mut slot = self.torrent.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }
        *lock(&self.name) = torrent.info.name.clone();
        let torrent = Arc::new(torrent);
        *slot = Some(torrent.clone());
        drop(slot);
        log::info!(
            "{}: metadata ready, {} pieces",
            self.info_hash,
            torrent.info.piece_count()
        );
        if lock(&torrent.picker).is_complete() {
            self.mark_finished(&torrent);
        }
        torrent
    }

    /// Verifies and installs metadata fetched from peers.
    pub fn install_metadata(&self, raw_info: Vec<u8>) -> Result<Arc<Torrent>> {
        if let Some(existing) = self.torrent() {
            return Ok(existing);
        }
        ensure!(
            InfoHash::of(&raw_info) == self.info_hash,
            "Metadata does not match the info hash"
        );
        let info = Info::from_bytes(&raw_info)?;
        let torrent = Torrent::open(&self.save_path, info, raw_info)?;
        Ok(self.install(torrent))
    }

    pub fn is_sequential(&self) -> bool {
        self.sequential.load(Ordering::Relaxed)
    }

    pub fn set_sequential(&self, enabled: bool) {
        self.sequential.store(enabled, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn set_rates(&self, down: f64, up: f64) {
        self.download_rate.store(down.to_bits(), Ordering::Relaxed);
        self.upload_rate.store(up.to_bits(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let (done, wanted) = match self.torrent() {
            Some(t) => (lock(&t.picker).done_bytes(), t.info.total_length()),
            None => (0, 0),
        };
        let progress_ppm = if wanted == 0 {
            if self.is_finished() {
                1_000_000
            } else {
                0
            }
        } else {
            (u128::from(done) * 1_000_000 / u128::from(wanted)) as u32
        };
        StatusSnapshot {
            progress_ppm,
            download_rate: f64::from_bits(self.download_rate.load(Ordering::Relaxed)),
            upload_rate: f64::from_bits(self.upload_rate.load(Ordering::Relaxed)),
            total_done: done,
            total_wanted: wanted,
            num_peers: self.peers.load(Ordering::Relaxed),
            name: lock(&self.name).clone(),
        }
    }

    pub fn announce_state(&self) -> DownloadState {
        let left = match self.torrent() {
            Some(t) => t
                .info
                .total_length()
                .saturating_sub(lock(&t.picker).done_bytes()),
            None => 0,
        };
        DownloadState {
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            left,
        }
    }

    /// Flushes storage and reports completion, once.
    pub fn mark_finished(&self, torrent: &Torrent) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = lock(&torrent.storage).flush() {
            self.emit(EngineEvent::Error(format!("{:#}", e)));
        }
        log::info!("{}: download complete", self.info_hash);
        self.emit(EngineEvent::Finished);
    }

    pub fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            log::debug!("{}: event dropped, session is gone", self.info_hash);
        }
    }
}
