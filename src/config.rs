use crate::bar::{DEFAULT_BAR_WIDTH, MAX_BAR_WIDTH, MIN_BAR_WIDTH};
use crate::glyphs::GlyphProfile;
use std::path::PathBuf;

pub const VERSION: &str = match option_env!("TORFROG_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

pub const DEFAULT_SAVE_DIR: &str = "./downloads";

pub const BUILTIN_TRACKERS: [&str; 5] = [
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://tracker.openbittorrent.com:6969/announce",
    "udp://tracker.internetwarriors.net:1337/announce",
    "udp://tracker.leechers-paradise.org:6969/announce",
    "udp://tracker.coppersurfer.tk:6969/announce",
];

/// How frames look. Resolved once, never changed while the loop runs.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderConfig {
    pub color: bool,
    pub clear: bool,
    pub glyphs: GlyphProfile,
    pub bar_width: usize,
    pub save_path: String,
    pub sequential: bool,
    /// Bytes/s, 0 = unlimited.
    pub download_limit: u64,
    /// Bytes/s, 0 = unlimited.
    pub upload_limit: u64,
}

impl RenderConfig {
    pub fn with_bar_width(mut self, width: usize) -> Self {
        self.bar_width = width.clamp(MIN_BAR_WIDTH, MAX_BAR_WIDTH);
        self
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            color: true,
            clear: true,
            glyphs: GlyphProfile::Rich,
            bar_width: DEFAULT_BAR_WIDTH,
            save_path: DEFAULT_SAVE_DIR.to_string(),
            sequential: true,
            download_limit: 0,
            upload_limit: 0,
        }
    }
}

/// Session-wide engine settings, applied at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct SwarmConfig {
    pub download_limit: u64,
    pub upload_limit: u64,
    /// Announced for every job on top of the job's own trackers.
    pub extra_trackers: Vec<String>,
    pub max_connections: usize,
    /// Port reported to trackers.
    pub listen_port: u16,
    pub user_agent: String,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        SwarmConfig {
            download_limit: 0,
            upload_limit: 0,
            extra_trackers: Vec::new(),
            max_connections: 50,
            listen_port: 6881,
            user_agent: format!("TorFrog/{}", VERSION),
        }
    }
}

/// Everything resolved from the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub input: String,
    pub save_dir: PathBuf,
    pub sequential: bool,
    pub render: RenderConfig,
    pub swarm: SwarmConfig,
}
