use crate::config::{
    RenderConfig, Settings, SwarmConfig, BUILTIN_TRACKERS, DEFAULT_SAVE_DIR, VERSION,
};
use crate::glyphs::GlyphProfile;
use clap::{ArgAction, Parser};
use std::path::{Path, PathBuf};

const AFTER_HELP: &str = "Examples:
  torfrog \"magnet:?xt=urn:btih:HASH...\" --save downloads
  torfrog myfile.torrent --no-clear --no-color --bar-width 60";

#[derive(Debug, Parser)]
#[command(
    name = "torfrog",
    about = "TorFrog - tiny BitTorrent client\nLEGAL USE ONLY.",
    override_usage = "torfrog <magnet_or_.torrent> [options]",
    after_help = AFTER_HELP,
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct Args {
    /// Magnet link or path to a .torrent file
    #[arg(value_name = "MAGNET_OR_TORRENT")]
    pub input: Option<String>,

    /// Show this help and exit
    #[arg(short = 'h', long = "help", short_alias = '?', action = ArgAction::Help)]
    pub help: Option<bool>,

    /// Show version and exit
    #[arg(long)]
    pub version: bool,

    /// Output directory
    #[arg(long, value_name = "DIR", default_value = DEFAULT_SAVE_DIR)]
    pub save: PathBuf,

    /// Do not add built-in public trackers
    #[arg(long)]
    pub no_trackers: bool,

    /// Disable ANSI colors
    #[arg(long)]
    pub no_color: bool,

    /// Do not clear the screen (print status blocks)
    #[arg(long)]
    pub no_clear: bool,

    /// ASCII-only UI
    #[arg(long)]
    pub ascii: bool,

    /// Enable sequential download (default)
    #[arg(long, overrides_with = "no_seq")]
    pub seq: bool,

    /// Disable sequential download
    #[arg(long, overrides_with = "seq")]
    pub no_seq: bool,

    /// Download rate limit in KiB/s, k/m/g suffixes allowed (0 = unlimited)
    #[arg(long, value_name = "KiBps", value_parser = parse_rate, default_value = "0")]
    pub max_down: u64,

    /// Upload rate limit in KiB/s, k/m/g suffixes allowed (0 = unlimited)
    #[arg(long, value_name = "KiBps", value_parser = parse_rate, default_value = "0")]
    pub max_up: u64,

    /// Progress bar width, at least 10
    #[arg(long, value_name = "COLS", default_value_t = crate::bar::DEFAULT_BAR_WIDTH)]
    pub bar_width: usize,
}

/// A rate in KiB/s (optionally `k`, `m` or `g` suffixed) as bytes/s.
pub fn parse_rate(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, scale) = match s.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&s[..s.len() - 1], 1024u64),
        Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1024),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid rate {:?}", s))?;
    value
        .checked_mul(scale)
        .ok_or_else(|| format!("rate {:?} is too large", s))
}

/// Help output exits 0, every parse failure exits 1.
pub fn exit_code_for(err: &clap::Error) -> u8 {
    match err.use_stderr() {
        true => 1,
        false => 0,
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

impl Args {
    pub fn sequential(&self) -> bool {
        !self.no_seq
    }

    /// Resolves the flags into the immutable configuration. `None` when no
    /// input was given.
    pub fn into_settings(self) -> Option<Settings> {
        let sequential = self.sequential();
        let input = self.input?;
        let render = RenderConfig {
            color: !self.no_color,
            clear: !self.no_clear,
            glyphs: GlyphProfile::from_ascii_flag(self.ascii),
            bar_width: self.bar_width,
            save_path: absolute(&self.save).display().to_string(),
            sequential,
            download_limit: self.max_down,
            upload_limit: self.max_up,
        }
        .with_bar_width(self.bar_width);
        let extra_trackers = match self.no_trackers {
            true => Vec::new(),
            false => BUILTIN_TRACKERS.iter().map(|t| t.to_string()).collect(),
        };
        let swarm = SwarmConfig {
            download_limit: self.max_down,
            upload_limit: self.max_up,
            extra_trackers,
            user_agent: format!("TorFrog/{}", VERSION),
            ..SwarmConfig::default()
        };
        Some(Settings {
            input,
            save_dir: self.save,
            sequential,
            render,
            swarm,
        })
    }
}
