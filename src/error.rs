use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures that end the program before (or instead of) the dashboard.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to open .torrent {}: {reason}", path.display())]
    Unreadable { path: PathBuf, reason: String },
    #[error("Invalid magnet: {0}")]
    InvalidMagnet(String),
    #[error("Failed to add torrent: {0}")]
    Rejected(String),
    #[error("Failed to write to terminal: {0}")]
    Output(#[from] io::Error),
}

impl Error {
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Output(_) => 1,
            Error::Unreadable { .. } => 2,
            Error::InvalidMagnet(_) => 3,
            Error::Rejected(_) => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let unreadable = Error::Unreadable {
            path: PathBuf::from("x.torrent"),
            reason: "missing".into(),
        };
        assert_eq!(unreadable.exit_code(), 2);
        assert_eq!(Error::InvalidMagnet("bad".into()).exit_code(), 3);
        assert_eq!(Error::Rejected("no".into()).exit_code(), 4);
        assert_eq!(
            unreadable.to_string(),
            "Failed to open .torrent x.torrent: missing"
        );
    }
}
