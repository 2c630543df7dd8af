use std::fmt;
use std::path::PathBuf;

/// Storage directory used when none is given on the command line
pub const DEFAULT_DATADIR: &str = "/tmp/datadir_storage";

/// How reads are served for the whole life of a mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Serve reads live and persist every sector read
    Capture,
    /// Serve reads only from persisted sectors
    Replay,
}

impl Mode {
    pub fn from_replay_flag(replay: bool) -> Self {
        if replay {
            Mode::Replay
        } else {
            Mode::Capture
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Capture => f.write_str("capture"),
            Mode::Replay => f.write_str("replay"),
        }
    }
}

/// Everything a mount needs, fixed at startup.
///
/// Built once from the command line and shared read-only with the
/// filesystem; nothing in here changes while mounted.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub root: PathBuf,
    pub mountpoint: PathBuf,
    pub datadir: PathBuf,
    pub mode: Mode,
    pub allow_other: bool,
}
