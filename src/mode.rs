use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::ModeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Recording,
    Replaying,
    PassThrough,
}

impl Mode {
    /// Resolves the mode from the four switches.
    ///
    /// Precedence, highest first: `record`, `replay`, `passthrough`, `default_replay`. With
    /// nothing set, calls pass through.
    pub fn from_flags(record: bool, replay: bool, passthrough: bool, default_replay: bool) -> Self {
        if record {
            Self::Recording
        } else if replay {
            Self::Replaying
        } else if passthrough {
            Self::PassThrough
        } else if default_replay {
            Self::Replaying
        } else {
            Self::PassThrough
        }
    }

    pub fn as_pair(self) -> (bool, bool) {
        match self {
            Self::Recording => (true, false),
            Self::Replaying => (false, true),
            Self::PassThrough => (false, false),
        }
    }

    pub fn is_recording(self) -> bool {
        self == Self::Recording
    }

    pub fn is_replaying(self) -> bool {
        self == Self::Replaying
    }

    pub fn is_passing_through(self) -> bool {
        self == Self::PassThrough
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recording => "record",
            Self::Replaying => "replay",
            Self::PassThrough => "passthrough",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode switches shared between an interceptor and whoever configures it.
///
/// The flags may be flipped at any time; the interceptor resolves them afresh on every call.
#[derive(Debug, Default)]
pub struct ModeFlags {
    record: AtomicBool,
    replay: AtomicBool,
    passthrough: AtomicBool,
    default_replay: AtomicBool,
}

impl ModeFlags {
    pub fn new(record: bool, replay: bool, passthrough: bool, default_replay: bool) -> Self {
        Self {
            record: AtomicBool::new(record),
            replay: AtomicBool::new(replay),
            passthrough: AtomicBool::new(passthrough),
            default_replay: AtomicBool::new(default_replay),
        }
    }

    pub fn from_config(config: &ModeConfig) -> Self {
        Self::new(
            config.record,
            config.replay,
            config.passthrough,
            config.default_replay,
        )
    }

    pub fn resolve(&self) -> Mode {
        Mode::from_flags(
            self.record.load(Ordering::Acquire),
            self.replay.load(Ordering::Acquire),
            self.passthrough.load(Ordering::Acquire),
            self.default_replay.load(Ordering::Acquire),
        )
    }

    pub fn set_record(&self, value: bool) {
        self.record.store(value, Ordering::Release);
    }

    pub fn set_replay(&self, value: bool) {
        self.replay.store(value, Ordering::Release);
    }

    pub fn set_passthrough(&self, value: bool) {
        self.passthrough.store(value, Ordering::Release);
    }

    pub fn set_default_replay(&self, value: bool) {
        self.default_replay.store(value, Ordering::Release);
    }

    pub fn snapshot(&self) -> ModeConfig {
        ModeConfig {
            record: self.record.load(Ordering::Acquire),
            replay: self.replay.load(Ordering::Acquire),
            passthrough: self.passthrough.load(Ordering::Acquire),
            default_replay: self.default_replay.load(Ordering::Acquire),
        }
    }
}
