//! Runtime configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Environment variable selecting the scheduler (`tpb` or `sts`)
pub const SCHEDULER_ENV: &str = "SIGFLOW_SCHEDULER";

/// Which scheduler runs a flattened graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SchedulerKind {
    /// One OS thread per block
    #[default]
    #[serde(rename = "tpb")]
    ThreadPerBlock,
    /// Every block on a single cooperative thread
    #[serde(rename = "sts")]
    SingleThreaded,
}

impl SchedulerKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "tpb" => Some(SchedulerKind::ThreadPerBlock),
            "sts" => Some(SchedulerKind::SingleThreaded),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SchedulerKind::ThreadPerBlock => "tpb",
            SchedulerKind::SingleThreaded => "sts",
        }
    }
}

/// Settings handed to [`TopBlock::with_config`](crate::TopBlock::with_config)
///
/// Can also be read from TOML; absent keys keep their defaults and durations
/// are given in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerKind,
    /// Target size of one output buffer; buffers get twice this many bytes
    pub default_buffer_bytes: usize,
    /// Upper bound on items produced per work call (`usize::MAX` for none)
    pub max_noutput_items: usize,
    /// Bounded wait of a thread-per-block worker blocked on input
    #[serde(rename = "input_wait_timeout_ms", with = "millis")]
    pub input_wait_timeout: Duration,
    /// Watchdog report threshold for blocked workers
    #[serde(rename = "watchdog_threshold_ms", with = "millis")]
    pub watchdog_threshold: Duration,
    /// Alignment in bytes targeted by the one-time pointer nudge
    pub vector_alignment: usize,
    /// Preference file; `None` uses the platform default location
    pub prefs_path: Option<PathBuf>,
    /// Skip the persisted choice and force a double-mapping backend by name
    pub vmcircbuf_backend: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerKind::default(),
            default_buffer_bytes: 32 * 1024,
            max_noutput_items: usize::MAX,
            input_wait_timeout: Duration::from_millis(250),
            watchdog_threshold: Duration::from_secs(5),
            vector_alignment: 32,
            prefs_path: None,
            vmcircbuf_backend: None,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl RuntimeConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply overrides from the process environment
    pub fn with_env_overrides(self) -> Self {
        let value = std::env::var(SCHEDULER_ENV).ok();
        self.with_scheduler_name(value.as_deref())
    }

    /// Select a scheduler by name; unknown names keep the current choice.
    pub fn with_scheduler_name(mut self, name: Option<&str>) -> Self {
        if let Some(name) = name {
            match SchedulerKind::from_name(name) {
                Some(kind) => self.scheduler = kind,
                None => warn!(
                    "Unknown scheduler '{}', using '{}'",
                    name,
                    self.scheduler.name()
                ),
            }
        }
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerKind) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_max_noutput_items(mut self, n: usize) -> Self {
        self.max_noutput_items = n;
        self
    }

    pub fn with_prefs_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.prefs_path = Some(path.into());
        self
    }
}
