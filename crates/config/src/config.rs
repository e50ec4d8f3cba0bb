//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Where admission tickets and counters are kept.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionBackend {
    /// In-process only; correct for a single worker process.
    #[default]
    Memory,
    /// Shared sqlite file; correct across a pool of worker processes.
    Sqlite,
}

impl FromStr for AdmissionBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown admission backend '{}'", other)),
        }
    }
}

/// Operating mode of the check pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// Nothing runs automatically.
    Disabled,
    /// Check channels when they are updated, respecting the cooldown.
    #[default]
    AutoWithImmunity,
    /// As `AutoWithImmunity`, plus the scheduled full sweep.
    AutoWithImmunityPlusSweep,
    /// Updates and matching only, no probing on update.
    AutoNoCheck,
    /// As `AutoNoCheck`, plus the scheduled full sweep.
    AutoNoCheckPlusSweep,
    /// Only scheduled or manual sweeps.
    SweepOnly,
}

impl PipelineMode {
    pub const ALL: [PipelineMode; 6] = [
        PipelineMode::Disabled,
        PipelineMode::AutoWithImmunity,
        PipelineMode::AutoWithImmunityPlusSweep,
        PipelineMode::AutoNoCheck,
        PipelineMode::AutoNoCheckPlusSweep,
        PipelineMode::SweepOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineMode::Disabled => "disabled",
            PipelineMode::AutoWithImmunity => "auto_with_immunity",
            PipelineMode::AutoWithImmunityPlusSweep => "auto_with_immunity_plus_sweep",
            PipelineMode::AutoNoCheck => "auto_no_check",
            PipelineMode::AutoNoCheckPlusSweep => "auto_no_check_plus_sweep",
            PipelineMode::SweepOnly => "sweep_only",
        }
    }
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        PipelineMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == wanted)
            .ok_or_else(|| format!("unknown pipeline mode '{}'", s))
    }
}

/// Admission controller configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdmissionConfig {
    /// Maximum probes in flight across the whole system (0 = derive from CPU count)
    #[serde(default)]
    pub global_ceiling: u32,
    /// Ceiling for providers without a configured limit (0 = unlimited)
    #[serde(default)]
    pub default_provider_limit: u32,
    /// How long a probe may wait for a free slot before it is skipped
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Age after which an unreleased ticket is treated as orphaned
    #[serde(default = "default_stale_ticket_secs")]
    pub stale_ticket_secs: u64,
    /// Interval of the orphaned-ticket reconciler
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default)]
    pub backend: AdmissionBackend,
    /// Shared store file used by the sqlite backend
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

fn default_acquire_timeout_secs() -> u64 {
    300
}

fn default_stale_ticket_secs() -> u64 {
    900
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./state/admission.sqlite")
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global_ceiling: 0,
            default_provider_limit: 0,
            acquire_timeout_secs: default_acquire_timeout_secs(),
            stale_ticket_secs: default_stale_ticket_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            backend: AdmissionBackend::default(),
            store_path: default_store_path(),
        }
    }
}

/// Probe subprocess configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Hard time budget of a single probe
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra attempts after a failed probe
    #[serde(default = "default_probe_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Delay between consecutive probe dispatches within a channel
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,
    /// How much of the stream ffprobe analyzes
    #[serde(default = "default_analyze_duration_secs")]
    pub analyze_duration_secs: u64,
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_probe_timeout_secs() -> u64 {
    30
}

fn default_probe_retries() -> u32 {
    1
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_stagger_ms() -> u64 {
    250
}

fn default_analyze_duration_secs() -> u64 {
    5
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ffprobe_path: default_ffprobe_path(),
            timeout_secs: default_probe_timeout_secs(),
            retries: default_probe_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            stagger_ms: default_stagger_ms(),
            analyze_duration_secs: default_analyze_duration_secs(),
        }
    }
}

/// Update/immunity ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerConfig {
    /// Minimum interval between steady-state checks of one stream
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_cooldown_secs() -> u64 {
    2 * 60 * 60
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Relative weight of each quality sub-score
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreWeights {
    #[serde(default = "default_bitrate_weight")]
    pub bitrate: f32,
    #[serde(default = "default_resolution_weight")]
    pub resolution: f32,
    #[serde(default = "default_frame_rate_weight")]
    pub frame_rate: f32,
    #[serde(default = "default_codec_weight")]
    pub codec: f32,
    #[serde(default = "default_errors_weight")]
    pub errors: f32,
}

fn default_bitrate_weight() -> f32 {
    0.30
}

fn default_resolution_weight() -> f32 {
    0.25
}

fn default_frame_rate_weight() -> f32 {
    0.15
}

fn default_codec_weight() -> f32 {
    0.10
}

fn default_errors_weight() -> f32 {
    0.20
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            bitrate: default_bitrate_weight(),
            resolution: default_resolution_weight(),
            frame_rate: default_frame_rate_weight(),
            codec: default_codec_weight(),
            errors: default_errors_weight(),
        }
    }
}

/// Penalty subtracted from the error sub-score per detected defect
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DefectPenalties {
    #[serde(default = "default_decode_error_penalty")]
    pub decode_errors: f32,
    #[serde(default = "default_discontinuity_penalty")]
    pub discontinuities: f32,
    #[serde(default = "default_timeout_penalty")]
    pub timeout: f32,
    #[serde(default = "default_interlaced_penalty")]
    pub interlaced: f32,
    #[serde(default = "default_dropped_frames_penalty")]
    pub dropped_frames: f32,
}

fn default_decode_error_penalty() -> f32 {
    0.25
}

fn default_discontinuity_penalty() -> f32 {
    0.20
}

fn default_timeout_penalty() -> f32 {
    0.30
}

fn default_interlaced_penalty() -> f32 {
    0.10
}

fn default_dropped_frames_penalty() -> f32 {
    0.15
}

impl Default for DefectPenalties {
    fn default() -> Self {
        Self {
            decode_errors: default_decode_error_penalty(),
            discontinuities: default_discontinuity_penalty(),
            timeout: default_timeout_penalty(),
            interlaced: default_interlaced_penalty(),
            dropped_frames: default_dropped_frames_penalty(),
        }
    }
}

/// Quality scorer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScorerConfig {
    #[serde(default)]
    pub weights: ScoreWeights,
    /// Bitrate at which the bitrate sub-score saturates
    #[serde(default = "default_bitrate_ceiling_kbps")]
    pub bitrate_ceiling_kbps: f32,
    /// Frame rate at which the frame-rate sub-score saturates
    #[serde(default = "default_fps_ceiling")]
    pub fps_ceiling: f32,
    #[serde(default)]
    pub penalties: DefectPenalties,
}

fn default_bitrate_ceiling_kbps() -> f32 {
    8000.0
}

fn default_fps_ceiling() -> f32 {
    60.0
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            bitrate_ceiling_kbps: default_bitrate_ceiling_kbps(),
            fps_ceiling: default_fps_ceiling(),
            penalties: DefectPenalties::default(),
        }
    }
}

/// Pipeline and sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    #[serde(default)]
    pub mode: PipelineMode,
    /// Cron expression (seconds first) for the scheduled sweep
    #[serde(default = "default_sweep_schedule")]
    pub sweep_schedule: String,
    /// Queue priority of channels enqueued by update events
    #[serde(default = "default_update_priority")]
    pub update_priority: i32,
    /// Queue priority of channels enqueued by a sweep
    #[serde(default)]
    pub sweep_priority: i32,
    /// Channels checked at the same time (0 = same as the global ceiling)
    #[serde(default)]
    pub max_active_channels: u32,
    /// How often channels still flagged for a recheck are put back in the queue
    #[serde(default = "default_pending_recheck_secs")]
    pub pending_recheck_secs: u64,
}

fn default_pending_recheck_secs() -> u64 {
    60
}

fn default_sweep_schedule() -> String {
    "0 0 3 * * *".to_string()
}

fn default_update_priority() -> i32 {
    10
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: PipelineMode::default(),
            sweep_schedule: default_sweep_schedule(),
            update_priority: default_update_priority(),
            sweep_priority: 0,
            max_active_channels: 0,
            pending_recheck_secs: default_pending_recheck_secs(),
        }
    }
}

/// Control surface configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Persistent state locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
    /// JSON catalog of channels, streams and providers
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("./catalog.json")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            catalog_path: default_catalog_path(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub scorer: ScorerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub state: StateConfig,
}

/// Replace `target` with the parsed value of `var` when it is set and valid.
fn override_from_env<T: FromStr>(var: &str, target: &mut T) {
    if let Ok(val) = env::var(var) {
        if let Ok(parsed) = val.trim().parse::<T>() {
            *target = parsed;
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set and parse:
    /// - STREAM_CHECKER_GLOBAL_CEILING -> admission.global_ceiling
    /// - STREAM_CHECKER_DEFAULT_PROVIDER_LIMIT -> admission.default_provider_limit
    /// - STREAM_CHECKER_ACQUIRE_TIMEOUT_SECS -> admission.acquire_timeout_secs
    /// - STREAM_CHECKER_STALE_TICKET_SECS -> admission.stale_ticket_secs
    /// - STREAM_CHECKER_ADMISSION_BACKEND -> admission.backend
    /// - STREAM_CHECKER_ADMISSION_STORE -> admission.store_path
    /// - STREAM_CHECKER_FFPROBE -> probe.ffprobe_path
    /// - STREAM_CHECKER_PROBE_TIMEOUT_SECS -> probe.timeout_secs
    /// - STREAM_CHECKER_PROBE_RETRIES -> probe.retries
    /// - STREAM_CHECKER_RECONCILE_INTERVAL_SECS -> admission.reconcile_interval_secs
    /// - STREAM_CHECKER_STAGGER_MS -> probe.stagger_ms
    /// - STREAM_CHECKER_RETRY_DELAY_SECS -> probe.retry_delay_secs
    /// - STREAM_CHECKER_ANALYZE_DURATION_SECS -> probe.analyze_duration_secs
    /// - STREAM_CHECKER_COOLDOWN_SECS -> ledger.cooldown_secs
    /// - STREAM_CHECKER_WEIGHT_{BITRATE,RESOLUTION,FRAME_RATE,CODEC,ERRORS} -> scorer.weights.*
    /// - STREAM_CHECKER_BITRATE_CEILING_KBPS -> scorer.bitrate_ceiling_kbps
    /// - STREAM_CHECKER_FPS_CEILING -> scorer.fps_ceiling
    /// - STREAM_CHECKER_PENALTY_{DECODE_ERRORS,DISCONTINUITIES,TIMEOUT,INTERLACED,DROPPED_FRAMES}
    ///   -> scorer.penalties.*
    /// - STREAM_CHECKER_PIPELINE_MODE -> pipeline.mode
    /// - STREAM_CHECKER_SWEEP_SCHEDULE -> pipeline.sweep_schedule
    /// - STREAM_CHECKER_UPDATE_PRIORITY -> pipeline.update_priority
    /// - STREAM_CHECKER_SWEEP_PRIORITY -> pipeline.sweep_priority
    /// - STREAM_CHECKER_MAX_ACTIVE_CHANNELS -> pipeline.max_active_channels
    /// - STREAM_CHECKER_PENDING_RECHECK_SECS -> pipeline.pending_recheck_secs
    /// - STREAM_CHECKER_BIND -> server.bind
    /// - STREAM_CHECKER_STATE_DIR -> state.dir
    /// - STREAM_CHECKER_CATALOG -> state.catalog_path
    pub fn apply_env_overrides(&mut self) {
        override_from_env(
            "STREAM_CHECKER_GLOBAL_CEILING",
            &mut self.admission.global_ceiling,
        );
        override_from_env(
            "STREAM_CHECKER_DEFAULT_PROVIDER_LIMIT",
            &mut self.admission.default_provider_limit,
        );
        override_from_env(
            "STREAM_CHECKER_ACQUIRE_TIMEOUT_SECS",
            &mut self.admission.acquire_timeout_secs,
        );
        override_from_env(
            "STREAM_CHECKER_STALE_TICKET_SECS",
            &mut self.admission.stale_ticket_secs,
        );
        override_from_env(
            "STREAM_CHECKER_RECONCILE_INTERVAL_SECS",
            &mut self.admission.reconcile_interval_secs,
        );
        override_from_env("STREAM_CHECKER_ADMISSION_BACKEND", &mut self.admission.backend);
        override_from_env("STREAM_CHECKER_ADMISSION_STORE", &mut self.admission.store_path);

        override_from_env("STREAM_CHECKER_FFPROBE", &mut self.probe.ffprobe_path);
        override_from_env("STREAM_CHECKER_PROBE_TIMEOUT_SECS", &mut self.probe.timeout_secs);
        override_from_env("STREAM_CHECKER_PROBE_RETRIES", &mut self.probe.retries);
        override_from_env("STREAM_CHECKER_STAGGER_MS", &mut self.probe.stagger_ms);
        override_from_env("STREAM_CHECKER_RETRY_DELAY_SECS", &mut self.probe.retry_delay_secs);
        override_from_env(
            "STREAM_CHECKER_ANALYZE_DURATION_SECS",
            &mut self.probe.analyze_duration_secs,
        );

        override_from_env("STREAM_CHECKER_COOLDOWN_SECS", &mut self.ledger.cooldown_secs);

        let scorer = &mut self.scorer;
        override_from_env("STREAM_CHECKER_WEIGHT_BITRATE", &mut scorer.weights.bitrate);
        override_from_env("STREAM_CHECKER_WEIGHT_RESOLUTION", &mut scorer.weights.resolution);
        override_from_env("STREAM_CHECKER_WEIGHT_FRAME_RATE", &mut scorer.weights.frame_rate);
        override_from_env("STREAM_CHECKER_WEIGHT_CODEC", &mut scorer.weights.codec);
        override_from_env("STREAM_CHECKER_WEIGHT_ERRORS", &mut scorer.weights.errors);
        override_from_env(
            "STREAM_CHECKER_BITRATE_CEILING_KBPS",
            &mut scorer.bitrate_ceiling_kbps,
        );
        override_from_env("STREAM_CHECKER_FPS_CEILING", &mut scorer.fps_ceiling);
        override_from_env(
            "STREAM_CHECKER_PENALTY_DECODE_ERRORS",
            &mut scorer.penalties.decode_errors,
        );
        override_from_env(
            "STREAM_CHECKER_PENALTY_DISCONTINUITIES",
            &mut scorer.penalties.discontinuities,
        );
        override_from_env("STREAM_CHECKER_PENALTY_TIMEOUT", &mut scorer.penalties.timeout);
        override_from_env("STREAM_CHECKER_PENALTY_INTERLACED", &mut scorer.penalties.interlaced);
        override_from_env(
            "STREAM_CHECKER_PENALTY_DROPPED_FRAMES",
            &mut scorer.penalties.dropped_frames,
        );

        override_from_env("STREAM_CHECKER_PIPELINE_MODE", &mut self.pipeline.mode);
        override_from_env(
            "STREAM_CHECKER_SWEEP_SCHEDULE",
            &mut self.pipeline.sweep_schedule,
        );
        override_from_env(
            "STREAM_CHECKER_UPDATE_PRIORITY",
            &mut self.pipeline.update_priority,
        );
        override_from_env("STREAM_CHECKER_SWEEP_PRIORITY", &mut self.pipeline.sweep_priority);
        override_from_env(
            "STREAM_CHECKER_MAX_ACTIVE_CHANNELS",
            &mut self.pipeline.max_active_channels,
        );
        override_from_env(
            "STREAM_CHECKER_PENDING_RECHECK_SECS",
            &mut self.pipeline.pending_recheck_secs,
        );

        override_from_env("STREAM_CHECKER_BIND", &mut self.server.bind);
        override_from_env("STREAM_CHECKER_STATE_DIR", &mut self.state.dir);
        override_from_env("STREAM_CHECKER_CATALOG", &mut self.state.catalog_path);
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}
