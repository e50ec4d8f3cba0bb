//! Probe module for collecting quality facts about a stream URL.
//!
//! The probe itself is an external black box: anything implementing [`Prober`]
//! can be plugged in. The production implementation shells out to ffprobe
//! with a hard time budget and turns its JSON output and diagnostics into
//! [`ProbeFacts`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The probe did not finish within its time budget.
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    /// The stream was malformed or unreachable.
    #[error("probe failed: {0}")]
    Failed(String),

    /// Failed to parse prober output.
    #[error("failed to parse probe output: {0}")]
    Parse(String),

    /// IO error spawning or talking to the probe process.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProbeError::Timeout(_))
    }
}

/// Video frame size in pixels.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when either dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Defects detected while probing.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorFlags {
    pub decode_errors: bool,
    pub discontinuities: bool,
    pub timeout: bool,
    pub interlaced: bool,
    pub dropped_frames: bool,
}

impl ErrorFlags {
    pub fn is_clean(&self) -> bool {
        *self == ErrorFlags::default()
    }
}

/// Quality facts about one stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProbeFacts {
    pub resolution: Resolution,
    pub bitrate_kbps: f32,
    pub fps: f32,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub error_flags: ErrorFlags,
}

/// A bounded-time quality check of one stream URL.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, url: &str, budget: Duration) -> Result<ProbeFacts, ProbeError>;
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub bit_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
        pub r_frame_rate: Option<String>,
        pub field_order: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub bit_rate: Option<String>,
    }
}

/// Prober backed by the ffprobe binary.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe_path: String,
    analyze_duration: Duration,
}

impl FfprobeProber {
    pub fn new(ffprobe_path: impl Into<String>, analyze_duration: Duration) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            analyze_duration,
        }
    }

    fn build_command(&self, url: &str, budget: Duration) -> Command {
        let mut cmd = Command::new(&self.ffprobe_path);
        cmd.args(["-v", "error", "-print_format", "json", "-show_streams", "-show_format"])
            .arg("-analyzeduration")
            .arg(self.analyze_duration.as_micros().to_string())
            .arg("-rw_timeout")
            .arg(io_timeout(budget).as_micros().to_string())
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    async fn probe(&self, url: &str, budget: Duration) -> Result<ProbeFacts, ProbeError> {
        let child = self.build_command(url, budget).spawn()?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(budget, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(ProbeError::Timeout(budget)),
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() {
            return parse_ffprobe_output(&stdout, &stderr);
        }

        // A read stall ends ffprobe early; whatever it saw before is still usable.
        if classify_diagnostics(&stderr).timeout {
            return match parse_ffprobe_output(&stdout, &stderr) {
                Ok(facts) if !facts.resolution.is_empty() => Ok(facts),
                _ => Err(ProbeError::Timeout(budget)),
            };
        }
        Err(ProbeError::Failed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )))
    }
}

/// Read timeout handed to ffprobe, so a stalled stream ends the probe
/// before the hard budget kills it.
fn io_timeout(budget: Duration) -> Duration {
    (budget / 2).max(Duration::from_secs(1)).min(budget)
}

/// Parses an ffprobe frame rate such as `30000/1001` or `25`.
fn parse_frame_rate(raw: &str) -> Option<f32> {
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                None
            } else {
                Some((num / den) as f32)
            }
        }
        None => raw.trim().parse::<f32>().ok(),
    }
}

fn parse_kbps(raw: Option<&String>) -> Option<f32> {
    raw.and_then(|br| br.parse::<f64>().ok())
        .map(|bps| (bps / 1000.0) as f32)
}

/// Derives defect flags from ffprobe diagnostics on stderr.
pub fn classify_diagnostics(stderr: &str) -> ErrorFlags {
    let mut flags = ErrorFlags::default();
    for line in stderr.lines().map(str::to_lowercase) {
        if line.contains("error while decoding")
            || line.contains("decode_slice")
            || line.contains("corrupt")
            || line.contains("concealing")
        {
            flags.decode_errors = true;
        }
        if line.contains("discontinuity")
            || line.contains("non-monoton")
            || line.contains("invalid dts")
        {
            flags.discontinuities = true;
        }
        if line.contains("dropping frame") || line.contains("frames dropped") {
            flags.dropped_frames = true;
        }
        if line.contains("timed out") || line.contains("timeout") {
            flags.timeout = true;
        }
    }
    flags
}

/// Parses ffprobe JSON output and diagnostics into [`ProbeFacts`].
pub fn parse_ffprobe_output(json_str: &str, stderr: &str) -> Result<ProbeFacts, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::Parse(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let container_kbps = ffprobe
        .format
        .as_ref()
        .and_then(|format| parse_kbps(format.bit_rate.as_ref()));

    let mut facts = ProbeFacts {
        error_flags: classify_diagnostics(stderr),
        ..ProbeFacts::default()
    };

    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    if let Some(video) = video {
        facts.resolution = Resolution::new(video.width.unwrap_or(0), video.height.unwrap_or(0));
        facts.video_codec = video.codec_name.clone();
        facts.fps = video
            .avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .filter(|fps| *fps > 0.0)
            .or_else(|| video.r_frame_rate.as_deref().and_then(parse_frame_rate))
            .unwrap_or(0.0);
        facts.bitrate_kbps = parse_kbps(video.bit_rate.as_ref())
            .or(container_kbps)
            .unwrap_or(0.0);
        facts.error_flags.interlaced = video
            .field_order
            .as_deref()
            .map(|order| !matches!(order, "progressive" | "unknown"))
            .unwrap_or(false);
    }

    if let Some(audio) = audio {
        facts.audio_codec = audio.codec_name.clone();
    }

    Ok(facts)
}
