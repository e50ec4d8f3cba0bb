//! Quality scorer turning probe facts into a bounded score and a liveness verdict.
//!
//! Scoring is pure: the same facts and configuration always give the same
//! verdict. Dead streams score exactly `0.0`.

use crate::config::{ScoreWeights, ScorerConfig};
use crate::ledger::Liveness;
use crate::probe::ProbeFacts;
use serde::{Deserialize, Serialize};

/// Codecs rewarded over older ones.
const MODERN_CODECS: &[&str] = &["av1", "hevc", "h265", "vp9"];
const MAINSTREAM_CODECS: &[&str] = &["h264", "avc", "avc1"];
const LEGACY_CODECS: &[&str] = &["mpeg2video", "mpeg1video", "mpeg4", "msmpeg4v3", "h263", "vc1"];

/// Score and liveness for one probed stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    pub score: f32,
    pub liveness: Liveness,
}

impl QualityVerdict {
    pub fn dead() -> Self {
        Self {
            score: 0.0,
            liveness: Liveness::Dead,
        }
    }
}

/// Maps probe facts to a score in `[0, 1]`.
#[derive(Debug, Clone, Default)]
pub struct QualityScorer {
    config: ScorerConfig,
}

impl QualityScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// A stream is dead when it has no picture or no bitrate.
    pub fn is_dead(facts: &ProbeFacts) -> bool {
        facts.resolution.is_empty() || !(facts.bitrate_kbps > 0.0)
    }

    /// Score the facts of one probe.
    pub fn score(&self, facts: &ProbeFacts) -> QualityVerdict {
        if Self::is_dead(facts) {
            return QualityVerdict::dead();
        }

        let weights = normalized_weights(&self.config.weights);
        let score = weights.bitrate * self.bitrate_score(facts.bitrate_kbps)
            + weights.resolution * resolution_score(facts.resolution.height)
            + weights.frame_rate * self.frame_rate_score(facts.fps)
            + weights.codec * codec_score(facts.video_codec.as_deref())
            + weights.errors * self.error_score(facts);

        QualityVerdict {
            score: score.clamp(0.0, 1.0),
            liveness: Liveness::Alive,
        }
    }

    /// Bitrate sub-score, saturating at the configured ceiling.
    pub fn bitrate_score(&self, bitrate_kbps: f32) -> f32 {
        saturating_ratio(bitrate_kbps, self.config.bitrate_ceiling_kbps)
    }

    /// Frame-rate sub-score, saturating at the configured ceiling.
    pub fn frame_rate_score(&self, fps: f32) -> f32 {
        saturating_ratio(fps, self.config.fps_ceiling)
    }

    /// Starts at 1.0 and loses the configured penalty per detected defect.
    pub fn error_score(&self, facts: &ProbeFacts) -> f32 {
        let flags = &facts.error_flags;
        let penalties = &self.config.penalties;
        let detected = [
            (flags.decode_errors, penalties.decode_errors),
            (flags.discontinuities, penalties.discontinuities),
            (flags.timeout, penalties.timeout),
            (flags.interlaced, penalties.interlaced),
            (flags.dropped_frames, penalties.dropped_frames),
        ];
        let penalty: f32 = detected
            .iter()
            .filter(|(present, _)| *present)
            .map(|(_, penalty)| penalty.max(0.0))
            .sum();
        (1.0 - penalty).max(0.0)
    }
}

fn saturating_ratio(value: f32, ceiling: f32) -> f32 {
    if !(value > 0.0) {
        return 0.0;
    }
    if !(ceiling > 0.0) {
        return 1.0;
    }
    (value / ceiling).clamp(0.0, 1.0)
}

/// Fixed resolution tiers keyed on picture height.
pub fn resolution_score(height: u32) -> f32 {
    match height {
        h if h >= 2160 => 1.0,
        h if h >= 1440 => 0.9,
        h if h >= 1080 => 0.8,
        h if h >= 720 => 0.6,
        h if h >= 576 => 0.45,
        h if h >= 480 => 0.35,
        0 => 0.0,
        _ => 0.2,
    }
}

pub fn codec_score(codec: Option<&str>) -> f32 {
    let Some(codec) = codec.map(str::to_lowercase) else {
        return 0.5;
    };
    if MODERN_CODECS.contains(&codec.as_str()) {
        1.0
    } else if MAINSTREAM_CODECS.contains(&codec.as_str()) {
        0.7
    } else if LEGACY_CODECS.contains(&codec.as_str()) {
        0.3
    } else {
        0.5
    }
}

/// Negative weights count as zero; an all-zero set falls back to the defaults.
fn normalized_weights(weights: &ScoreWeights) -> ScoreWeights {
    let clamped = ScoreWeights {
        bitrate: weights.bitrate.max(0.0),
        resolution: weights.resolution.max(0.0),
        frame_rate: weights.frame_rate.max(0.0),
        codec: weights.codec.max(0.0),
        errors: weights.errors.max(0.0),
    };
    let total =
        clamped.bitrate + clamped.resolution + clamped.frame_rate + clamped.codec + clamped.errors;
    if !(total > 0.0) || !total.is_finite() {
        return ScoreWeights::default();
    }
    ScoreWeights {
        bitrate: clamped.bitrate / total,
        resolution: clamped.resolution / total,
        frame_rate: clamped.frame_rate / total,
        codec: clamped.codec / total,
        errors: clamped.errors / total,
    }
}
