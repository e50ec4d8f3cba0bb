//! Startup checks module for the stream checker
//!
//! Provides preflight checks to verify system requirements before starting the daemon:
//! - ffprobe is runnable
//! - The sweep schedule parses
//! - The state directory is usable

use crate::config::Config;
use crate::pipeline::{parse_schedule, ScheduleError};
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("State directory {path} is not usable: {source}")]
    StateDir {
        path: String,
        source: std::io::Error,
    },
}

/// Parse the version token out of `ffprobe -version` output
///
/// Handles release builds ("ffprobe version 6.1.1 ...") and git builds
/// ("ffprobe version n7.0-12-gabcdef ..."), returning the token as printed.
pub fn parse_ffprobe_version(version_output: &str) -> Option<String> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffprobe version"))?;

    version_line
        .to_lowercase()
        .split("ffprobe version")
        .nth(1)?
        .split_whitespace()
        .next()
        .map(|token| token.to_string())
}

/// Check that the configured ffprobe binary runs
///
/// Returns the reported version, or "unknown" when the banner cannot be parsed.
pub fn check_ffprobe_available(ffprobe_path: &str) -> Result<String, StartupError> {
    let output = Command::new(ffprobe_path)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::FfprobeUnavailable(format!(
                "{} -version failed; is ffprobe installed and in PATH? Error: {}",
                ffprobe_path, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::FfprobeUnavailable(format!(
            "{} -version exited with {}",
            ffprobe_path, output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_ffprobe_version(&stdout).unwrap_or_else(|| "unknown".to_string()))
}

/// Check that the sweep schedule is a valid cron expression
pub fn check_sweep_schedule(cfg: &Config) -> Result<(), StartupError> {
    parse_schedule(&cfg.pipeline.sweep_schedule)?;
    Ok(())
}

/// Make sure the state directory exists and can be created
pub fn check_state_dir(dir: &Path) -> Result<(), StartupError> {
    std::fs::create_dir_all(dir).map_err(|source| StartupError::StateDir {
        path: dir.display().to_string(),
        source,
    })
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. Sweep schedule
/// 2. State directory
/// 3. ffprobe availability
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_sweep_schedule(cfg)?;
    check_state_dir(&cfg.state.dir)?;
    let version = check_ffprobe_available(&cfg.probe.ffprobe_path)?;
    info!(
        ffprobe = %cfg.probe.ffprobe_path,
        version = %version,
        mode = %cfg.pipeline.mode,
        "Startup checks passed"
    );
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_release_version_parsing(
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
        ) {
            let output = format!(
                "ffprobe version {}.{}.{} Copyright (c) 2007-2024 the FFmpeg developers",
                major, minor, patch
            );
            let expected = format!("{}.{}.{}", major, minor, patch);
            prop_assert_eq!(parse_ffprobe_version(&output), Some(expected));
        }

        #[test]
        fn prop_git_version_parsing(
            major in 1u32..20,
            git_hash in "[a-f0-9]{7}",
        ) {
            let output = format!(
                "built with gcc 13\nffprobe version n{}.0-1-g{} Copyright (c) the FFmpeg developers",
                major, git_hash
            );
            let parsed = parse_ffprobe_version(&output).unwrap();
            let prefix = format!("n{}.0-", major);
            prop_assert!(parsed.starts_with(&prefix));
        }
    }

    #[test]
    fn test_parse_version_missing_banner() {
        assert_eq!(parse_ffprobe_version(""), None);
        assert_eq!(parse_ffprobe_version("ffmpeg version 6.0"), None);
    }

    #[test]
    fn test_missing_binary_is_reported() {
        let err = check_ffprobe_available("/nonexistent/ffprobe-binary").unwrap_err();
        assert!(matches!(err, StartupError::FfprobeUnavailable(_)));
        assert!(err.to_string().contains("/nonexistent/ffprobe-binary"));
    }

    #[test]
    fn test_default_schedule_passes() {
        assert!(check_sweep_schedule(&Config::default()).is_ok());
    }

    #[test]
    fn test_invalid_schedule_fails() {
        let mut cfg = Config::default();
        cfg.pipeline.sweep_schedule = "every night".to_string();
        let err = check_sweep_schedule(&cfg).unwrap_err();
        assert!(matches!(err, StartupError::Schedule(_)));
        assert!(err.to_string().contains("every night"));
    }

    #[test]
    fn test_state_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        check_state_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_state_dir_under_a_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();
        let err = check_state_dir(&file.join("state")).unwrap_err();
        assert!(matches!(err, StartupError::StateDir { .. }));
    }
}
