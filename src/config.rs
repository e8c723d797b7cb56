//! Per-source tuning profiles and the resolved settings of one run.
//!
//! Remote services differ in how much concurrency they tolerate, how slow
//! they are, and how they misbehave near the end of a document. Those
//! differences are data, not code: a [`ProfileSet`] maps a manifest's
//! `sourceName` to a [`SourceProfile`] whose every field is optional, and
//! [`RunSettings::resolve`] fills the gaps from global defaults.
//!
//! Profiles are JSON with camelCase keys:
//!
//! ```json
//! {
//!   "default": { "concurrency": 4 },
//!   "slow-archive": { "concurrency": 2, "timeoutMultiplier": 3.0, "stuckIdleWindowSeconds": 180 }
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::download::constants::BASE_REQUEST_TIMEOUT_SECS;
use crate::download::{DEFAULT_MAX_RETRIES, ProbeMethod, RetryPolicy};

/// Default worker pool size.
pub const DEFAULT_CONCURRENCY: usize = 4;
/// Default chunk ceiling: 192 MiB.
pub const DEFAULT_CHUNK_BYTE_CEILING: f64 = 192.0 * 1024.0 * 1024.0;
/// Fallback per-page estimate when nothing can be measured: 1.5 MiB.
pub const DEFAULT_PER_PAGE_BYTE_ESTIMATE: f64 = 1.5 * 1024.0 * 1024.0;
/// Default stuck idle window.
pub const DEFAULT_STUCK_IDLE_WINDOW_SECS: u64 = 60;
/// Lower clamp for the stuck idle window.
pub const MIN_STUCK_IDLE_WINDOW_SECS: u64 = 5;
/// Upper clamp for the stuck idle window.
pub const MAX_STUCK_IDLE_WINDOW_SECS: u64 = 900;
/// Default fraction of missing tiles above which a page fails.
pub const DEFAULT_TILE_MISSING_FRACTION: f64 = 0.25;
/// Default trailing-page sample size for the tail check.
pub const DEFAULT_TAIL_SAMPLE_SIZE: usize = 15;
/// Default size ratio below which trailing pages are trimmed.
pub const DEFAULT_TAIL_TRIM_RATIO: f64 = 0.3;

const DEFAULT_MIN_TILE_BYTES: u64 = 64;
const DEFAULT_MIN_PAGE_BYTES: u64 = 512;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;
const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(32);

const CONCURRENCY_RANGE: std::ops::RangeInclusive<usize> = 1..=64;
const TIMEOUT_MULTIPLIER_RANGE: std::ops::RangeInclusive<f64> = 0.1..=20.0;
const RETRY_LIMIT_RANGE: std::ops::RangeInclusive<u32> = 1..=10;
const MAX_REQUEST_DELAY_MS: u64 = 60_000;
const MAX_BACKOFF_BASE_MS: u64 = 60_000;

/// Name of the profile every other profile falls back to.
pub const DEFAULT_PROFILE: &str = "default";

/// Errors in profile files and values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read profile file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed profile file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("profile '{profile}': invalid `{field}` value {value}, expected {expected}")]
    OutOfRange {
        profile: String,
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Tuning for one remote source. Omitted fields fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SourceProfile {
    pub concurrency: Option<usize>,
    pub timeout_multiplier: Option<f64>,
    /// Total attempts per request, including the first.
    pub retry_limit: Option<u32>,
    pub chunk_byte_ceiling: Option<f64>,
    /// Static estimate; when absent the run measures a sample instead.
    pub per_page_byte_estimate: Option<f64>,
    pub stuck_idle_window_seconds: Option<u64>,
    /// Minimum spacing between requests to the same host.
    pub request_delay_ms: Option<u64>,
    pub tile_missing_fraction: Option<f64>,
    pub min_tile_bytes: Option<u64>,
    pub min_page_bytes: Option<u64>,
    pub tail_sample_size: Option<usize>,
    pub tail_trim_ratio: Option<f64>,
    pub probe_method: Option<ProbeMethod>,
    pub backoff_base_ms: Option<u64>,
}

impl SourceProfile {
    /// Checks every present field against its documented range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for the first offending field.
    pub fn validate(&self, profile: &str) -> Result<(), ConfigError> {
        let out_of_range = |field, value: String, expected| ConfigError::OutOfRange {
            profile: profile.to_string(),
            field,
            value,
            expected,
        };

        if let Some(v) = self.concurrency
            && !CONCURRENCY_RANGE.contains(&v)
        {
            return Err(out_of_range("concurrency", v.to_string(), "1..=64"));
        }
        if let Some(v) = self.timeout_multiplier
            && !TIMEOUT_MULTIPLIER_RANGE.contains(&v)
        {
            return Err(out_of_range("timeoutMultiplier", v.to_string(), "0.1..=20"));
        }
        if let Some(v) = self.retry_limit
            && !RETRY_LIMIT_RANGE.contains(&v)
        {
            return Err(out_of_range("retryLimit", v.to_string(), "1..=10"));
        }
        for (field, value) in [
            ("chunkByteCeiling", self.chunk_byte_ceiling),
            ("perPageByteEstimate", self.per_page_byte_estimate),
        ] {
            if let Some(v) = value
                && !(v.is_finite() && v > 0.0)
            {
                return Err(out_of_range(field, v.to_string(), "a positive number"));
            }
        }
        if self.stuck_idle_window_seconds == Some(0) {
            return Err(out_of_range("stuckIdleWindowSeconds", "0".to_string(), "at least 1"));
        }
        if let Some(v) = self.request_delay_ms
            && v > MAX_REQUEST_DELAY_MS
        {
            return Err(out_of_range("requestDelayMs", v.to_string(), "0..=60000"));
        }
        if let Some(v) = self.backoff_base_ms
            && v > MAX_BACKOFF_BASE_MS
        {
            return Err(out_of_range("backoffBaseMs", v.to_string(), "0..=60000"));
        }
        for (field, value) in [
            ("tileMissingFraction", self.tile_missing_fraction),
            ("tailTrimRatio", self.tail_trim_ratio),
        ] {
            if let Some(v) = value
                && !(0.0..=1.0).contains(&v)
            {
                return Err(out_of_range(field, v.to_string(), "0..=1"));
            }
        }
        Ok(())
    }

    /// Field-wise overlay: values present in `self` win over `base`.
    #[must_use]
    pub fn merged_over(&self, base: &SourceProfile) -> SourceProfile {
        SourceProfile {
            concurrency: self.concurrency.or(base.concurrency),
            timeout_multiplier: self.timeout_multiplier.or(base.timeout_multiplier),
            retry_limit: self.retry_limit.or(base.retry_limit),
            chunk_byte_ceiling: self.chunk_byte_ceiling.or(base.chunk_byte_ceiling),
            per_page_byte_estimate: self.per_page_byte_estimate.or(base.per_page_byte_estimate),
            stuck_idle_window_seconds: self
                .stuck_idle_window_seconds
                .or(base.stuck_idle_window_seconds),
            request_delay_ms: self.request_delay_ms.or(base.request_delay_ms),
            tile_missing_fraction: self.tile_missing_fraction.or(base.tile_missing_fraction),
            min_tile_bytes: self.min_tile_bytes.or(base.min_tile_bytes),
            min_page_bytes: self.min_page_bytes.or(base.min_page_bytes),
            tail_sample_size: self.tail_sample_size.or(base.tail_sample_size),
            tail_trim_ratio: self.tail_trim_ratio.or(base.tail_trim_ratio),
            probe_method: self.probe_method.or(base.probe_method),
            backoff_base_ms: self.backoff_base_ms.or(base.backoff_base_ms),
        }
    }
}

/// Named profiles keyed by `sourceName`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileSet {
    profiles: HashMap<String, SourceProfile>,
}

impl ProfileSet {
    /// Loads and validates a JSON profile file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file is unreadable, malformed, or
    /// holds an out-of-range value.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let set: Self = serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        set.validate()?;
        debug!(path = %path.display(), profiles = set.profiles.len(), "loaded source profiles");
        Ok(set)
    }

    /// Validates every profile.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::OutOfRange`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.profiles
            .iter()
            .try_for_each(|(name, profile)| profile.validate(name))
    }

    pub fn insert(&mut self, source_name: impl Into<String>, profile: SourceProfile) {
        self.profiles.insert(source_name.into(), profile);
    }

    /// The profile for `source_name` layered over the `default` profile.
    #[must_use]
    pub fn profile_for(&self, source_name: &str) -> SourceProfile {
        let base = self.profiles.get(DEFAULT_PROFILE).cloned().unwrap_or_default();
        match self.profiles.get(source_name) {
            Some(profile) if source_name != DEFAULT_PROFILE => profile.merged_over(&base),
            _ => base,
        }
    }
}

/// Concrete settings for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub concurrency: usize,
    /// Base request timeout times the profile's multiplier.
    pub request_timeout: Duration,
    pub retry_limit: u32,
    pub backoff_base: Duration,
    pub chunk_byte_ceiling: f64,
    /// `None` asks the run to measure a sample.
    pub per_page_byte_estimate: Option<f64>,
    pub stuck_idle_window: Duration,
    pub request_delay: Duration,
    pub tile_missing_fraction: f64,
    pub min_tile_bytes: u64,
    pub min_page_bytes: u64,
    pub tail_sample_size: usize,
    pub tail_trim_ratio: f64,
    pub probe_method: ProbeMethod,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::resolve(&SourceProfile::default())
    }
}

impl RunSettings {
    /// Fills unset profile fields from global defaults, clamping into range.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn resolve(profile: &SourceProfile) -> Self {
        let multiplier = profile
            .timeout_multiplier
            .filter(|m| m.is_finite())
            .unwrap_or(1.0)
            .clamp(*TIMEOUT_MULTIPLIER_RANGE.start(), *TIMEOUT_MULTIPLIER_RANGE.end());
        let timeout_ms = (BASE_REQUEST_TIMEOUT_SECS as f64 * 1000.0 * multiplier).round() as u64;

        let positive = |v: Option<f64>| v.filter(|v| v.is_finite() && *v > 0.0);

        Self {
            concurrency: profile
                .concurrency
                .unwrap_or(DEFAULT_CONCURRENCY)
                .clamp(*CONCURRENCY_RANGE.start(), *CONCURRENCY_RANGE.end()),
            request_timeout: Duration::from_millis(timeout_ms),
            retry_limit: profile
                .retry_limit
                .unwrap_or(DEFAULT_MAX_RETRIES)
                .clamp(*RETRY_LIMIT_RANGE.start(), *RETRY_LIMIT_RANGE.end()),
            backoff_base: Duration::from_millis(
                profile
                    .backoff_base_ms
                    .unwrap_or(DEFAULT_BACKOFF_BASE_MS)
                    .min(MAX_BACKOFF_BASE_MS),
            ),
            chunk_byte_ceiling: positive(profile.chunk_byte_ceiling)
                .unwrap_or(DEFAULT_CHUNK_BYTE_CEILING),
            per_page_byte_estimate: positive(profile.per_page_byte_estimate),
            stuck_idle_window: Duration::from_secs(
                profile
                    .stuck_idle_window_seconds
                    .unwrap_or(DEFAULT_STUCK_IDLE_WINDOW_SECS)
                    .clamp(MIN_STUCK_IDLE_WINDOW_SECS, MAX_STUCK_IDLE_WINDOW_SECS),
            ),
            request_delay: Duration::from_millis(
                profile.request_delay_ms.unwrap_or(0).min(MAX_REQUEST_DELAY_MS),
            ),
            tile_missing_fraction: profile
                .tile_missing_fraction
                .unwrap_or(DEFAULT_TILE_MISSING_FRACTION)
                .clamp(0.0, 1.0),
            min_tile_bytes: profile.min_tile_bytes.unwrap_or(DEFAULT_MIN_TILE_BYTES),
            min_page_bytes: profile.min_page_bytes.unwrap_or(DEFAULT_MIN_PAGE_BYTES),
            tail_sample_size: profile.tail_sample_size.unwrap_or(DEFAULT_TAIL_SAMPLE_SIZE),
            tail_trim_ratio: profile
                .tail_trim_ratio
                .unwrap_or(DEFAULT_TAIL_TRIM_RATIO)
                .clamp(0.0, 1.0),
            probe_method: profile.probe_method.unwrap_or_default(),
        }
    }

    /// Retry policy with this run's attempt limit and backoff base.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_limit,
            self.backoff_base,
            MAX_BACKOFF_DELAY.max(self.backoff_base),
            2.0,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = RunSettings::default();
        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.retry_limit, 3);
        assert_eq!(settings.stuck_idle_window, Duration::from_secs(60));
        assert_eq!(settings.per_page_byte_estimate, None);
        assert_eq!(settings.probe_method, ProbeMethod::RangeGet);
        assert!((settings.chunk_byte_ceiling - 192.0 * 1024.0 * 1024.0).abs() < 1.0);
    }

    #[test]
    fn test_timeout_multiplier_scales_request_timeout() {
        let profile = SourceProfile {
            timeout_multiplier: Some(2.5),
            ..SourceProfile::default()
        };
        assert_eq!(
            RunSettings::resolve(&profile).request_timeout,
            Duration::from_secs(75)
        );
    }

    #[test]
    fn test_stuck_window_is_clamped() {
        let low = SourceProfile {
            stuck_idle_window_seconds: Some(1),
            ..SourceProfile::default()
        };
        let high = SourceProfile {
            stuck_idle_window_seconds: Some(10_000),
            ..SourceProfile::default()
        };
        assert_eq!(RunSettings::resolve(&low).stuck_idle_window, Duration::from_secs(5));
        assert_eq!(RunSettings::resolve(&high).stuck_idle_window, Duration::from_secs(900));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let profile = SourceProfile {
            concurrency: Some(0),
            ..SourceProfile::default()
        };
        assert!(matches!(
            profile.validate("x"),
            Err(ConfigError::OutOfRange { field: "concurrency", .. })
        ));

        let profile = SourceProfile {
            chunk_byte_ceiling: Some(-1.0),
            ..SourceProfile::default()
        };
        assert!(profile.validate("x").is_err());

        let profile = SourceProfile {
            tail_trim_ratio: Some(1.5),
            ..SourceProfile::default()
        };
        assert!(profile.validate("x").is_err());
    }

    #[test]
    fn test_profile_for_layers_over_default() {
        let json = r#"{
            "default": {"concurrency": 6, "retryLimit": 5},
            "slow": {"concurrency": 2, "timeoutMultiplier": 3.0, "probeMethod": "head"}
        }"#;
        let set: ProfileSet = serde_json::from_str(json).unwrap();
        set.validate().unwrap();

        let slow = set.profile_for("slow");
        assert_eq!(slow.concurrency, Some(2));
        assert_eq!(slow.retry_limit, Some(5));
        assert_eq!(slow.probe_method, Some(ProbeMethod::Head));

        let unknown = set.profile_for("elsewhere");
        assert_eq!(unknown.concurrency, Some(6));
    }

    #[test]
    fn test_unknown_profile_keys_rejected() {
        let json = r#"{"default": {"concurency": 6}}"#;
        assert!(serde_json::from_str::<ProfileSet>(json).is_err());
    }

    #[test]
    fn test_load_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = ProfileSet::load(&path).unwrap_err();
        assert!(err.to_string().contains("profiles.json"));
    }
}
