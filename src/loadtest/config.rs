//! TOML-based load test configuration.
//!
//! Every section is optional: an empty file reproduces the reference
//! profile (five stages peaking at 5000 VUs, the four-route coordinate pool,
//! three response checks and two thresholds).
//!
//! # Example TOML
//!
//! ```toml
//! [settings]
//! base_url = "http://localhost:5000"
//! timeout_ms = 10000
//! iteration_period_ms = 1000
//!
//! [data]
//! coordinates = [
//!     "128.0923,35.1747;128.1171,35.1759",
//!     "128.1171,35.1759;128.0923,35.1747",
//! ]
//!
//! [[stage]]
//! duration_secs = 30
//! target_vus = 100
//!
//! [[stage]]
//! duration_secs = 30
//! target_vus = 0
//!
//! [thresholds]
//! http_req_duration = ["p(95)<2000"]
//! http_req_failed = "rate<0.01"
//! ```
//!
//! The base URL can also be supplied through the `BASE_URL` environment
//! variable or `--base-url`, both of which take precedence over the file.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::loadtest::checks::{default_check_specs, CheckSpec};
use crate::loadtest::error::LoadTestError;
use crate::loadtest::threshold::Threshold;

/// A load-shaping stage defining a target VU count and duration.
///
/// The scheduler linearly moves from the previous stage's target (or
/// `settings.start_vus` for the first stage) to `target_vus` over
/// `duration_secs`. A zero-duration stage is an instantaneous step.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    /// Duration of this stage in seconds.
    pub duration_secs: u64,
    /// Target number of virtual users at the end of this stage.
    pub target_vus: u32,
}

impl Stage {
    /// Creates a stage.
    pub fn new(duration_secs: u64, target_vus: u32) -> Self {
        Self {
            duration_secs,
            target_vus,
        }
    }

    /// The stage duration as a [`Duration`].
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// One or many threshold expressions for a metric.
///
/// Accepts both `metric = "p(95)<2000"` and `metric = ["p(95)<2000", ...]`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ThresholdExprs {
    One(String),
    Many(Vec<String>),
}

impl ThresholdExprs {
    /// The expressions as a slice-like iterator.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let items: &[String] = match self {
            Self::One(expr) => std::slice::from_ref(expr),
            Self::Many(exprs) => exprs,
        };
        items.iter().map(String::as_str)
    }
}

/// Top-level load test configuration parsed from a TOML file.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoadTestConfig {
    /// General execution settings.
    #[serde(default)]
    pub settings: Settings,
    /// Input data for the route requests.
    #[serde(default)]
    pub data: DataSettings,
    /// Ramp profile.
    ///
    /// The field name is `stage` (not `stages`) because TOML `[[stage]]`
    /// array-of-tables syntax creates a key called `stage`.
    #[serde(default = "default_stages")]
    pub stage: Vec<Stage>,
    /// Response checks, run against every outcome in declaration order.
    #[serde(default = "default_check_specs")]
    pub check: Vec<CheckSpec>,
    /// Threshold expressions keyed by metric name.
    #[serde(default = "default_thresholds")]
    pub thresholds: BTreeMap<String, ThresholdExprs>,
}

/// General load test settings controlling execution parameters.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Base URL of the routing service (no trailing path).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Routing profile segment of the request path.
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Target duration of one iteration in milliseconds.
    ///
    /// Virtual users sleep for whatever is left of the period after each
    /// request; slow iterations run back-to-back.
    #[serde(default = "default_iteration_period_ms")]
    pub iteration_period_ms: u64,
    /// VU count the first stage ramps from.
    #[serde(default)]
    pub start_vus: u32,
    /// Scheduler reconcile interval in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Minimum trend samples before a percentile threshold is evaluated.
    ///
    /// Below this count the threshold reports "insufficient samples" and
    /// fails.
    #[serde(default = "default_min_percentile_samples")]
    pub min_percentile_samples: u64,
    /// Where the JSON summary is written.
    #[serde(default = "default_summary_path")]
    pub summary_path: PathBuf,
}

/// Input data settings.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DataSettings {
    /// Pool of `lon,lat;lon,lat` coordinate strings.
    #[serde(default = "default_coordinates")]
    pub coordinates: Vec<String>,
    /// Pick coordinates uniformly at random (`true`) or cycle in order.
    #[serde(default = "default_random")]
    pub random: bool,
}

fn default_base_url() -> String {
    "http://1.230.54.14:5001".to_string()
}

fn default_profile() -> String {
    "driving".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_iteration_period_ms() -> u64 {
    1_000
}

fn default_tick_ms() -> u64 {
    100
}

fn default_min_percentile_samples() -> u64 {
    1
}

fn default_summary_path() -> PathBuf {
    PathBuf::from("summary.json")
}

fn default_random() -> bool {
    true
}

fn default_coordinates() -> Vec<String> {
    [
        "128.0923,35.1747;128.1171,35.1759",
        "128.1171,35.1759;128.0923,35.1747",
        "128.0923,35.1747;128.0923,35.1759",
        "128.1171,35.1747;128.1171,35.1759",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_stages() -> Vec<Stage> {
    vec![
        Stage::new(30, 100),
        Stage::new(60, 2000),
        Stage::new(120, 5000),
        Stage::new(60, 2000),
        Stage::new(30, 0),
    ]
}

fn default_thresholds() -> BTreeMap<String, ThresholdExprs> {
    BTreeMap::from([
        (
            "http_req_duration".to_string(),
            ThresholdExprs::Many(vec!["p(95)<2000".to_string()]),
        ),
        (
            "http_req_failed".to_string(),
            ThresholdExprs::Many(vec!["rate<0.01".to_string()]),
        ),
    ])
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            profile: default_profile(),
            timeout_ms: default_timeout_ms(),
            iteration_period_ms: default_iteration_period_ms(),
            start_vus: 0,
            tick_ms: default_tick_ms(),
            min_percentile_samples: default_min_percentile_samples(),
            summary_path: default_summary_path(),
        }
    }
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            coordinates: default_coordinates(),
            random: default_random(),
        }
    }
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            data: DataSettings::default(),
            stage: default_stages(),
            check: default_check_specs(),
            thresholds: default_thresholds(),
        }
    }
}

impl LoadTestConfig {
    /// Parse a TOML string into a validated [`LoadTestConfig`].
    ///
    /// Returns an error if the TOML is malformed or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, LoadTestError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a [`LoadTestConfig`] from a file path.
    ///
    /// Returns [`LoadTestError::ConfigIo`] if the file cannot be read,
    /// [`LoadTestError::ConfigParse`] if the TOML is malformed, or
    /// [`LoadTestError::ConfigValidation`] if validation fails.
    pub fn load(path: &Path) -> Result<Self, LoadTestError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadTestError::ConfigIo {
            source,
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Returns the sum of all stage durations, saturating at
    /// [`Duration::MAX`]. Validated configs never saturate.
    pub fn total_duration(&self) -> Duration {
        self.checked_total_duration().unwrap_or(Duration::MAX)
    }

    /// Sum of all stage durations, or `None` if it overflows.
    pub fn checked_total_duration(&self) -> Option<Duration> {
        self.stage
            .iter()
            .try_fold(Duration::ZERO, |total, stage| total.checked_add(stage.duration()))
    }

    /// Highest VU count any stage (or the start count) asks for.
    pub fn max_target_vus(&self) -> u32 {
        self.stage
            .iter()
            .map(|s| s.target_vus)
            .chain(std::iter::once(self.settings.start_vus))
            .max()
            .unwrap_or(0)
    }

    /// Parses every threshold expression, in metric-name order.
    pub fn parsed_thresholds(&self) -> Result<Vec<Threshold>, LoadTestError> {
        let mut parsed = Vec::new();
        for (metric, exprs) in &self.thresholds {
            for expr in exprs.iter() {
                let threshold = Threshold::parse(metric, expr).map_err(|e| {
                    LoadTestError::validation(format!(
                        "Invalid threshold for '{metric}': {e}"
                    ))
                })?;
                parsed.push(threshold);
            }
        }
        Ok(parsed)
    }

    /// Validate that the config is semantically correct.
    ///
    /// Checks:
    /// - At least one stage, with a positive total duration
    /// - Positive timeout, iteration period and tick
    /// - A parseable base URL and a non-empty profile
    /// - A non-empty coordinate pool of well-formed `lon,lat` pairs
    /// - Unique, non-empty check names
    /// - Every threshold expression parses
    pub fn validate(&self) -> Result<(), LoadTestError> {
        if self.stage.is_empty() {
            return Err(LoadTestError::validation(
                "Config must contain at least one [[stage]] block",
            ));
        }
        let total = self
            .checked_total_duration()
            .ok_or_else(|| LoadTestError::validation("Total stage duration overflows"))?;
        if total.is_zero() {
            return Err(LoadTestError::validation(
                "Total stage duration must be greater than 0",
            ));
        }

        let s = &self.settings;
        if s.timeout_ms == 0 {
            return Err(LoadTestError::validation(
                "settings.timeout_ms must be greater than 0",
            ));
        }
        if s.iteration_period_ms == 0 {
            return Err(LoadTestError::validation(
                "settings.iteration_period_ms must be greater than 0",
            ));
        }
        if s.tick_ms == 0 {
            return Err(LoadTestError::validation(
                "settings.tick_ms must be greater than 0",
            ));
        }

        let base = url::Url::parse(&s.base_url).map_err(|e| {
            LoadTestError::validation(format!("Invalid base_url '{}': {e}", s.base_url))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(LoadTestError::validation(format!(
                "base_url must use http or https, got '{}'",
                base.scheme()
            )));
        }
        if s.profile.is_empty() || s.profile.contains('/') {
            return Err(LoadTestError::validation(format!(
                "settings.profile must be a single path segment, got '{}'",
                s.profile
            )));
        }

        if self.data.coordinates.is_empty() {
            return Err(LoadTestError::validation(
                "data.coordinates must contain at least one entry",
            ));
        }
        for (i, coords) in self.data.coordinates.iter().enumerate() {
            parse_coordinates(coords).map_err(|reason| {
                LoadTestError::validation(format!(
                    "data.coordinates[{i}] '{coords}' is invalid: {reason}"
                ))
            })?;
        }

        let mut names = HashSet::new();
        for check in &self.check {
            if check.name().trim().is_empty() {
                return Err(LoadTestError::validation("Check names must not be empty"));
            }
            if !names.insert(check.name()) {
                return Err(LoadTestError::validation(format!(
                    "Duplicate check name '{}'",
                    check.name()
                )));
            }
        }

        self.parsed_thresholds()?;
        Ok(())
    }
}

impl Settings {
    /// Convert the `timeout_ms` field to a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Convert the `iteration_period_ms` field to a [`Duration`].
    pub fn iteration_period(&self) -> Duration {
        Duration::from_millis(self.iteration_period_ms)
    }

    /// Convert the `tick_ms` field to a [`Duration`].
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Parses a `lon,lat;lon,lat[;...]` string into coordinate pairs.
///
/// A route needs at least two waypoints. Longitudes must lie in
/// `-180..=180` and latitudes in `-90..=90`.
pub fn parse_coordinates(input: &str) -> Result<Vec<(f64, f64)>, String> {
    let mut pairs = Vec::new();
    for part in input.split(';') {
        let (lon, lat) = part
            .split_once(',')
            .ok_or_else(|| format!("'{part}' is not a lon,lat pair"))?;
        let lon: f64 = lon
            .trim()
            .parse()
            .map_err(|_| format!("longitude '{lon}' is not a number"))?;
        let lat: f64 = lat
            .trim()
            .parse()
            .map_err(|_| format!("latitude '{lat}' is not a number"))?;
        if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
            return Err(format!("longitude {lon} is out of range"));
        }
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(format!("latitude {lat} is out of range"));
        }
        pairs.push((lon, lat));
    }
    if pairs.len() < 2 {
        return Err("a route needs at least two coordinate pairs".to_string());
    }
    Ok(pairs)
}

/// Starter config written by `routeload init`.
///
/// Parses to exactly [`LoadTestConfig::default`].
pub const STARTER_TEMPLATE: &str = r#"# routeload configuration
#
# Every section is optional; omitted values fall back to the defaults
# shown here. BASE_URL in the environment overrides settings.base_url.

[settings]
base_url = "http://1.230.54.14:5001"
profile = "driving"
timeout_ms = 10000
iteration_period_ms = 1000
start_vus = 0
tick_ms = 100
min_percentile_samples = 1
summary_path = "summary.json"

[data]
random = true
coordinates = [
    "128.0923,35.1747;128.1171,35.1759",
    "128.1171,35.1759;128.0923,35.1747",
    "128.0923,35.1747;128.0923,35.1759",
    "128.1171,35.1747;128.1171,35.1759",
]

[[stage]]
duration_secs = 30
target_vus = 100

[[stage]]
duration_secs = 60
target_vus = 2000

[[stage]]
duration_secs = 120
target_vus = 5000

[[stage]]
duration_secs = 60
target_vus = 2000

[[stage]]
duration_secs = 30
target_vus = 0

[[check]]
name = "status is 200"
type = "status"
equals = 200

[[check]]
name = "response body has routes"
type = "json_field"
field = "routes"

[[check]]
name = "response time OK"
type = "max_duration"
max_ms = 2000

[thresholds]
http_req_duration = ["p(95)<2000"]
http_req_failed = ["rate<0.01"]
"#;
