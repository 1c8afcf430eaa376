//! The per-iteration work shared by every virtual user.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::loadtest::checks::{default_check_specs, Check, CheckSpec};
use crate::loadtest::config::LoadTestConfig;
use crate::loadtest::error::LoadTestError;
use crate::loadtest::executor::RequestSpec;
use crate::loadtest::provider::{DataProvider, RandomPool, SequenceProvider};

/// Immutable description of one iteration: which route to request, how
/// long to wait for it, which checks to run and how to pace.
pub struct Scenario {
    base_url: String,
    profile: String,
    provider: Arc<dyn DataProvider>,
    checks: Vec<Check>,
    timeout: Duration,
    period: Duration,
}

impl Scenario {
    /// Creates a scenario with the default checks, a 10s timeout and a 1s
    /// iteration period.
    pub fn new(
        base_url: impl Into<String>,
        profile: impl Into<String>,
        provider: Arc<dyn DataProvider>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            profile: profile.into(),
            provider,
            checks: default_check_specs().iter().map(CheckSpec::build).collect(),
            timeout: Duration::from_secs(10),
            period: Duration::from_secs(1),
        }
    }

    /// Builds the scenario described by `config`.
    ///
    /// The coordinate pool is drawn at random or in sequence according to
    /// `data.random`.
    pub fn from_config(config: &LoadTestConfig) -> Result<Self, LoadTestError> {
        let pool = config.data.coordinates.clone();
        let provider: Arc<dyn DataProvider> = if config.data.random {
            Arc::new(RandomPool::new(pool).ok_or_else(empty_pool)?)
        } else {
            Arc::new(SequenceProvider::new(pool).ok_or_else(empty_pool)?)
        };

        Ok(Self::new(
            config.settings.base_url.as_str(),
            config.settings.profile.as_str(),
            provider,
        )
        .with_checks(config.check.iter().map(CheckSpec::build).collect())
        .with_timeout(config.settings.timeout())
        .with_period(config.settings.iteration_period()))
    }

    pub fn with_checks(mut self, checks: Vec<Check>) -> Self {
        self.checks = checks;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Replaces the input data source.
    pub fn with_provider(mut self, provider: Arc<dyn DataProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// `{base_url}/route/v1/{profile}/{coordinates}`
    pub fn route_url(&self, coordinates: &str) -> String {
        format!(
            "{}/route/v1/{}/{}",
            self.base_url, self.profile, coordinates
        )
    }

    /// Draws the next coordinates and builds the request for them.
    pub fn next_request(&self) -> RequestSpec {
        RequestSpec::get(self.route_url(self.provider.next()))
            .with_header("Content-Type", "application/json")
    }

    pub fn checks(&self) -> &[Check] {
        &self.checks
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("base_url", &self.base_url)
            .field("profile", &self.profile)
            .field("pool_size", &self.provider.len())
            .field("checks", &self.checks)
            .field("timeout", &self.timeout)
            .field("period", &self.period)
            .finish()
    }
}

fn empty_pool() -> LoadTestError {
    LoadTestError::validation("data.coordinates must contain at least one entry")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::config::LoadTestConfig;

    #[test]
    fn test_route_url_joins_segments() {
        let provider = SequenceProvider::new(vec!["1,2;3,4".to_string()]).unwrap();
        let scenario = Scenario::new("http://osrm.test:5001/", "foot", Arc::new(provider));
        assert_eq!(
            scenario.route_url("1,2;3,4"),
            "http://osrm.test:5001/route/v1/foot/1,2;3,4"
        );
    }

    #[test]
    fn test_next_request_is_json_get() {
        let provider = SequenceProvider::new(vec!["1,2;3,4".to_string()]).unwrap();
        let scenario = Scenario::new("http://osrm.test", "driving", Arc::new(provider));
        let request = scenario.next_request();
        assert_eq!(request.method, reqwest::Method::GET);
        assert_eq!(request.url, "http://osrm.test/route/v1/driving/1,2;3,4");
        assert_eq!(
            request.headers,
            vec![("Content-Type".to_string(), "application/json".to_string())]
        );
    }

    #[test]
    fn test_from_config_uses_settings() {
        let mut config = LoadTestConfig::default();
        config.settings.timeout_ms = 2500;
        config.settings.iteration_period_ms = 500;
        config.data.random = false;

        let scenario = Scenario::from_config(&config).unwrap();
        assert_eq!(scenario.timeout(), Duration::from_millis(2500));
        assert_eq!(scenario.period(), Duration::from_millis(500));
        assert_eq!(scenario.checks().len(), 3);

        // Sequential provider walks the pool in order.
        let first = scenario.next_request();
        let second = scenario.next_request();
        assert!(first.url.ends_with(&config.data.coordinates[0]));
        assert!(second.url.ends_with(&config.data.coordinates[1]));
    }

    #[test]
    fn test_from_config_rejects_empty_pool() {
        let mut config = LoadTestConfig::default();
        config.data.coordinates.clear();
        assert!(Scenario::from_config(&config).is_err());
    }
}
