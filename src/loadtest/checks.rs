//! Named assertions evaluated against each request outcome.
//!
//! A [`Check`] pairs a name with a pure predicate over a
//! [`RequestOutcome`]. Checks are declared in TOML as `[[check]]` blocks
//! ([`CheckSpec`]) and compiled once at startup; every virtual user shares
//! the same compiled list.
//!
//! # Example TOML
//!
//! ```toml
//! [[check]]
//! name = "status is 200"
//! type = "status"
//! equals = 200
//!
//! [[check]]
//! name = "response body has routes"
//! type = "json_field"
//! field = "routes"
//!
//! [[check]]
//! name = "response time OK"
//! type = "max_duration"
//! max_ms = 2000
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::loadtest::executor::RequestOutcome;

type Predicate = dyn Fn(&RequestOutcome) -> bool + Send + Sync;

/// A named boolean assertion over a [`RequestOutcome`].
#[derive(Clone)]
pub struct Check {
    name: Arc<str>,
    predicate: Arc<Predicate>,
}

impl Check {
    /// Creates a check from a name and a pure predicate.
    pub fn new<F>(name: impl Into<Arc<str>>, predicate: F) -> Self
    where
        F: Fn(&RequestOutcome) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// The check name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the predicate against `outcome`.
    pub fn run(&self, outcome: &RequestOutcome) -> CheckResult {
        CheckResult {
            name: Arc::clone(&self.name),
            passed: (self.predicate)(outcome),
        }
    }
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Check").field("name", &self.name).finish()
    }
}

/// Result of one check against one outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    /// Name of the check.
    pub name: Arc<str>,
    /// Whether the predicate held.
    pub passed: bool,
}

/// Runs every check against `outcome`, in order.
///
/// A failing check never short-circuits the rest.
pub fn evaluate(outcome: &RequestOutcome, checks: &[Check]) -> Vec<CheckResult> {
    checks.iter().map(|check| check.run(outcome)).collect()
}

/// Declarative check definition from a `[[check]]` block.
///
/// The `type` field selects the variant.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckSpec {
    /// Response status equals `equals`.
    Status { name: String, equals: u16 },
    /// Response body is a JSON object with a top-level `field`.
    JsonField { name: String, field: String },
    /// Total request duration is strictly below `max_ms`.
    MaxDuration { name: String, max_ms: u64 },
    /// Response body contains `text`.
    BodyContains { name: String, text: String },
}

impl CheckSpec {
    /// The check name.
    pub fn name(&self) -> &str {
        match self {
            Self::Status { name, .. }
            | Self::JsonField { name, .. }
            | Self::MaxDuration { name, .. }
            | Self::BodyContains { name, .. } => name,
        }
    }

    /// Compiles the definition into a runnable [`Check`].
    pub fn build(&self) -> Check {
        match self.clone() {
            Self::Status { name, equals } => {
                Check::new(name, move |outcome| outcome.status == Some(equals))
            },
            Self::JsonField { name, field } => Check::new(name, move |outcome| {
                outcome
                    .json()
                    .is_some_and(|value| value.get(field.as_str()).is_some())
            }),
            Self::MaxDuration { name, max_ms } => {
                let limit = Duration::from_millis(max_ms);
                Check::new(name, move |outcome| outcome.duration() < limit)
            },
            Self::BodyContains { name, text } => {
                Check::new(name, move |outcome| outcome.body.contains(text.as_str()))
            },
        }
    }
}

/// The checks applied when a config declares no `[[check]]` blocks.
pub fn default_check_specs() -> Vec<CheckSpec> {
    vec![
        CheckSpec::Status {
            name: "status is 200".to_string(),
            equals: 200,
        },
        CheckSpec::JsonField {
            name: "response body has routes".to_string(),
            field: "routes".to_string(),
        },
        CheckSpec::MaxDuration {
            name: "response time OK".to_string(),
            max_ms: 2000,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::error::RequestError;
    use crate::loadtest::executor::Timings;

    fn ok_outcome(ms: u64) -> RequestOutcome {
        RequestOutcome::response(
            200,
            r#"{"code":"Ok","routes":[{"distance":2263.4}]}"#,
            Timings::from_total(Duration::from_millis(ms)),
        )
    }

    fn default_checks() -> Vec<Check> {
        default_check_specs().iter().map(CheckSpec::build).collect()
    }

    #[test]
    fn test_default_checks_pass_on_healthy_response() {
        let results = evaluate(&ok_outcome(50), &default_checks());
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.passed), "{results:?}");
        assert_eq!(&*results[0].name, "status is 200");
        assert_eq!(&*results[1].name, "response body has routes");
        assert_eq!(&*results[2].name, "response time OK");
    }

    #[test]
    fn test_failing_check_does_not_skip_others() {
        // Slow but otherwise healthy: only the duration check fails.
        let results = evaluate(&ok_outcome(2500), &default_checks());
        let passed: Vec<bool> = results.iter().map(|r| r.passed).collect();
        assert_eq!(passed, vec![true, true, false]);
    }

    #[test]
    fn test_network_error_fails_status_and_body_checks() {
        let outcome = RequestOutcome::failure(
            RequestError::Connection {
                message: "refused".to_string(),
            },
            Timings::from_total(Duration::from_millis(3)),
        );
        let results = evaluate(&outcome, &default_checks());
        let passed: Vec<bool> = results.iter().map(|r| r.passed).collect();
        assert_eq!(passed, vec![false, false, true]);
    }

    #[test]
    fn test_json_field_rejects_non_json_and_missing_field() {
        let check = CheckSpec::JsonField {
            name: "has routes".to_string(),
            field: "routes".to_string(),
        }
        .build();
        let timings = Timings::default();

        let missing = RequestOutcome::response(400, r#"{"code":"InvalidQuery"}"#, timings);
        assert!(!check.run(&missing).passed);

        let html = RequestOutcome::response(200, "<html></html>", timings);
        assert!(!check.run(&html).passed);

        let null_routes = RequestOutcome::response(200, r#"{"routes":null}"#, timings);
        assert!(check.run(&null_routes).passed);
    }

    #[test]
    fn test_body_contains() {
        let check = CheckSpec::BodyContains {
            name: "ok code".to_string(),
            text: "\"Ok\"".to_string(),
        }
        .build();
        assert!(check.run(&ok_outcome(10)).passed);
    }

    #[test]
    fn test_custom_closure_check() {
        let check = Check::new("small body", |o: &RequestOutcome| o.body.len() < 8);
        assert_eq!(check.name(), "small body");
        let outcome = RequestOutcome::response(200, "tiny", Timings::default());
        assert!(check.run(&outcome).passed);
    }

    #[test]
    fn test_parse_check_specs_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            check: Vec<CheckSpec>,
        }
        let doc: Doc = toml::from_str(
            r#"
[[check]]
name = "status is 200"
type = "status"
equals = 200

[[check]]
name = "fast"
type = "max_duration"
max_ms = 500
"#,
        )
        .unwrap();
        assert_eq!(doc.check.len(), 2);
        assert_eq!(
            doc.check[1],
            CheckSpec::MaxDuration {
                name: "fast".to_string(),
                max_ms: 500
            }
        );
    }
}
