//! Per-category rate limit policies and the registry that selects them.

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Longest window a policy may declare. The fallback store's retention
/// ceiling must stay above this.
pub const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Immutable rate limit for one category of traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RateLimitPolicy {
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_window"))]
    pub window: Duration,
    #[validate(range(min = 1))]
    pub max_requests: u32,
    #[validate(length(min = 1, max = 128))]
    pub description: String,
}

impl RateLimitPolicy {
    pub fn new(window: Duration, max_requests: u32, description: impl Into<String>) -> Self {
        Self {
            window,
            max_requests,
            description: description.into(),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

fn validate_window(window: &Duration) -> std::result::Result<(), ValidationError> {
    if window.as_millis() == 0 {
        return Err(ValidationError::new("window_must_be_positive"));
    }
    if *window > MAX_WINDOW {
        return Err(ValidationError::new("window_too_long"));
    }
    Ok(())
}

/// How a rule recognises the paths it governs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathMatcher {
    Exact(String),
    Prefix(String),
    Pattern(String),
}

/// One category rule as written in a policy file.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PolicyRule {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    #[serde(rename = "match")]
    pub matcher: PathMatcher,
    #[serde(flatten)]
    #[validate(nested)]
    pub policy: RateLimitPolicy,
}

impl PolicyRule {
    pub fn new(name: &str, matcher: PathMatcher, policy: RateLimitPolicy) -> Self {
        Self {
            name: name.to_string(),
            matcher,
            policy,
        }
    }
}

/// Serializable policy table: ordered rules plus an optional default.
///
/// When `default` is absent the registry falls back to the default policy
/// derived from the environment.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PolicyConfig {
    #[validate(nested)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    #[validate(nested)]
    pub default: Option<RateLimitPolicy>,
}

impl PolicyConfig {
    /// The platform's built-in categories.
    pub fn builtin() -> Self {
        let minute = Duration::from_secs(60);
        Self {
            rules: vec![
                PolicyRule::new(
                    "ai-analysis",
                    PathMatcher::Pattern(r"^/api/(ai-[a-z0-9-]+|generate-[a-z0-9-]+-report)(/|$)".into()),
                    RateLimitPolicy::new(minute, 10, "AI analysis endpoints"),
                ),
                PolicyRule::new(
                    "intelligence",
                    PathMatcher::Pattern(r"^/api/clean-(routing|products)(/|$)".into()),
                    RateLimitPolicy::new(minute, 20, "Trade intelligence endpoints"),
                ),
                PolicyRule::new(
                    "external-api",
                    PathMatcher::Pattern(r"^/api/(external|comtrade|shipping-rates)(/|$)".into()),
                    RateLimitPolicy::new(minute, 30, "External API proxy endpoints"),
                ),
                PolicyRule::new(
                    "auth",
                    PathMatcher::Pattern(r"^/api/auth(/|$)".into()),
                    RateLimitPolicy::new(Duration::from_secs(15 * 60), 5, "Authentication endpoints"),
                ),
            ],
            default: None,
        }
    }

    /// Load a policy table from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read policy file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::Configuration(format!("invalid policy file {}: {}", path.display(), e))
        })
    }
}

#[derive(Debug)]
enum CompiledMatcher {
    Exact(String),
    Prefix(String),
    Pattern(Regex),
}

impl CompiledMatcher {
    fn compile(matcher: &PathMatcher) -> Result<Self> {
        Ok(match matcher {
            PathMatcher::Exact(path) => CompiledMatcher::Exact(path.clone()),
            PathMatcher::Prefix(prefix) => CompiledMatcher::Prefix(prefix.clone()),
            PathMatcher::Pattern(pattern) => CompiledMatcher::Pattern(Regex::new(pattern)?),
        })
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            CompiledMatcher::Exact(exact) => path == exact,
            CompiledMatcher::Prefix(prefix) => path.starts_with(prefix.as_str()),
            CompiledMatcher::Pattern(re) => re.is_match(path),
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    matcher: CompiledMatcher,
    policy: Arc<RateLimitPolicy>,
}

/// Read-only lookup table from request path to policy.
///
/// Rules are evaluated in declaration order and the first match wins, so
/// more specific rules belong earlier in the list. Built once and shared
/// behind an `Arc`; lookups take no locks.
#[derive(Debug)]
pub struct PolicyRegistry {
    rules: Vec<CompiledRule>,
    default: Arc<RateLimitPolicy>,
    source: PolicyConfig,
}

impl PolicyRegistry {
    /// Validate and compile a policy table. `fallback_default` is used when
    /// the table does not name its own default.
    pub fn compile(config: PolicyConfig, fallback_default: RateLimitPolicy) -> Result<Self> {
        config.validate()?;
        fallback_default.validate()?;

        let rules = config
            .rules
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    matcher: CompiledMatcher::compile(&rule.matcher)
                        .map_err(|e| Error::Policy(format!("rule '{}': {}", rule.name, e)))?,
                    policy: Arc::new(rule.policy.clone()),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let default = Arc::new(config.default.clone().unwrap_or(fallback_default));

        Ok(Self {
            rules,
            default,
            source: config,
        })
    }

    /// Built-in categories with the given default.
    pub fn builtin(default: RateLimitPolicy) -> Result<Self> {
        Self::compile(PolicyConfig::builtin(), default)
    }

    /// Policy for an already canonicalized path. Never fails: unmatched paths
    /// get the default policy.
    pub fn policy_for(&self, path: &str) -> Arc<RateLimitPolicy> {
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(path))
            .map(|rule| Arc::clone(&rule.policy))
            .unwrap_or_else(|| Arc::clone(&self.default))
    }

    pub fn default_policy(&self) -> &RateLimitPolicy {
        &self.default
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// The table this registry was compiled from, with the effective default
    /// filled in.
    pub fn to_config(&self) -> PolicyConfig {
        PolicyConfig {
            rules: self.source.rules.clone(),
            default: Some((*self.default).clone()),
        }
    }
}
