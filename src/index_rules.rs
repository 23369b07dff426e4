//! Index pruning rules
//!
//! Each rule matches metric names by prefix and says how long a series may go
//! without new data before its index entry can be pruned. The first matching
//! rule wins; unmatched metrics fall through to a default rule that never
//! prunes unless configured otherwise.
//!
//! ```toml
//! [[rules]]
//! name = "short-lived"
//! prefix = "tmp."
//! max_stale = "1h30m"
//!
//! [default]
//! max_stale = "0"
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::path::Path;

/// Index rule errors
#[derive(Debug, thiserror::Error)]
pub enum IndexRulesError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse index rules: {0}")]
    Parse(String),

    #[error("[{rule}]: failed to parse max_stale {value:?}: {reason}")]
    InvalidDuration {
        rule: String,
        value: String,
        reason: String,
    },
}

/// One prefix rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRule {
    pub name: String,
    pub prefix: String,
    /// Zero means never prune
    pub max_stale: Duration,
}

impl IndexRule {
    fn catch_all() -> Self {
        Self {
            name: "default".to_string(),
            prefix: String::new(),
            max_stale: Duration::zero(),
        }
    }
}

/// Pruning decision inputs for one rule at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexCheck {
    pub keep: bool,
    /// Series last updated before this unix second are stale
    pub cutoff: i64,
}

/// Ordered rule list plus the catch-all
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRules {
    pub rules: Vec<IndexRule>,
    pub default: IndexRule,
}

#[derive(Deserialize)]
struct RawRules {
    #[serde(default)]
    rules: Vec<RawRule>,
    default: Option<RawDefault>,
}

#[derive(Deserialize)]
struct RawRule {
    name: String,
    #[serde(default)]
    prefix: String,
    #[serde(default)]
    max_stale: String,
}

#[derive(Deserialize)]
struct RawDefault {
    #[serde(default)]
    max_stale: String,
}

impl Default for IndexRules {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexRules {
    /// Only the catch-all, which never prunes
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default: IndexRule::catch_all(),
        }
    }

    /// Load rules from a TOML file
    pub fn load(path: &Path) -> Result<Self, IndexRulesError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse rules from TOML text
    pub fn from_toml(content: &str) -> Result<Self, IndexRulesError> {
        let raw: RawRules =
            toml::from_str(content).map_err(|e| IndexRulesError::Parse(e.to_string()))?;

        let mut result = Self::new();
        for rule in raw.rules {
            let name = rule.name.trim().to_string();
            if name.is_empty() || name.starts_with('#') {
                continue;
            }
            let max_stale = parse_rule_duration(&name, &rule.max_stale)?;
            result.rules.push(IndexRule {
                name,
                prefix: rule.prefix,
                max_stale,
            });
        }

        if let Some(default) = raw.default {
            result.default.max_stale = parse_rule_duration("default", &default.max_stale)?;
        }

        Ok(result)
    }

    /// First rule whose prefix matches `metric`, with its index.
    /// Falls back to the default at index `rules.len()`.
    pub fn matches(&self, metric: &str) -> (usize, &IndexRule) {
        self.rules
            .iter()
            .enumerate()
            .find(|(_, rule)| metric.starts_with(&rule.prefix))
            .unwrap_or((self.rules.len(), &self.default))
    }

    /// Rule at `index`; out-of-range indices give the default
    pub fn get(&self, index: usize) -> &IndexRule {
        self.rules.get(index).unwrap_or(&self.default)
    }

    /// Whether any rule prunes at all
    pub fn prunable(&self) -> bool {
        self.rules
            .iter()
            .chain(std::iter::once(&self.default))
            .any(|rule| rule.max_stale > Duration::zero())
    }

    /// One check per rule plus a final one for the default, indexed like [`matches`](Self::matches)
    pub fn checks(&self, now: DateTime<Utc>) -> Vec<IndexCheck> {
        self.rules
            .iter()
            .chain(std::iter::once(&self.default))
            .map(|rule| IndexCheck {
                keep: rule.max_stale.is_zero(),
                cutoff: (now - rule.max_stale).timestamp(),
            })
            .collect()
    }
}

fn parse_rule_duration(rule: &str, value: &str) -> Result<Duration, IndexRulesError> {
    parse_duration(value).map_err(|reason| IndexRulesError::InvalidDuration {
        rule: rule.to_string(),
        value: value.to_string(),
        reason,
    })
}

/// Parse `"90s"`, `"1h30m"`, `"2w"` and friends. Empty and `"0"` are zero.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() || value == "0" {
        return Ok(Duration::zero());
    }

    let mut total: i64 = 0;
    let mut rest = value;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("expected a number at {:?}", rest));
        }
        let amount: i64 = rest[..digits]
            .parse()
            .map_err(|e| format!("bad number {:?}: {}", &rest[..digits], e))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let seconds = match unit {
            "s" => 1,
            "m" | "min" => 60,
            "h" => 3600,
            "d" => 86_400,
            "w" => 7 * 86_400,
            "y" => 365 * 86_400,
            "" => return Err(format!("missing unit after {}", amount)),
            other => return Err(format!("unknown unit {:?}", other)),
        };

        total = amount
            .checked_mul(seconds)
            .and_then(|s| total.checked_add(s))
            .ok_or_else(|| "duration overflows".to_string())?;
    }

    Ok(Duration::seconds(total))
}
