//! Types shared by the ferry CRDs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status enum
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// The closed set of conditions ferry publishes on a VMI
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum ConditionKind {
    /// Whether the VMI's volumes allow live migration
    IsMigratable,
    /// Whether a migration is currently active for the VMI
    Migrating,
}

impl std::fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IsMigratable => write!(f, "IsMigratable"),
            Self::Migrating => write!(f, "Migrating"),
        }
    }
}

/// State of a single condition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time the condition transitioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Create a new condition stamped with the current time
    pub fn new(
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Some(Utc::now()),
        }
    }

    /// True when status, reason and message match, ignoring timestamps
    pub fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

/// Typed condition map keyed by [`ConditionKind`]
///
/// Absent kinds read as `Unknown`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct Conditions(pub BTreeMap<ConditionKind, Condition>);

impl Conditions {
    /// Current state of `kind`, defaulting to Unknown
    pub fn get(&self, kind: ConditionKind) -> Condition {
        self.0.get(&kind).cloned().unwrap_or_default()
    }

    /// Status of `kind`, defaulting to Unknown
    pub fn status(&self, kind: ConditionKind) -> ConditionStatus {
        self.0.get(&kind).map(|c| c.status).unwrap_or_default()
    }

    /// Set `kind`, returning true when anything other than the timestamp changed
    ///
    /// The transition time is only moved when the status flips.
    pub fn set(&mut self, kind: ConditionKind, condition: Condition) -> bool {
        match self.0.get(&kind) {
            Some(existing) if existing.same_state(&condition) => false,
            Some(existing) if existing.status == condition.status => {
                let kept = existing.last_transition_time;
                self.0.insert(
                    kind,
                    Condition {
                        last_transition_time: kept,
                        ..condition
                    },
                );
                true
            }
            _ => {
                self.0.insert(kind, condition);
                true
            }
        }
    }

    /// Returns true if no condition has been recorded
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

const BINARY_SUFFIXES: &[(&str, u64)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

const DECIMAL_SUFFIXES: &[(&str, u64)] = &[
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

/// Parse a Kubernetes resource quantity into a byte count
///
/// Supports plain integers, decimal values and the binary (`Ki`..`Ei`) and
/// decimal (`k`..`E`) suffixes. Fractional results are rounded up.
pub fn parse_quantity(quantity: &str) -> Result<u64, crate::Error> {
    let trimmed = quantity.trim();
    if trimmed.is_empty() {
        return Err(crate::Error::validation("empty quantity"));
    }

    let (number, multiplier) = BINARY_SUFFIXES
        .iter()
        .chain(DECIMAL_SUFFIXES.iter())
        .find_map(|(suffix, mult)| trimmed.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((trimmed, 1));

    let value: f64 = number
        .parse()
        .map_err(|_| crate::Error::validation(format!("invalid quantity '{quantity}'")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(crate::Error::validation(format!(
            "invalid quantity '{quantity}'"
        )));
    }

    let bytes = (value * multiplier as f64).ceil();
    if bytes > u64::MAX as f64 {
        return Err(crate::Error::validation(format!(
            "quantity '{quantity}' overflows"
        )));
    }
    Ok(bytes as u64)
}
