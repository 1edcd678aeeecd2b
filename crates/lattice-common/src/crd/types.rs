//! Shared types used across Lattice storage CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
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

/// Kubernetes-style condition for status reporting
///
/// Conditions are keyed by `type_`: a status carries at most one condition
/// of each type. Use [`set_condition`] and [`remove_condition`] rather than
/// pushing onto the list directly.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., RepositorySyncFailed, DeletionBlocked)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Whether this condition is currently `True`
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Insert or replace the condition with the same type.
///
/// The previous `last_transition_time` is kept when the status did not
/// change, so repeating a reconciliation pass with the same observations
/// yields an identical condition list.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
    conditions.sort_by(|a, b| a.type_.cmp(&b.type_));
}

/// Remove the condition with the given type, returning whether one existed
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    conditions.len() != before
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_new_sets_timestamp() {
        let before = Utc::now();
        let condition = Condition::new(
            "DeletionBlocked",
            ConditionStatus::True,
            "RepositoriesAttached",
            "2 repositories still reference this storage",
        );
        let after = Utc::now();

        assert_eq!(condition.type_, "DeletionBlocked");
        assert!(condition.is_true());
        assert!(condition.last_transition_time >= before);
        assert!(condition.last_transition_time <= after);
    }

    #[test]
    fn test_condition_status_display() {
        assert_eq!(ConditionStatus::True.to_string(), "True");
        assert_eq!(ConditionStatus::False.to_string(), "False");
        assert_eq!(ConditionStatus::Unknown.to_string(), "Unknown");
    }

    /// Story: replacing a condition with the same status keeps its timestamp
    ///
    /// The aggregator rebuilds every condition on every pass. Keeping the
    /// original transition time is what makes repeated passes produce the
    /// same published status.
    #[test]
    fn story_same_status_keeps_transition_time() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new("RepositorySyncFailed", ConditionStatus::True, "SyncFailed", "a"),
        );
        let first = conditions[0].last_transition_time;

        std::thread::sleep(std::time::Duration::from_millis(5));
        set_condition(
            &mut conditions,
            Condition::new("RepositorySyncFailed", ConditionStatus::True, "SyncFailed", "b"),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "b");
        assert_eq!(conditions[0].last_transition_time, first);
    }

    #[test]
    fn test_status_change_moves_transition_time() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new("WipeFailed", ConditionStatus::True, "RemoteError", "x"),
        );
        let first = conditions[0].last_transition_time;

        std::thread::sleep(std::time::Duration::from_millis(5));
        set_condition(
            &mut conditions,
            Condition::new("WipeFailed", ConditionStatus::False, "Wiped", "x"),
        );

        assert!(conditions[0].last_transition_time > first);
    }

    #[test]
    fn test_conditions_sorted_and_removable() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new("WipeFailed", ConditionStatus::True, "r", "m"),
        );
        set_condition(
            &mut conditions,
            Condition::new("DefaultConflict", ConditionStatus::True, "r", "m"),
        );

        assert_eq!(conditions[0].type_, "DefaultConflict");
        assert!(find_condition(&conditions, "WipeFailed").is_some());
        assert!(remove_condition(&mut conditions, "WipeFailed"));
        assert!(!remove_condition(&mut conditions, "WipeFailed"));
        assert_eq!(conditions.len(), 1);
    }
}
