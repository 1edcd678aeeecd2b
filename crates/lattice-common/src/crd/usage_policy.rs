//! Usage policy for shared BackupStorage objects
//!
//! A BackupStorage is namespaced, but other namespaces may reference it when
//! its `usagePolicy.allowedNamespaces` permits them. Without a policy the
//! storage is only usable from its own namespace.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Operator for label selector requirements
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LabelSelectorOperator {
    /// Label value must be in the specified set
    In,
    /// Label value must not be in the specified set
    NotIn,
    /// Label must exist (value ignored)
    Exists,
    /// Label must not exist (value ignored)
    DoesNotExist,
}

impl LabelSelectorOperator {
    /// Check a single (possibly missing) label value against the requirement values
    pub fn matches(&self, label_value: Option<&str>, values: &[String]) -> bool {
        match self {
            Self::In => label_value.is_some_and(|v| values.iter().any(|req| req == v)),
            Self::NotIn => label_value.is_none_or(|v| !values.iter().any(|req| req == v)),
            Self::Exists => label_value.is_some(),
            Self::DoesNotExist => label_value.is_none(),
        }
    }
}

/// A namespace label requirement
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    /// The label key that the selector applies to
    pub key: String,

    /// Relationship between the label and `values`
    pub operator: LabelSelectorOperator,

    /// Values for `In` / `NotIn`; empty for `Exists` / `DoesNotExist`
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelSelectorRequirement {
    /// Check whether a label set satisfies this requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.operator
            .matches(labels.get(&self.key).map(String::as_str), &self.values)
    }
}

/// Selects namespaces by their labels
///
/// An empty selector matches every namespace.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    /// Exact label matches, all of which must hold
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    /// Label requirements, all of which must hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl NamespaceSelector {
    /// Check if namespace labels match this selector
    pub fn matches(&self, namespace_labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(key, value)| namespace_labels.get(key) == Some(value))
            && self
                .match_expressions
                .iter()
                .all(|req| req.matches(namespace_labels))
    }

    /// Check if this selector is empty (matches everything)
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }
}

/// Which namespaces are allowed to reference a BackupStorage
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum FromNamespaces {
    /// Only the declaring namespace, plus any explicitly listed namespaces
    #[default]
    Same,
    /// Every namespace in the cluster
    All,
    /// Namespaces matching `selector`, plus any explicitly listed namespaces
    Selector,
}

/// Namespaces permitted to use a BackupStorage from outside its namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AllowedNamespaces {
    /// Selection mode
    #[serde(default)]
    pub from: FromNamespaces,

    /// Namespaces allowed by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,

    /// Label selector, consulted when `from` is `Selector`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<NamespaceSelector>,
}

/// How a BackupStorage may be shared across namespaces
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsagePolicy {
    /// Namespaces allowed to reference the storage
    #[serde(default)]
    pub allowed_namespaces: AllowedNamespaces,
}

impl UsagePolicy {
    /// Policy that allows every namespace
    pub fn all_namespaces() -> Self {
        Self {
            allowed_namespaces: AllowedNamespaces {
                from: FromNamespaces::All,
                ..Default::default()
            },
        }
    }

    /// Policy that allows the listed namespaces in addition to the declaring one
    pub fn namespaces<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_namespaces: AllowedNamespaces {
                from: FromNamespaces::Same,
                namespaces: namespaces.into_iter().map(Into::into).collect(),
                selector: None,
            },
        }
    }

    /// Whether this policy admits every namespace
    pub fn allows_all(&self) -> bool {
        self.allowed_namespaces.from == FromNamespaces::All
    }

    /// Whether `namespace` is named explicitly
    pub fn lists(&self, namespace: &str) -> bool {
        self.allowed_namespaces
            .namespaces
            .iter()
            .any(|ns| ns == namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = NamespaceSelector::default();
        assert!(selector.is_empty());
        assert!(selector.matches(&BTreeMap::new()));
    }

    #[test]
    fn test_selector_match_labels_and_expressions() {
        let selector = NamespaceSelector {
            match_labels: labels(&[("team", "data")]),
            match_expressions: vec![LabelSelectorRequirement {
                key: "env".to_string(),
                operator: LabelSelectorOperator::In,
                values: vec!["prod".to_string(), "staging".to_string()],
            }],
        };

        assert!(selector.matches(&labels(&[("team", "data"), ("env", "prod")])));
        assert!(!selector.matches(&labels(&[("team", "data"), ("env", "dev")])));
        assert!(!selector.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn test_operator_semantics() {
        let values = vec!["a".to_string()];
        assert!(LabelSelectorOperator::NotIn.matches(None, &values));
        assert!(!LabelSelectorOperator::NotIn.matches(Some("a"), &values));
        assert!(LabelSelectorOperator::Exists.matches(Some("x"), &[]));
        assert!(LabelSelectorOperator::DoesNotExist.matches(None, &[]));
    }

    #[test]
    fn test_usage_policy_parses_from_yaml() {
        let policy: UsagePolicy = serde_yaml::from_str(
            r#"
allowedNamespaces:
  from: Selector
  namespaces: [tools]
  selector:
    matchLabels:
      backup: enabled
"#,
        )
        .expect("parse usage policy");

        assert_eq!(policy.allowed_namespaces.from, FromNamespaces::Selector);
        assert!(policy.lists("tools"));
        assert!(!policy.allows_all());
        assert!(policy.allowed_namespaces.selector.is_some());
    }

    #[test]
    fn test_constructors() {
        assert!(UsagePolicy::all_namespaces().allows_all());
        let policy = UsagePolicy::namespaces(["a", "b"]);
        assert!(policy.lists("b"));
        assert!(!policy.lists("c"));
    }
}
