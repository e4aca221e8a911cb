//! Drop rules for session replay uploads.
//!
//! A rule set is a JSON array of rules, a rule is an array of conditions:
//!
//! ```json
//! [[{"key": "app_id", "operator": "exact", "value": "app_a"},
//!   {"key": "env", "operator": "in", "value": ["dev", "test"]}],
//!  [{"key": "user-agent", "operator": "icontains", "value": "bot"}]]
//! ```
//!
//! An upload is dropped when all the conditions of any rule hold.

use std::collections::HashMap;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("invalid filter rules: {0}")]
    Json(#[from] serde_json::Error),
    #[error("operator {operator} on key {key} needs a value")]
    MissingValue { key: String, operator: &'static str },
    #[error("invalid regex {pattern:?}: {source}")]
    Regex {
        pattern: String,
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorType {
    Exact,
    IsNot,
    In,
    NotIn,
    Icontains,
    NotIcontains,
    Regex,
    NotRegex,
    IsSet,
    IsNotSet,
}

impl OperatorType {
    fn as_str(&self) -> &'static str {
        match self {
            OperatorType::Exact => "exact",
            OperatorType::IsNot => "is_not",
            OperatorType::In => "in",
            OperatorType::NotIn => "not_in",
            OperatorType::Icontains => "icontains",
            OperatorType::NotIcontains => "not_icontains",
            OperatorType::Regex => "regex",
            OperatorType::NotRegex => "not_regex",
            OperatorType::IsSet => "is_set",
            OperatorType::IsNotSet => "is_not_set",
        }
    }

    fn is_negative(&self) -> bool {
        matches!(
            self,
            OperatorType::IsNot
                | OperatorType::NotIn
                | OperatorType::NotIcontains
                | OperatorType::NotRegex
                | OperatorType::IsNotSet
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionSpec {
    pub key: String,
    pub operator: OperatorType,
    pub value: Option<Value>,
}

fn to_string_representation(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug)]
enum Test {
    Equals(Vec<String>),
    Contains(String),
    Matches(Regex),
    Present,
}

#[derive(Debug)]
struct Condition {
    key: String,
    negate: bool,
    test: Test,
}

impl Condition {
    fn compile(spec: ConditionSpec) -> Result<Self, FilterError> {
        let operator = spec.operator;
        let value = || {
            spec.value.as_ref().ok_or_else(|| FilterError::MissingValue {
                key: spec.key.clone(),
                operator: operator.as_str(),
            })
        };

        let test = match operator {
            OperatorType::Exact | OperatorType::IsNot | OperatorType::In | OperatorType::NotIn => {
                let candidates: Vec<String> = match value()? {
                    Value::Array(values) => values.iter().map(to_string_representation).collect(),
                    single => vec![to_string_representation(single)],
                };
                Test::Equals(candidates.into_iter().map(|v| v.to_lowercase()).collect())
            }
            OperatorType::Icontains | OperatorType::NotIcontains => {
                Test::Contains(to_string_representation(value()?).to_ascii_lowercase())
            }
            OperatorType::Regex | OperatorType::NotRegex => {
                let pattern = to_string_representation(value()?);
                let regex = Regex::new(&pattern)
                    .map_err(|source| FilterError::Regex { pattern, source })?;
                Test::Matches(regex)
            }
            OperatorType::IsSet | OperatorType::IsNotSet => Test::Present,
        };

        Ok(Self {
            key: spec.key,
            negate: operator.is_negative(),
            test,
        })
    }

    fn holds(&self, view: &HashMap<String, String>) -> bool {
        // a missing key fails positive operators and satisfies negative ones
        let Some(found) = view.get(&self.key) else {
            return self.negate;
        };

        let positive = match &self.test {
            Test::Equals(candidates) => candidates.contains(&found.to_lowercase()),
            Test::Contains(needle) => found.to_ascii_lowercase().contains(needle.as_str()),
            Test::Matches(regex) => regex.is_match(found),
            Test::Present => true,
        };
        positive != self.negate
    }
}

/// Compiled rule set, empty matches nothing.
#[derive(Debug, Default)]
pub struct ReplayFilter {
    rules: Vec<Vec<Condition>>,
}

impl ReplayFilter {
    pub fn from_json(raw: &str) -> Result<Self, FilterError> {
        let specs: Vec<Vec<ConditionSpec>> = serde_json::from_str(raw)?;
        Self::compile(specs)
    }

    pub fn compile(specs: Vec<Vec<ConditionSpec>>) -> Result<Self, FilterError> {
        let rules = specs
            .into_iter()
            .filter(|rule| !rule.is_empty())
            .map(|rule| {
                rule.into_iter()
                    .map(Condition::compile)
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn matches(&self, view: &HashMap<String, String>) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.iter().all(|condition| condition.holds(view)))
    }
}
