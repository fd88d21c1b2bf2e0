use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One entry of a notification snapshot, as reported by the listing command.
///
/// `key` is the identity used for new/seen comparison; two records with the
/// same key are the same notification even if their content changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: i64,
    pub tag: String,
    pub key: String,
    pub group: String,
    pub package_name: String,
    pub title: String,
    pub content: String,
    /// Timestamp text exactly as produced by the source.
    pub when: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Integer,
    String,
}

impl FieldKind {
    fn matches(self, v: &Value) -> bool {
        match self {
            FieldKind::Integer => v.is_i64() || v.is_u64(),
            FieldKind::String => v.is_string(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            FieldKind::Integer => "integer",
            FieldKind::String => "string",
        }
    }
}

const FIELDS: &[(&str, FieldKind)] = &[
    ("id", FieldKind::Integer),
    ("tag", FieldKind::String),
    ("key", FieldKind::String),
    ("group", FieldKind::String),
    ("packageName", FieldKind::String),
    ("title", FieldKind::String),
    ("content", FieldKind::String),
    ("when", FieldKind::String),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: &'static str,
    pub problem: String,
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.problem)
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("invalid notification record: expected object, got {0}")]
    NotAnObject(&'static str),
    #[error("invalid notification record: {}", join_issues(.0))]
    Fields(Vec<FieldIssue>),
    #[error("invalid notification record: {0}")]
    Decode(#[from] serde_json::Error),
}

impl RecordError {
    /// Names of the offending fields, empty when the value was not an object.
    pub fn fields(&self) -> Vec<&'static str> {
        match self {
            RecordError::Fields(issues) => issues.iter().map(|i| i.field).collect(),
            _ => Vec::new(),
        }
    }
}

fn join_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl NotificationRecord {
    /// Validate an arbitrary JSON value against the record shape.
    ///
    /// Every missing or mistyped field is reported, not only the first one.
    /// Unknown extra fields are ignored.
    pub fn validate(value: &Value) -> Result<Self, RecordError> {
        let Some(obj) = value.as_object() else {
            return Err(RecordError::NotAnObject(json_type_name(value)));
        };

        let issues = FIELDS
            .iter()
            .filter_map(|&(name, kind)| match obj.get(name) {
                None => Some(FieldIssue {
                    field: name,
                    problem: "missing".to_string(),
                }),
                Some(v) if !kind.matches(v) => Some(FieldIssue {
                    field: name,
                    problem: format!("expected {}, got {}", kind.as_str(), json_type_name(v)),
                }),
                Some(_) => None,
            })
            .collect::<Vec<_>>();

        if !issues.is_empty() {
            return Err(RecordError::Fields(issues));
        }

        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}
