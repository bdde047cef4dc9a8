//! Form and record types shared by the submission path.
//!
//! This module defines:
//! - [`UserForm`] - The user-submitted form and its field rules
//! - [`FieldError`] - One failed field rule
//! - [`RecordFields`] - Field map written to the remote list
//! - [`RecordTarget`] - Name of the remote list records go to
//! - [`SubmissionOutcome`] - What the boundary reports back to the caller

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum length of the name and email fields, in characters.
pub const MAX_FIELD_LENGTH: usize = 100;

/// Field map sent to the remote API, in insertion order.
pub type RecordFields = serde_json::Map<String, Value>;

const SUBMITTED_ON: &str = "SubmittedOn";

/// Name of the remote list that receives records.
///
/// # Examples
///
/// ```
/// use formbridge_core::RecordTarget;
///
/// let target = RecordTarget::new(" Submissions ");
/// assert_eq!(target.as_str(), "Submissions");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordTarget(String);

impl RecordTarget {
    /// Create a target; surrounding whitespace is trimmed.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordTarget {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RecordTarget {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// A field that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// The form a user submits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserForm {
    pub name: String,
    pub email: String,
}

impl UserForm {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// Check the field rules; returns every failure, not just the first.
    pub fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        let name = self.name.trim();
        if name.is_empty() {
            errors.push(FieldError::new("name", "Name is required"));
        } else if name.chars().count() > MAX_FIELD_LENGTH {
            errors.push(FieldError::new(
                "name",
                format!("Name cannot exceed {} characters", MAX_FIELD_LENGTH),
            ));
        }

        let email = self.email.trim();
        if email.is_empty() {
            errors.push(FieldError::new("email", "Email is required"));
        } else if email.chars().count() > MAX_FIELD_LENGTH {
            errors.push(FieldError::new(
                "email",
                format!("Email cannot exceed {} characters", MAX_FIELD_LENGTH),
            ));
        } else if !is_email(email) {
            errors.push(FieldError::new("email", "Invalid email address"));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Build the record field map.
    ///
    /// `Title` and `Email` come first, `extra` is merged over them and
    /// `SubmittedOn` is always set last.
    pub fn to_record_fields(&self, extra: &RecordFields, submitted_at: DateTime<Utc>) -> RecordFields {
        let mut fields = RecordFields::new();
        fields.insert("Title".into(), Value::String(self.name.trim().to_string()));
        fields.insert("Email".into(), Value::String(self.email.trim().to_string()));
        for (key, value) in extra.iter().filter(|(key, _)| *key != SUBMITTED_ON) {
            fields.insert(key.clone(), value.clone());
        }
        fields.insert(
            SUBMITTED_ON.into(),
            Value::String(submitted_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        fields
    }
}

fn is_email(value: &str) -> bool {
    let mut parts = value.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty() && !domain.is_empty() && !value.contains(char::is_whitespace)
        }
        _ => false,
    }
}

/// Result of one form submission.
///
/// `primary_accepted` is false only when validation failed; a failed remote
/// write shows up in `secondary_write_succeeded` and never flips it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionOutcome {
    pub primary_accepted: bool,
    pub secondary_write_succeeded: bool,
    pub secondary_failure_detail: Option<String>,
    pub validation_errors: Vec<FieldError>,
}

impl SubmissionOutcome {
    pub(crate) fn rejected(errors: Vec<FieldError>) -> Self {
        Self {
            primary_accepted: false,
            secondary_write_succeeded: false,
            secondary_failure_detail: None,
            validation_errors: errors,
        }
    }

    pub(crate) fn written() -> Self {
        Self {
            primary_accepted: true,
            secondary_write_succeeded: true,
            secondary_failure_detail: None,
            validation_errors: Vec::new(),
        }
    }

    pub(crate) fn degraded(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            primary_accepted: true,
            secondary_write_succeeded: false,
            secondary_failure_detail: Some(if detail.trim().is_empty() {
                "remote write failed".to_string()
            } else {
                detail
            }),
            validation_errors: Vec::new(),
        }
    }

    /// User-facing line for the primary action.
    pub fn message(&self) -> &'static str {
        if self.primary_accepted {
            "Thank you! Your submission has been received."
        } else {
            "Please correct the highlighted fields and submit again."
        }
    }

    /// Softened notice when the record was not written.
    pub fn notice(&self) -> Option<&'static str> {
        (self.primary_accepted && !self.secondary_write_succeeded)
            .then_some("received, but not yet saved to the remote store")
    }
}
