use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PaddockError {
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Missing attribute: {attr}")]
    NoAttr { attr: String },

    #[error("Invalid value for attribute {attr}: {value}")]
    BadAttr { attr: String, value: String },

    #[error("Referenced object not found: {object_type}[{id}]")]
    RefNotFound { object_type: String, id: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Already exists: {resource}")]
    AlreadyExists { resource: String },

    #[error("Object {resource} is in use by {}", dependents.join(", "))]
    InUse {
        resource: String,
        dependents: Vec<String>,
    },

    #[error("Unknown object type: {0}")]
    UnknownType(String),

    #[error("Type {object_type} cannot reference {ref_type}")]
    InvalidRef {
        object_type: String,
        ref_type: String,
    },

    #[error("No plugin '{name}' registered for {extension}. Available: {available:?}")]
    DriverNotFound {
        extension: String,
        name: String,
        available: Vec<String>,
    },

    #[error("Driver operation '{operation}' failed: {details}")]
    Driver { operation: String, details: String },

    #[error("Transition state inconsistent: expected={expected} state={state} accepts={accepts:?}")]
    BadState {
        expected: String,
        state: String,
        accepts: Vec<String>,
    },

    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    #[error(transparent)]
    Aggregate(AggregateError),

    #[error("Resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

pub type PaddockResult<T> = std::result::Result<T, PaddockError>;

impl PaddockError {
    pub fn driver(operation: impl Into<String>, details: impl ToString) -> Self {
        PaddockError::Driver {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    pub fn no_attr(attr: impl Into<String>) -> Self {
        PaddockError::NoAttr { attr: attr.into() }
    }

    pub fn bad_attr(attr: impl Into<String>, value: impl ToString) -> Self {
        PaddockError::BadAttr {
            attr: attr.into(),
            value: value.to_string(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        PaddockError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Client-side mistakes: bad input or referential integrity violations.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PaddockError::Validation { .. }
                | PaddockError::NoAttr { .. }
                | PaddockError::BadAttr { .. }
                | PaddockError::RefNotFound { .. }
                | PaddockError::NotFound { .. }
                | PaddockError::AlreadyExists { .. }
                | PaddockError::InUse { .. }
                | PaddockError::UnknownType(_)
                | PaddockError::InvalidRef { .. }
        )
    }
}

/// Errors collected from a sweep that must not stop at the first failure.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<(String, PaddockError)>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: impl Into<String>, error: PaddockError) {
        self.errors.push((label.into(), error));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[(String, PaddockError)] {
        &self.errors
    }

    /// Labels of every leaf failure, descending into nested aggregates.
    pub fn failed_labels(&self) -> Vec<String> {
        let mut labels = Vec::new();
        for (label, error) in &self.errors {
            match error {
                PaddockError::Aggregate(inner) => labels.extend(inner.failed_labels()),
                _ => labels.push(label.clone()),
            }
        }
        labels
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> PaddockResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(PaddockError::Aggregate(self))
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s):", self.errors.len())?;
        for (label, error) in &self.errors {
            write!(f, " [{}: {}]", label, error)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
