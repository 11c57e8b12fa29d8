use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: &'static str,
}

impl FieldError {
    pub const fn new(field: &'static str, message: &'static str) -> Self {
        Self { field, message }
    }

    pub const fn missing(field: &'static str) -> Self {
        Self::new(field, "must be provided")
    }
}

/// One or more request fields failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation failed for {}", fields_label(.0))]
pub struct ValidationError(pub Vec<FieldError>);

impl ValidationError {
    pub fn single(field: FieldError) -> Self {
        Self(vec![field])
    }

    pub fn details(&self) -> &[FieldError] {
        &self.0
    }

    pub fn into_details(self) -> Vec<FieldError> {
        self.0
    }

    /// Returns `Ok(())` when nothing was collected.
    pub fn check(errors: Vec<FieldError>) -> Result<(), Self> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self(errors))
        }
    }
}

fn fields_label(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|err| err.field)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Treats absent and whitespace-only strings as missing.
pub(crate) fn present(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .filter(|candidate| !candidate.trim().is_empty())
}
