//! Tri-state outcome channel
//!
//! Internal operations report through [`Outcome`] instead of nesting
//! `Result<Option<T>, E>`: a value, a successful "nothing found/changed", or a
//! classified failure. `Empty` and `Failure` must never be collapsed: a missing
//! user and an unreachable store are different answers.

use crate::error::ErrorRecord;

#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum Outcome<T> {
    /// Operation completed with a value
    Value(T),
    /// Operation completed, nothing found or changed
    Empty,
    /// Operation failed
    Failure(ErrorRecord),
}

impl<T> Outcome<T> {
    /// Successful outcome; `None` becomes [`Outcome::Empty`]
    pub fn success(value: Option<T>) -> Self {
        match value {
            Some(value) => Self::Value(value),
            None => Self::Empty,
        }
    }

    pub fn failure(record: ErrorRecord) -> Self {
        Self::Failure(record)
    }

    /// Lift a plain result, treating `Ok` as a value
    pub fn from_result(result: Result<T, ErrorRecord>) -> Self {
        match result {
            Ok(value) => Self::Value(value),
            Err(record) => Self::Failure(record),
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn as_failure(&self) -> Option<&ErrorRecord> {
        match self {
            Self::Failure(record) => Some(record),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Value(value) => Outcome::Value(f(value)),
            Self::Empty => Outcome::Empty,
            Self::Failure(record) => Outcome::Failure(record),
        }
    }

    pub fn and_then<U>(self, f: impl FnOnce(T) -> Outcome<U>) -> Outcome<U> {
        match self {
            Self::Value(value) => f(value),
            Self::Empty => Outcome::Empty,
            Self::Failure(record) => Outcome::Failure(record),
        }
    }

    /// Discard the failure distinction; only for callers that already handled it
    pub fn value(self) -> Option<T> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<Option<T>, ErrorRecord> {
        match self {
            Self::Value(value) => Ok(Some(value)),
            Self::Empty => Ok(None),
            Self::Failure(record) => Err(record),
        }
    }

    /// Require a value, turning `Empty` into the failure built by `on_empty`
    pub fn require(self, on_empty: impl FnOnce() -> ErrorRecord) -> Result<T, ErrorRecord> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Empty => Err(on_empty()),
            Self::Failure(record) => Err(record),
        }
    }
}

impl<T> From<Option<T>> for Outcome<T> {
    fn from(value: Option<T>) -> Self {
        Self::success(value)
    }
}

impl<T> From<Result<Option<T>, ErrorRecord>> for Outcome<T> {
    fn from(result: Result<Option<T>, ErrorRecord>) -> Self {
        match result {
            Ok(value) => Self::success(value),
            Err(record) => Self::Failure(record),
        }
    }
}
