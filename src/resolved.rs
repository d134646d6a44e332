//! The value / empty / error container used for every fallible lookup.
//!
//! Lookups in a tree built from untrusted bytes have three distinct outcomes:
//! they find something, they legitimately find nothing (no such ancestor, a
//! null pointer, a search miss), or they fail. [`Resolved`] keeps the three
//! apart so callers never have to guess which one a `None` meant.

use std::sync::Arc;

use crate::error::{Error, Result};

/// Outcome of a lookup: a value, nothing, or a failure.
#[derive(Debug, Clone)]
pub enum Resolved<T> {
    /// The lookup produced a value.
    Value(T),
    /// The lookup completed and there is nothing to return.
    Empty,
    /// The lookup failed.
    Error(Arc<Error>),
}

impl<T> Resolved<T> {
    /// Wraps an error.
    pub fn error(error: Error) -> Self {
        Resolved::Error(Arc::new(error))
    }

    /// Converts a fallible optional lookup.
    pub fn from_optional(result: Result<Option<T>>) -> Self {
        match result {
            Ok(Some(value)) => Resolved::Value(value),
            Ok(None) => Resolved::Empty,
            Err(error) => Resolved::error(error),
        }
    }

    /// Returns true if this holds a value.
    #[inline]
    pub fn is_value(&self) -> bool {
        matches!(self, Resolved::Value(_))
    }

    /// Returns true if this is the empty outcome.
    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, Resolved::Empty)
    }

    /// Returns true if this holds an error.
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Resolved::Error(_))
    }

    /// Returns the value, if any.
    pub fn value(&self) -> Option<&T> {
        match self {
            Resolved::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the error, if any.
    pub fn error_ref(&self) -> Option<&Arc<Error>> {
        match self {
            Resolved::Error(error) => Some(error),
            _ => None,
        }
    }

    /// Consumes this and returns the value, if any.
    pub fn into_value(self) -> Option<T> {
        match self {
            Resolved::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Borrows the contents.
    pub fn as_ref(&self) -> Resolved<&T> {
        match self {
            Resolved::Value(value) => Resolved::Value(value),
            Resolved::Empty => Resolved::Empty,
            Resolved::Error(error) => Resolved::Error(Arc::clone(error)),
        }
    }

    /// Maps the value, leaving empty and error outcomes untouched.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolved<U> {
        match self {
            Resolved::Value(value) => Resolved::Value(f(value)),
            Resolved::Empty => Resolved::Empty,
            Resolved::Error(error) => Resolved::Error(error),
        }
    }

    /// Chains another lookup onto the value.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Resolved<U>) -> Resolved<U> {
        match self {
            Resolved::Value(value) => f(value),
            Resolved::Empty => Resolved::Empty,
            Resolved::Error(error) => Resolved::Error(error),
        }
    }

    /// Converts into a `Result<Option<T>>`, sharing the error through its `Arc`.
    pub fn into_result(self) -> std::result::Result<Option<T>, Arc<Error>> {
        match self {
            Resolved::Value(value) => Ok(Some(value)),
            Resolved::Empty => Ok(None),
            Resolved::Error(error) => Err(error),
        }
    }
}

impl<T> From<Result<T>> for Resolved<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Resolved::Value(value),
            Err(error) => Resolved::error(error),
        }
    }
}

impl<T> From<Option<T>> for Resolved<T> {
    fn from(option: Option<T>) -> Self {
        match option {
            Some(value) => Resolved::Value(value),
            None => Resolved::Empty,
        }
    }
}

/// Two outcomes are equal if their values are equal, both are empty, or both
/// share the same error instance.
impl<T: PartialEq> PartialEq for Resolved<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Resolved::Value(a), Resolved::Value(b)) => a == b,
            (Resolved::Empty, Resolved::Empty) => true,
            (Resolved::Error(a), Resolved::Error(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
