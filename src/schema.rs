//! Schema validator interface.
//!
//! The engine delegates all validation to a [`Schema`]: once per
//! `context_for` call for the subject, and once per matcher invocation for
//! bound arguments when the matcher declares an argument schema.

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::types::Issue;

/// Outcome of a validation.
///
/// `Ok(Some(v))` carries the validated (possibly transformed) value.
/// `Ok(None)` means the validator reported success without producing a value;
/// callers treat it as a failure.
pub type Validation = std::result::Result<Option<Value>, Vec<Issue>>;

/// Schema validator interface.
#[async_trait]
pub trait Schema: Send + Sync {
    /// Validate a value.
    async fn validate(&self, value: &Value) -> Validation;
}

/// Schema that accepts every value unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnySchema;

#[async_trait]
impl Schema for AnySchema {
    async fn validate(&self, value: &Value) -> Validation {
        Ok(Some(value.clone()))
    }
}

/// Schema backed by a synchronous closure.
pub struct FnSchema<F> {
    check: F,
}

impl<F> FnSchema<F>
where
    F: Fn(&Value) -> Validation + Send + Sync,
{
    /// Create a schema from a closure
    pub fn new(check: F) -> Self {
        Self { check }
    }
}

#[async_trait]
impl<F> Schema for FnSchema<F>
where
    F: Fn(&Value) -> Validation + Send + Sync,
{
    async fn validate(&self, value: &Value) -> Validation {
        (self.check)(value)
    }
}

/// Schema that validates by deserializing into `T`.
///
/// The validated value is `T` serialized back to JSON, so unknown fields are
/// dropped and serde defaults are applied.
pub struct TypedSchema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedSchema<T> {
    /// Create a new typed schema
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> Schema for TypedSchema<T>
where
    T: DeserializeOwned + Serialize + 'static,
{
    async fn validate(&self, value: &Value) -> Validation {
        let typed: T =
            serde_json::from_value(value.clone()).map_err(|e| vec![Issue::new(e.to_string())])?;
        serde_json::to_value(&typed)
            .map(Some)
            .map_err(|e| vec![Issue::new(e.to_string())])
    }
}
