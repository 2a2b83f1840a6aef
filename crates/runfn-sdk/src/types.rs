// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request/response objects, lenient accessors and wire constants.

use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::FunctionError;

/// Inbound header carrying the activity id.
pub const ACTIVITY_ID_HEADER: &str = "X-Activity-ID";
/// Inbound header carrying the environment id.
pub const ENVIRONMENT_ID_HEADER: &str = "X-Environment-ID";
/// Inbound header carrying the environment name.
pub const ENVIRONMENT_NAME_HEADER: &str = "X-Environment-Name";
/// Inbound header with the token for the log collector.
pub const WORKFLOW_TOKEN_HEADER: &str = "X-Workflow-Token";
/// Inbound header with the engine (log collector) base URL.
pub const ENGINE_ENDPOINT_HEADER: &str = "X-Engine-Endpoint";
/// Inbound header with the activity log upload path, appended to the engine endpoint.
pub const ACTIVITY_FILE_UPLOAD_HEADER: &str = "X-Activity-File-Upload";
/// Inbound header with the state-store base URL.
pub const STATE_STORE_URL_HEADER: &str = "X-State-Store-Url";
/// Inbound header with the state-store token.
pub const STATE_STORE_TOKEN_HEADER: &str = "X-State-Store-Token";
/// Inbound header with the organization id.
pub const ORGANIZATION_ID_HEADER: &str = "X-Organization-ID";
/// Inbound header with the project id.
pub const PROJECT_ID_HEADER: &str = "X-Project-ID";

/// Reserved request key populated by the server.
pub const METADATA_KEY: &str = "metadata";
pub const META_ACTIVITY_ID: &str = "activityID";
pub const META_ENVIRONMENT_ID: &str = "environmentID";
pub const META_ENVIRONMENT_NAME: &str = "environmentName";
pub const META_STATE_STORE_URL: &str = "stateStoreUrl";
pub const META_STATE_STORE_TOKEN: &str = "stateStoreToken";
pub const META_ORGANIZATION_ID: &str = "organizationID";
pub const META_PROJECT_ID: &str = "projectID";

/// Errors from [`Object`] accessors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectError {
    #[error("no keys provided")]
    NoKeys,

    #[error("key {0} not found")]
    KeyNotFound(String),

    #[error("unable to cast value of key {key} to {expected}")]
    Cast { key: String, expected: &'static str },
}

impl From<ObjectError> for FunctionError {
    fn from(err: ObjectError) -> Self {
        FunctionError::failed(err.to_string())
    }
}

/// A JSON object with lenient, path-based accessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Object(Map<String, Value>);

/// Invocation input.
pub type Request = Object;
/// Invocation output.
pub type Response = Object;

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }

    /// Insert a value, returning `self` for chaining.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// The server-populated `metadata` object, if present.
    pub fn metadata(&self) -> Option<&Map<String, Value>> {
        self.0.get(METADATA_KEY).and_then(Value::as_object)
    }

    /// A string field of `metadata`; empty strings count as absent.
    pub fn meta_str(&self, name: &str) -> Option<&str> {
        self.metadata()
            .and_then(|meta| meta.get(name))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Value at `keys`, stringified when it is a scalar.
    pub fn get_string(&self, keys: &[&str]) -> Result<String, ObjectError> {
        let (key, value) = self.resolve(keys)?;
        match value {
            Value::String(s) => Ok(s),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Null => Ok(String::new()),
            _ => Err(cast_error(key, "string")),
        }
    }

    /// Value at `keys` as an integer; floats truncate, numeric strings parse.
    pub fn get_i64(&self, keys: &[&str]) -> Result<i64, ObjectError> {
        let (key, value) = self.resolve(keys)?;
        match &value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| cast_error(key, "integer")),
            Value::String(s) => parse_int(s).ok_or_else(|| cast_error(key, "integer")),
            Value::Bool(b) => Ok(i64::from(*b)),
            Value::Null => Ok(0),
            _ => Err(cast_error(key, "integer")),
        }
    }

    /// Value at `keys` as a float.
    pub fn get_f64(&self, keys: &[&str]) -> Result<f64, ObjectError> {
        let (key, value) = self.resolve(keys)?;
        match &value {
            Value::Number(n) => n.as_f64().ok_or_else(|| cast_error(key, "float")),
            Value::String(s) => s.trim().parse().map_err(|_| cast_error(key, "float")),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Null => Ok(0.0),
            _ => Err(cast_error(key, "float")),
        }
    }

    /// Value at `keys` as a bool; strings accept `1/0`, `t/f` and `true/false`.
    pub fn get_bool(&self, keys: &[&str]) -> Result<bool, ObjectError> {
        let (key, value) = self.resolve(keys)?;
        match &value {
            Value::Bool(b) => Ok(*b),
            Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
            Value::String(s) => parse_bool(s).ok_or_else(|| cast_error(key, "bool")),
            Value::Null => Ok(false),
            _ => Err(cast_error(key, "bool")),
        }
    }

    /// Value at `keys` as an array.
    pub fn get_array(&self, keys: &[&str]) -> Result<Vec<Value>, ObjectError> {
        let (key, value) = self.resolve(keys)?;
        match value {
            Value::Array(items) => Ok(items),
            _ => Err(cast_error(key, "array")),
        }
    }

    /// Value at `keys` as a nested object; JSON-encoded strings are decoded.
    pub fn get_object(&self, keys: &[&str]) -> Result<Object, ObjectError> {
        let (key, value) = self.resolve(keys)?;
        to_object(key, &value)
    }

    fn resolve<'k>(&self, keys: &[&'k str]) -> Result<(&'k str, Value), ObjectError> {
        let (first, rest) = keys.split_first().ok_or(ObjectError::NoKeys)?;
        let value = self
            .0
            .get(*first)
            .ok_or_else(|| ObjectError::KeyNotFound(first.to_string()))?;
        if rest.is_empty() {
            return Ok((*first, value.clone()));
        }
        to_object(first, value)?.resolve(rest)
    }
}

fn cast_error(key: &str, expected: &'static str) -> ObjectError {
    ObjectError::Cast {
        key: key.to_string(),
        expected,
    }
}

fn to_object(key: &str, value: &Value) -> Result<Object, ObjectError> {
    match value {
        Value::Object(map) => Ok(Object(map.clone())),
        Value::String(s) => serde_json::from_str(s).map_err(|_| cast_error(key, "object")),
        _ => Err(cast_error(key, "object")),
    }
}

fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    s.parse::<i64>().ok().or_else(|| {
        // "12.0" style values
        s.parse::<f64>()
            .ok()
            .filter(|f| f.fract() == 0.0)
            .map(|f| f as i64)
    })
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

impl Deref for Object {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Object {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Map<String, Value>> for Object {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Self {
        Value::Object(object.0)
    }
}

impl TryFrom<Value> for Object {
    type Error = Value;

    /// Only JSON objects convert; anything else is handed back.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(other),
        }
    }
}
