//! Positional request parameters.
//!
//! Clients usually send params as an array. [`Params`] decodes that array once
//! into dynamic values; out of range lookups yield an empty [`Param`] whose
//! accessors return zero values.
//!
//! The dynamic values are JSON values: MessagePack `bin` data and maps keyed
//! by anything but strings cannot be represented and must be bound to a typed
//! struct with `Context::bind` instead.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::HandlerError;

/// Decoded positional params of one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    values: Vec<Value>,
}

impl Params {
    /// Wraps a decoded payload. An array becomes the positional list, `null`
    /// an empty list, and any other value a single param.
    pub fn from_value(value: Value) -> Self {
        let values = match value {
            Value::Array(values) => values,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        Self { values }
    }

    /// Param at `index`, or an empty one past the end.
    pub fn get(&self, index: usize) -> Param<'_> {
        Param {
            value: self.values.get(index),
        }
    }

    /// Number of params.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true when no params were sent.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over the params.
    pub fn iter(&self) -> impl Iterator<Item = Param<'_>> {
        self.values.iter().map(|v| Param { value: Some(v) })
    }
}

/// One positional param.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Param<'a> {
    value: Option<&'a Value>,
}

impl<'a> Param<'a> {
    /// Returns true when the param exists.
    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    /// The raw dynamic value.
    pub fn value(&self) -> Option<&'a Value> {
        self.value
    }

    pub fn get_bool(&self) -> bool {
        self.value.and_then(Value::as_bool).unwrap_or_default()
    }

    pub fn get_i64(&self) -> i64 {
        self.value.and_then(Value::as_i64).unwrap_or_default()
    }

    pub fn get_u64(&self) -> u64 {
        self.value.and_then(Value::as_u64).unwrap_or_default()
    }

    pub fn get_f64(&self) -> f64 {
        self.value.and_then(Value::as_f64).unwrap_or_default()
    }

    pub fn get_str(&self) -> &'a str {
        self.value.and_then(Value::as_str).unwrap_or_default()
    }

    pub fn get_string(&self) -> String {
        self.get_str().to_string()
    }

    /// Elements that are strings; other elements are skipped.
    pub fn get_string_slice(&self) -> Vec<String> {
        self.value
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_map(&self) -> Map<String, Value> {
        self.value
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    /// An integer read as nanoseconds.
    pub fn get_duration(&self) -> Duration {
        Duration::from_nanos(self.get_u64())
    }

    /// Decodes this param into `T`.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        let value = self.value.cloned().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|e| HandlerError::new(mego_protocol::Status::Invalid, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn positional_access() {
        let params = Params::from_value(json!([3, "Room1", true, 1.5, ["a", 2, "b"]]));
        assert_eq!(params.len(), 5);
        assert_eq!(params.get(0).get_i64(), 3);
        assert_eq!(params.get(1).get_str(), "Room1");
        assert!(params.get(2).get_bool());
        assert_eq!(params.get(3).get_f64(), 1.5);
        assert_eq!(params.get(4).get_string_slice(), vec!["a", "b"]);
    }

    #[test]
    fn out_of_range_yields_zero_values() {
        let params = Params::from_value(json!([1]));
        let missing = params.get(7);
        assert!(!missing.is_present());
        assert_eq!(missing.get_i64(), 0);
        assert_eq!(missing.get_str(), "");
        assert!(!missing.get_bool());
        assert!(missing.get_map().is_empty());
        assert_eq!(missing.get_duration(), Duration::ZERO);
    }

    #[test]
    fn type_mismatch_yields_zero_value() {
        let params = Params::from_value(json!(["seven"]));
        assert_eq!(params.get(0).get_i64(), 0);
    }

    #[test]
    fn scalar_and_null_payloads() {
        assert!(Params::from_value(Value::Null).is_empty());
        let single = Params::from_value(json!({"user": "yami"}));
        assert_eq!(single.len(), 1);
        assert_eq!(single.get(0).get_map()["user"], "yami");
    }

    #[test]
    fn bind_one_param() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Point {
            x: i32,
            y: i32,
        }

        let params = Params::from_value(json!([{"x": 1, "y": 2}, "oops"]));
        assert_eq!(params.get(0).bind::<Point>().unwrap(), Point { x: 1, y: 2 });
        assert!(params.get(1).bind::<Point>().is_err());
    }
}
