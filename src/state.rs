//! Market state store
//!
//! A typed key/value store of market variables. Every mutation goes through
//! [`MarketStateStore::apply`], which validates the whole delta against the
//! registered schema before touching any value and enforces causal ordering
//! on the originating utterance's sequence number.

use crate::error::{Error, Result};
use crate::types::{SequenceNo, StateVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A market variable value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    /// Boolean flag
    Flag(bool),
    /// Whole number
    Integer(i64),
    /// Real number (rates, prices, indices)
    Number(f64),
    /// Free text
    Text(String),
}

impl StateValue {
    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Integer(i) => Some(*i as f64),
            StateValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Flag view of the value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Flag(b) => Some(*b),
            _ => None,
        }
    }

    /// Text view of the value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::Text(s) => Some(s),
            _ => None,
        }
    }

    fn kind(&self) -> ValueKind {
        match self {
            StateValue::Flag(_) => ValueKind::Flag,
            StateValue::Integer(_) => ValueKind::Integer,
            StateValue::Number(_) => ValueKind::Number,
            StateValue::Text(_) => ValueKind::Text,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Flag(b) => write!(f, "{}", b),
            StateValue::Integer(i) => write!(f, "{}", i),
            StateValue::Number(n) => write!(f, "{}", n),
            StateValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Number(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        StateValue::Integer(v)
    }
}

impl From<bool> for StateValue {
    fn from(v: bool) -> Self {
        StateValue::Flag(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::Text(v.to_string())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::Text(v)
    }
}

/// Proposed change to market state: key to new value
pub type StateDelta = BTreeMap<String, StateValue>;

/// Type of a registered state field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Real number; integers are widened
    Number,
    /// Whole number
    Integer,
    /// Boolean flag
    Flag,
    /// Free text
    Text,
}

/// Schema entry for one state key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Value type
    pub kind: ValueKind,
    /// Inclusive lower bound for numeric fields
    #[serde(default)]
    pub min: Option<f64>,
    /// Inclusive upper bound for numeric fields
    #[serde(default)]
    pub max: Option<f64>,
}

impl FieldSpec {
    /// Unbounded real number field
    pub fn number() -> Self {
        Self {
            kind: ValueKind::Number,
            min: None,
            max: None,
        }
    }

    /// Unbounded integer field
    pub fn integer() -> Self {
        Self {
            kind: ValueKind::Integer,
            min: None,
            max: None,
        }
    }

    /// Flag field
    pub fn flag() -> Self {
        Self {
            kind: ValueKind::Flag,
            min: None,
            max: None,
        }
    }

    /// Text field
    pub fn text() -> Self {
        Self {
            kind: ValueKind::Text,
            min: None,
            max: None,
        }
    }

    /// Set the inclusive lower bound
    pub fn with_min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    /// Set the inclusive upper bound
    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    /// Set both bounds
    pub fn with_range(self, min: f64, max: f64) -> Self {
        self.with_min(min).with_max(max)
    }

    /// Type- and range-check a value, normalizing integers for number fields
    pub fn check(&self, key: &str, value: &StateValue) -> Result<StateValue> {
        let normalized = match (self.kind, value) {
            (ValueKind::Number, StateValue::Integer(i)) => StateValue::Number(*i as f64),
            (kind, v) if kind == v.kind() => v.clone(),
            (kind, v) => {
                return Err(Error::validation(
                    key,
                    format!("expected {:?}, got {:?}", kind, v.kind()),
                ))
            }
        };

        if let Some(n) = normalized.as_f64() {
            if !n.is_finite() {
                return Err(Error::validation(key, "value is not finite"));
            }
            if let Some(min) = self.min {
                if n < min {
                    return Err(Error::validation(key, format!("{} is below minimum {}", n, min)));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return Err(Error::validation(key, format!("{} is above maximum {}", n, max)));
                }
            }
        }

        Ok(normalized)
    }
}

/// Registered set of state keys and their types
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSchema {
    fields: BTreeMap<String, FieldSpec>,
}

impl StateSchema {
    /// Create an empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a field
    pub fn field(mut self, key: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(key.into(), spec);
        self
    }

    /// Look up a field spec
    pub fn get(&self, key: &str) -> Option<&FieldSpec> {
        self.fields.get(key)
    }

    /// Whether the schema registers `key`
    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Registered keys in sorted order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Validate a full delta, returning normalized values. Nothing is applied.
    pub fn validate(&self, delta: &StateDelta) -> Result<StateDelta> {
        if delta.is_empty() {
            return Err(Error::validation("<delta>", "delta is empty"));
        }
        delta
            .iter()
            .map(|(key, value)| {
                let spec = self
                    .fields
                    .get(key)
                    .ok_or_else(|| Error::validation(key, "key is not in the registered schema"))?;
                Ok((key.clone(), spec.check(key, value)?))
            })
            .collect()
    }

    /// Market variables and bounds of the reference simulation, with their initial values
    pub fn market_defaults() -> (Self, StateDelta) {
        let schema = Self::new()
            .field("interest_rate", FieldSpec::number().with_range(0.001, 1.0))
            .field("inflation_rate", FieldSpec::number().with_min(0.0))
            .field("market_volatility", FieldSpec::number().with_min(0.01))
            .field("liquidity_factor", FieldSpec::number().with_range(0.5, 2.0))
            .field("market_sentiment", FieldSpec::number().with_range(-1.0, 1.0))
            .field("economic_growth", FieldSpec::number())
            .field("unemployment_rate", FieldSpec::number().with_range(0.01, 0.2))
            .field("trading_halted", FieldSpec::flag())
            .field("ipo_price", FieldSpec::number().with_min(0.0))
            .field("ipo_status", FieldSpec::text());

        let initial = [
            ("interest_rate", StateValue::Number(0.02)),
            ("inflation_rate", StateValue::Number(0.03)),
            ("market_volatility", StateValue::Number(0.15)),
            ("liquidity_factor", StateValue::Number(1.0)),
            ("market_sentiment", StateValue::Number(0.0)),
            ("economic_growth", StateValue::Number(0.02)),
            ("unemployment_rate", StateValue::Number(0.05)),
            ("trading_halted", StateValue::Flag(false)),
            ("ipo_price", StateValue::Number(0.0)),
            ("ipo_status", StateValue::Text("none".to_string())),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        (schema, initial)
    }
}

/// Point-in-time copy of the market state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Number of deltas applied when the snapshot was taken
    pub version: StateVersion,
    /// All values
    pub values: BTreeMap<String, StateValue>,
}

impl StateSnapshot {
    /// Look up a value
    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.values.get(key)
    }

    /// Numeric value of `key`, if present and numeric
    pub fn number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(StateValue::as_f64)
    }
}

/// Audit record of one applied delta
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedDelta {
    /// Version produced by this delta
    pub version: StateVersion,
    /// Sequence number of the proposing utterance
    pub origin_sequence_no: SequenceNo,
    /// Values written
    pub delta: StateDelta,
    /// Values replaced, keyed like `delta`
    pub previous: BTreeMap<String, StateValue>,
}

/// Versioned market state store
#[derive(Debug, Clone)]
pub struct MarketStateStore {
    schema: StateSchema,
    values: BTreeMap<String, StateValue>,
    version: StateVersion,
    last_origin: Option<SequenceNo>,
    history: Vec<AppliedDelta>,
}

impl MarketStateStore {
    /// Create a store from a schema and initial values. Initial values do not count as deltas.
    pub fn new(schema: StateSchema, initial: StateDelta) -> Result<Self> {
        let mut values = BTreeMap::new();
        for (key, value) in &initial {
            let spec = schema
                .get(key)
                .ok_or_else(|| Error::validation(key, "initial key is not in the registered schema"))?;
            values.insert(key.clone(), spec.check(key, value)?);
        }

        Ok(Self {
            schema,
            values,
            version: 0,
            last_origin: None,
            history: Vec::new(),
        })
    }

    /// Store seeded with [`StateSchema::market_defaults`]
    pub fn with_market_defaults() -> Result<Self> {
        let (schema, initial) = StateSchema::market_defaults();
        Self::new(schema, initial)
    }

    /// Read a value
    pub fn read(&self, key: &str) -> Result<&StateValue> {
        self.values
            .get(key)
            .ok_or_else(|| Error::StateKeyNotFound(key.to_string()))
    }

    /// Validate and apply a delta atomically, returning the new version.
    ///
    /// `origin_sequence_no` must be strictly greater than the origin of every
    /// previously applied delta. A rejected delta leaves the store untouched.
    pub fn apply(&mut self, delta: &StateDelta, origin_sequence_no: SequenceNo) -> Result<StateVersion> {
        if let Some(last_applied) = self.last_origin {
            if origin_sequence_no <= last_applied {
                return Err(Error::Conflict {
                    origin: origin_sequence_no,
                    last_applied,
                });
            }
        }

        let normalized = self.schema.validate(delta)?;

        let previous = normalized
            .iter()
            .filter_map(|(key, value)| {
                self.values
                    .insert(key.clone(), value.clone())
                    .map(|old| (key.clone(), old))
            })
            .collect();

        self.version += 1;
        self.last_origin = Some(origin_sequence_no);
        self.history.push(AppliedDelta {
            version: self.version,
            origin_sequence_no,
            delta: normalized,
            previous,
        });

        Ok(self.version)
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            version: self.version,
            values: self.values.clone(),
        }
    }

    /// Current version
    pub fn version(&self) -> StateVersion {
        self.version
    }

    /// Registered schema
    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    /// Applied deltas in application order
    pub fn history(&self) -> &[AppliedDelta] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rate_store() -> MarketStateStore {
        let schema = StateSchema::new()
            .field("rate", FieldSpec::number().with_range(0.0, 1.0))
            .field("halted", FieldSpec::flag());
        let initial = [("rate".to_string(), StateValue::Number(0.02))].into_iter().collect();
        MarketStateStore::new(schema, initial).unwrap()
    }

    fn delta(pairs: &[(&str, StateValue)]) -> StateDelta {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_apply_increments_version() {
        let mut store = rate_store();
        assert_eq!(store.version(), 0);

        let v = store.apply(&delta(&[("rate", 0.05.into())]), 3).unwrap();
        assert_eq!(v, 1);
        assert_eq!(store.read("rate").unwrap(), &StateValue::Number(0.05));

        let v = store.apply(&delta(&[("halted", true.into())]), 7).unwrap();
        assert_eq!(v, 2);
        assert_eq!(store.history().len(), 2);
        assert_eq!(store.history()[0].previous.get("rate"), Some(&StateValue::Number(0.02)));
    }

    #[test]
    fn test_stale_origin_is_conflict() {
        let mut store = rate_store();
        store.apply(&delta(&[("rate", 0.05.into())]), 5).unwrap();

        let err = store.apply(&delta(&[("rate", 0.04.into())]), 5).unwrap_err();
        assert!(matches!(err, Error::Conflict { origin: 5, last_applied: 5 }));

        let err = store.apply(&delta(&[("rate", 0.04.into())]), 2).unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_invalid_delta_is_rejected_in_full() {
        let mut store = rate_store();
        let bad = delta(&[("rate", 0.5.into()), ("unknown", 1.0.into())]);
        let err = store.apply(&bad, 1).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(store.read("rate").unwrap(), &StateValue::Number(0.02));
        assert_eq!(store.version(), 0);

        let wrong_type = delta(&[("halted", "yes".into())]);
        assert!(store.apply(&wrong_type, 2).is_err());

        let out_of_range = delta(&[("rate", 1.5.into())]);
        assert!(store.apply(&out_of_range, 3).is_err());

        let nan = delta(&[("rate", f64::NAN.into())]);
        assert!(store.apply(&nan, 4).is_err());

        // rejected deltas do not advance the causal watermark
        assert_eq!(store.apply(&delta(&[("rate", 0.03.into())]), 1).unwrap(), 1);
    }

    #[test]
    fn test_integer_widens_to_number() {
        let mut store = rate_store();
        store.apply(&delta(&[("rate", StateValue::Integer(1))]), 1).unwrap();
        assert_eq!(store.read("rate").unwrap(), &StateValue::Number(1.0));
    }

    #[test]
    fn test_read_missing_key() {
        let store = rate_store();
        assert!(matches!(store.read("halted"), Err(Error::StateKeyNotFound(_))));
    }

    #[test]
    fn test_market_defaults_are_valid() {
        let store = MarketStateStore::with_market_defaults().unwrap();
        assert_eq!(store.snapshot().number("interest_rate"), Some(0.02));
        assert_eq!(store.read("ipo_status").unwrap().as_str(), Some("none"));
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_initial_values_are_checked() {
        let schema = StateSchema::new().field("rate", FieldSpec::number().with_max(1.0));
        let initial = [("rate".to_string(), StateValue::Number(3.0))].into_iter().collect();
        assert!(MarketStateStore::new(schema, initial).is_err());
    }

    proptest! {
        #[test]
        fn prop_version_counts_applied_deltas(origins in proptest::collection::vec(1u64..50, 1..40)) {
            let mut store = rate_store();
            let mut applied = 0u64;
            let mut watermark = 0u64;
            for origin in origins {
                let result = store.apply(&delta(&[("rate", 0.1.into())]), origin);
                if origin > watermark {
                    prop_assert!(result.is_ok());
                    applied += 1;
                    watermark = origin;
                } else {
                    prop_assert!(result.is_err());
                }
            }
            prop_assert_eq!(store.version(), applied);
            let origins: Vec<_> = store.history().iter().map(|h| h.origin_sequence_no).collect();
            prop_assert!(origins.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
