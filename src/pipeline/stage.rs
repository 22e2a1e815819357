use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;

use super::context::PipelineContext;
use crate::pool::BufferPool;

/// One step of the segmentation pipeline.
///
/// A stage's configuration is fixed at construction. `apply` is a function of
/// the context it receives: it may read `input` and any optional field, write
/// optional fields, and borrow scratch buffers from `pool`. It must not touch
/// state outside the context, and must not assume a particular upstream stage
/// ran; fields it needs are derived lazily (see `PipelineContext::ensure_gray`).
pub trait Stage: Send {
    /// Stage identifier used in logs and fault reports.
    fn name(&self) -> &'static str;

    /// Transform the context in place.
    fn apply(&self, ctx: &mut PipelineContext<'_>, pool: &mut BufferPool) -> Result<()>;
}

/// Scalar parameter value from a stage descriptor.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Str(s) => write!(f, "\"{}\"", s),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Parameters of one stage descriptor.
///
/// Keys are matched case-insensitively and ignore `_` / `-`, so `blockSize`,
/// `block_size` and `BLOCK-SIZE` are the same key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StageParams {
    values: BTreeMap<String, ParamValue>,
}

impl StageParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: ParamValue) {
        self.values.insert(normalize_key(key), value);
    }

    pub fn with(mut self, key: &str, value: ParamValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(&normalize_key(key))
    }

    /// Numeric value; integers widen to float.
    pub fn f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Str(s) => s.trim().parse().ok(),
            ParamValue::Bool(_) => None,
        }
    }

    /// Integer value; floats are accepted only when integral.
    pub fn i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            ParamValue::Int(i) => Some(*i),
            ParamValue::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            ParamValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            ParamValue::Bool(b) => Some(*b),
            ParamValue::Int(i) => Some(*i != 0),
            ParamValue::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(true),
                "false" | "no" | "off" | "0" => Some(false),
                _ => None,
            },
            ParamValue::Float(_) => None,
        }
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            ParamValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Log every key the stage does not recognise. Unknown keys are ignored.
    pub fn warn_unrecognized(&self, stage: &str, recognized: &[&str]) {
        let known: Vec<String> = recognized.iter().map(|k| normalize_key(k)).collect();
        for key in self.values.keys() {
            if !known.iter().any(|k| k == key) {
                log::warn!("stage {}: ignoring unrecognized parameter '{}'", stage, key);
            }
        }
    }
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}
