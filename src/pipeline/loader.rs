//! Declarative pipeline descriptions.
//!
//! Accepted shape:
//!
//! ```json
//! { "stages": [ { "type": "grayscale" },
//!               { "type": "background", "mode": "running", "alpha": 0.05 },
//!               { "type": "threshold", "mode": "adaptiveMean", "blockSize": 15, "C": 5 },
//!               { "type": "morphology", "op": "open", "size": 3 } ] }
//! ```
//!
//! Only flat stage objects with scalar values are meaningful. Loading is
//! best-effort: a bad descriptor (not an object, no `type`, not even valid
//! JSON) or an unknown type is logged and skipped, non-scalar parameter values
//! are ignored, and the remaining stages still load. When the document does
//! not parse as a whole, the stage array is cut into entries by a scanner that
//! tracks quotes and bracket depth, and each entry is parsed on its own. Only
//! a document with no recognisable stage array is an error.

use std::path::Path;

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};

use crate::error::KernelError;

use super::engine::PipelineEngine;
use super::registry::StageRegistry;
use super::stage::{ParamValue, Stage, StageParams};

/// One parsed stage entry.
#[derive(Clone, Debug, PartialEq)]
pub struct StageDescriptor {
    pub type_name: String,
    pub params: StageParams,
}

pub struct PipelineConfigLoader {
    registry: StageRegistry,
}

impl PipelineConfigLoader {
    pub fn new() -> Self {
        Self::with_registry(StageRegistry::builtin())
    }

    pub fn with_registry(registry: StageRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Parse the stage list. Fails only when the document itself is unusable.
    pub fn parse_descriptors(&self, text: &str) -> Result<Vec<StageDescriptor>> {
        let entries: Vec<Result<Value>> = match serde_json::from_str::<Value>(text) {
            Ok(root) => {
                let Value::Object(root) = root else {
                    return Err(KernelError::PipelineConfigParse(
                        "top level must be an object".to_string(),
                    )
                    .into());
                };
                let entries = stage_array(&root).ok_or_else(|| {
                    KernelError::PipelineConfigParse("no stage array found".to_string())
                })?;
                entries.iter().cloned().map(Ok).collect()
            }
            Err(err) => {
                let slices = split_stage_entries(text)
                    .ok_or_else(|| KernelError::PipelineConfigParse(err.to_string()))?;
                log::warn!(
                    "pipeline config is not valid JSON ({}); parsing stage entries one by one",
                    err
                );
                slices
                    .into_iter()
                    .map(|slice| {
                        serde_json::from_str::<Value>(slice).map_err(|e| {
                            anyhow::Error::from(KernelError::PipelineConfigParse(format!(
                                "'{}': {}",
                                slice, e
                            )))
                        })
                    })
                    .collect()
            }
        };

        let mut descriptors = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            match entry.and_then(|value| parse_descriptor(&value)) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(err) => log::warn!("pipeline config: skipping stage #{}: {}", index, err),
            }
        }
        Ok(descriptors)
    }

    /// Instantiate descriptors, skipping unknown types.
    pub fn build_stages(&self, descriptors: &[StageDescriptor]) -> Vec<Box<dyn Stage>> {
        descriptors
            .iter()
            .filter_map(
                |descriptor| match self.registry.build(&descriptor.type_name, &descriptor.params) {
                    Ok(stage) => Some(stage),
                    Err(err) => {
                        log::warn!("pipeline config: {}; stage omitted", err);
                        None
                    }
                },
            )
            .collect()
    }

    pub fn load_str(&self, text: &str) -> Result<PipelineEngine> {
        let descriptors = self.parse_descriptors(text)?;
        let stages = self.build_stages(&descriptors);
        if stages.is_empty() {
            log::warn!("pipeline config produced no stages; frames will carry no mask");
        }
        let engine = PipelineEngine::new(stages);
        log::info!("pipeline loaded: {}", engine.stage_names().join(" -> "));
        Ok(engine)
    }

    pub fn load_file(&self, path: &Path) -> Result<PipelineEngine> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read pipeline config {}: {}", path.display(), e))?;
        self.load_str(&text)
    }
}

impl Default for PipelineConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// `stages` when present, otherwise the first array-valued field.
fn stage_array(root: &Map<String, Value>) -> Option<&Vec<Value>> {
    root.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("stages"))
        .and_then(|(_, value)| value.as_array())
        .or_else(|| root.values().find_map(Value::as_array))
}

// ---------------------------------------------------------------------------
// Recovery scanner for documents serde_json rejects
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
enum Token {
    Open(u8),
    Close,
    Comma,
    /// Byte range of a string's contents, quotes excluded.
    Str(usize, usize),
}

/// Structural tokens of a JSON-like text, skipping over string contents.
/// Stops at an unterminated string.
struct Tokens<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn new(text: &'a str, pos: usize) -> Self {
        Self {
            bytes: text.as_bytes(),
            pos,
        }
    }
}

impl Iterator for Tokens<'_> {
    type Item = (usize, Token);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(&byte) = self.bytes.get(self.pos) {
            let at = self.pos;
            self.pos += 1;
            match byte {
                b'"' => {
                    let mut escaped = false;
                    while let Some(&c) = self.bytes.get(self.pos) {
                        self.pos += 1;
                        if escaped {
                            escaped = false;
                        } else if c == b'\\' {
                            escaped = true;
                        } else if c == b'"' {
                            return Some((at, Token::Str(at + 1, self.pos - 1)));
                        }
                    }
                    return None;
                }
                b'{' | b'[' => return Some((at, Token::Open(byte))),
                b'}' | b']' => return Some((at, Token::Close)),
                b',' => return Some((at, Token::Comma)),
                _ => {}
            }
        }
        None
    }
}

/// Raw text of each stage entry: the root-level `stages` array when present,
/// otherwise the first root-level array. `None` when the text is not an
/// object or the array is never closed.
fn split_stage_entries(text: &str) -> Option<Vec<&str>> {
    if !text.trim_start().starts_with('{') {
        return None;
    }
    let mut depth = 0usize;
    let mut key: Option<&str> = None;
    let mut first_array = None;
    let mut stages = None;
    for (at, token) in Tokens::new(text, 0) {
        match token {
            Token::Open(kind) => {
                if depth == 1 && kind == b'[' {
                    if key.is_some_and(|k| k.eq_ignore_ascii_case("stages")) {
                        stages = Some(at);
                        break;
                    }
                    first_array.get_or_insert(at);
                }
                depth += 1;
            }
            Token::Close => depth = depth.saturating_sub(1),
            Token::Comma => key = None,
            Token::Str(start, end) if depth == 1 => key = Some(&text[start..end]),
            Token::Str(..) => {}
        }
    }
    split_array(text, stages.or(first_array)?)
}

/// Entries of the array whose `[` sits at byte `open`, split at depth-0 commas.
fn split_array(text: &str, open: usize) -> Option<Vec<&str>> {
    let mut entries = Vec::new();
    let mut depth = 0usize;
    let mut start = open + 1;
    for (at, token) in Tokens::new(text, open + 1) {
        match token {
            Token::Open(_) => depth += 1,
            Token::Close if depth == 0 => {
                push_entry(&mut entries, &text[start..at]);
                return Some(entries);
            }
            Token::Close => depth -= 1,
            Token::Comma if depth == 0 => {
                push_entry(&mut entries, &text[start..at]);
                start = at + 1;
            }
            Token::Comma | Token::Str(..) => {}
        }
    }
    None
}

fn push_entry<'a>(entries: &mut Vec<&'a str>, raw: &'a str) {
    let entry = raw.trim();
    if !entry.is_empty() {
        entries.push(entry);
    }
}

fn parse_descriptor(entry: &Value) -> Result<StageDescriptor> {
    let object = entry
        .as_object()
        .ok_or_else(|| KernelError::PipelineConfigParse("descriptor is not an object".into()))?;

    let mut type_name = None;
    let mut params = StageParams::new();
    for (key, value) in object {
        if key.eq_ignore_ascii_case("type") {
            type_name = value.as_str().map(|s| s.trim().to_string());
            continue;
        }
        match scalar(value) {
            Some(param) => params.insert(key, param),
            None => log::warn!("pipeline config: ignoring non-scalar parameter '{}'", key),
        }
    }

    let type_name = type_name
        .filter(|t| !t.is_empty())
        .ok_or_else(|| KernelError::PipelineConfigParse("descriptor has no string 'type'".into()))?;
    Ok(StageDescriptor { type_name, params })
}

/// Numbers written with a fractional part or exponent become floats.
fn scalar(value: &Value) -> Option<ParamValue> {
    match value {
        Value::String(s) => Some(ParamValue::Str(s.clone())),
        Value::Bool(b) => Some(ParamValue::Bool(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(ParamValue::Int(i))
            } else if let Some(u) = n.as_u64() {
                Some(ParamValue::Int(i64::try_from(u).unwrap_or(i64::MAX)))
            } else {
                n.as_f64().map(ParamValue::Float)
            }
        }
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
