//! Stamping: substitute `$(expression)$` tags in a template body.

use std::sync::OnceLock;

use carto_core::{TemplateParam, Workload};
use regex::Regex;
use serde_json::{Map, Value};

use crate::evaluator::{EvalError, Evaluator};
use crate::model::Inputs;

#[derive(Debug, thiserror::Error)]
pub enum StampError {
    #[error("unable to resolve tag [$({tag})$]: {source}")]
    Tag {
        tag: String,
        #[source]
        source: EvalError,
    },
    #[error("stamped object is invalid: {0}")]
    InvalidObject(String),
    #[error("serializing stamping context: {0}")]
    Context(#[from] serde_json::Error),
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\((.*?)\)\$").expect("static tag regex"))
}

/// Builder for the document that tags are evaluated against.
#[derive(Debug, Clone, Default)]
pub struct StampContext {
    workload: Value,
    params: Map<String, Value>,
    inputs: Option<Inputs>,
}

impl StampContext {
    pub fn new(workload: &Workload) -> Result<Self, StampError> {
        Ok(Self { workload: serde_json::to_value(workload)?, ..Default::default() })
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_inputs(mut self, inputs: Option<&Inputs>) -> Self {
        self.inputs = inputs.cloned();
        self
    }

    pub fn into_value(self) -> Value {
        let mut root = Map::new();
        root.insert("workload".into(), self.workload);
        root.insert("params".into(), Value::Object(self.params));
        if let Some(inputs) = self.inputs {
            inputs.extend_context(&mut root);
        }
        Value::Object(root)
    }
}

/// Merge parameter layers; later layers win on key collision.
pub fn merge_params<'a>(
    defaults: &[TemplateParam],
    layers: impl IntoIterator<Item = &'a [carto_core::Param]>,
) -> Map<String, Value> {
    let mut out = Map::new();
    for p in defaults {
        out.insert(p.name.clone(), p.default_value.clone());
    }
    for layer in layers {
        for p in layer {
            out.insert(p.name.clone(), p.value.clone());
        }
    }
    out
}

pub struct Stamper<'a> {
    evaluator: &'a dyn Evaluator,
    context: Value,
}

impl<'a> Stamper<'a> {
    pub fn new(evaluator: &'a dyn Evaluator, context: StampContext) -> Self {
        Self { evaluator, context: context.into_value() }
    }

    /// Stamp `body` into a concrete object (must carry `apiVersion`, `kind` and `metadata.name`).
    pub fn stamp(&self, body: &Value) -> Result<Value, StampError> {
        let obj = self.stamp_value(body)?;
        validate_object(&obj)?;
        Ok(obj)
    }

    fn stamp_value(&self, v: &Value) -> Result<Value, StampError> {
        match v {
            Value::String(s) => self.stamp_string(s),
            Value::Array(items) => items.iter().map(|i| self.stamp_value(i)).collect::<Result<Vec<_>, _>>().map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, vv) in map.iter() {
                    out.insert(k.clone(), self.stamp_value(vv)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn stamp_string(&self, s: &str) -> Result<Value, StampError> {
        let re = tag_regex();
        // A string that is exactly one tag keeps the value's type.
        if let Some(caps) = re.captures(s) {
            if let Some(whole) = caps.get(0) {
                if whole.start() == 0 && whole.end() == s.len() {
                    return self.eval_tag(&caps[1]);
                }
            }
        } else {
            return Ok(Value::String(s.to_string()));
        }

        let mut out = String::with_capacity(s.len());
        let mut last = 0usize;
        for caps in re.captures_iter(s) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&s[last..whole.start()]);
            match self.eval_tag(&caps[1])? {
                Value::String(inner) => out.push_str(&inner),
                other => out.push_str(&other.to_string()),
            }
            last = whole.end();
        }
        out.push_str(&s[last..]);
        Ok(Value::String(out))
    }

    fn eval_tag(&self, tag: &str) -> Result<Value, StampError> {
        self.evaluator
            .evaluate_json_path(tag.trim(), &self.context)
            .map_err(|source| StampError::Tag { tag: tag.to_string(), source })
    }
}

fn validate_object(obj: &Value) -> Result<(), StampError> {
    let map = obj.as_object().ok_or_else(|| StampError::InvalidObject("template must produce an object".into()))?;
    for key in ["apiVersion", "kind"] {
        if map.get(key).and_then(|v| v.as_str()).map(|s| s.is_empty()).unwrap_or(true) {
            return Err(StampError::InvalidObject(format!("missing {}", key)));
        }
    }
    let has_name = map
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|n| n.as_str())
        .map(|s| !s.is_empty())
        .unwrap_or(false);
    if !has_name {
        return Err(StampError::InvalidObject("missing metadata.name".into()));
    }
    Ok(())
}
