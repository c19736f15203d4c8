//! Template models: one wrapper over the four template kinds.

use std::sync::Arc;

use carto_core::{OutputDescriptor, ResourceInput, Template, TemplateKind, TemplateParam};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::evaluator::{EvalError, Evaluator};

/// Maximum preview length in bytes.
pub const PREVIEW_CHARACTER_LIMIT: usize = 1024;

/// Output produced by a realized resource and consumed by downstream entries.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Source { url: Value, revision: Value },
    Config { config: Value },
    Image { image: Value },
}

impl Output {
    fn fields(&self) -> Vec<(&'static str, &Value)> {
        match self {
            Self::Source { url, revision } => vec![("url", url), ("revision", revision)],
            Self::Config { config } => vec![("config", config)],
            Self::Image { image } => vec![("image", image)],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceInput {
    pub name: String,
    pub url: Value,
    pub revision: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedValue {
    pub name: String,
    pub value: Value,
}

/// Upstream outputs bound to a resource, keyed by binding name in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inputs {
    pub sources: Vec<SourceInput>,
    pub images: Vec<NamedValue>,
    pub configs: Vec<NamedValue>,
}

impl Inputs {
    /// Binding names as recorded on `status.resources[].inputs`.
    pub fn resource_inputs(&self) -> Vec<ResourceInput> {
        self.sources
            .iter()
            .map(|s| s.name.clone())
            .chain(self.images.iter().map(|i| i.name.clone()))
            .chain(self.configs.iter().map(|c| c.name.clone()))
            .map(|name| ResourceInput { name })
            .collect()
    }

    /// Expose `sources`/`source`, `images`/`image` and `configs`/`config`; the
    /// singular keys alias the first binding of each kind.
    pub(crate) fn extend_context(&self, root: &mut Map<String, Value>) {
        let mut sources = Map::new();
        for s in &self.sources {
            let mut entry = Map::new();
            entry.insert("url".into(), s.url.clone());
            entry.insert("revision".into(), s.revision.clone());
            sources.insert(s.name.clone(), Value::Object(entry));
        }
        if let Some(first) = self.sources.first() {
            root.insert("source".into(), sources.get(&first.name).cloned().unwrap_or(Value::Null));
        }
        root.insert("sources".into(), Value::Object(sources));

        for (plural, singular, items) in [("images", "image", &self.images), ("configs", "config", &self.configs)] {
            let mut named = Map::new();
            for i in items {
                let mut entry = Map::new();
                entry.insert(singular.to_string(), i.value.clone());
                named.insert(i.name.clone(), Value::Object(entry));
            }
            if let Some(first) = items.first() {
                root.insert(singular.into(), first.value.clone());
            }
            root.insert(plural.into(), Value::Object(named));
        }
    }
}

/// An output path that failed to resolve against the stamped object.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to evaluate the {field} path [{expression}]: {source}")]
pub struct PathError {
    pub field: &'static str,
    pub expression: String,
    #[source]
    pub source: EvalError,
}

pub struct TemplateModel {
    template: Template,
    evaluator: Arc<dyn Evaluator>,
    inputs: Option<Inputs>,
    stamped: Option<Value>,
}

impl TemplateModel {
    pub fn new(template: Template, evaluator: Arc<dyn Evaluator>) -> Self {
        Self { template, evaluator, inputs: None, stamped: None }
    }

    pub fn get_name(&self) -> String {
        self.template.name()
    }

    pub fn get_kind(&self) -> TemplateKind {
        self.template.kind()
    }

    /// Source and generic templates stamp without upstream inputs.
    pub fn set_inputs(&mut self, inputs: Inputs) {
        match self.template.kind() {
            TemplateKind::Config | TemplateKind::Image => self.inputs = Some(inputs),
            TemplateKind::Source | TemplateKind::Generic => {}
        }
    }

    pub fn inputs(&self) -> Option<&Inputs> {
        self.inputs.as_ref()
    }

    pub fn set_stamped_object(&mut self, obj: Value) {
        self.stamped = Some(obj);
    }

    pub fn get_output(&self) -> Result<Option<Output>, PathError> {
        let empty = Value::Object(Map::new());
        let doc = self.stamped.as_ref().unwrap_or(&empty);
        let eval = |field: &'static str, expression: &str| {
            self.evaluator
                .evaluate_json_path(expression, doc)
                .map_err(|source| PathError { field, expression: expression.to_string(), source })
        };
        Ok(match &self.template {
            Template::Source(t) => Some(Output::Source {
                url: eval("url", &t.spec.url_path)?,
                revision: eval("revision", &t.spec.revision_path)?,
            }),
            Template::Config(t) => Some(Output::Config { config: eval("config", &t.spec.config_path)? }),
            Template::Image(t) => Some(Output::Image { image: eval("image", &t.spec.image_path)? }),
            Template::Generic(_) => None,
        })
    }

    pub fn generate_resource_output(&self, output: Option<&Output>) -> Result<Vec<OutputDescriptor>, serde_yaml::Error> {
        let Some(output) = output else { return Ok(Vec::new()) };
        output
            .fields()
            .into_iter()
            .map(|(name, value)| {
                let (preview, digest) = digest_value(value)?;
                Ok(OutputDescriptor { name: name.to_string(), preview, digest, last_transition_time: None })
            })
            .collect()
    }

    pub fn get_resource_template(&self) -> &Value {
        self.template.body()
    }

    pub fn get_default_params(&self) -> &[TemplateParam] {
        self.template.params()
    }
}

/// Block-style YAML rendering of `value`, truncated preview and `sha256:<hex>` digest.
pub fn digest_value(value: &Value) -> Result<(String, String), serde_yaml::Error> {
    let rendered = serde_yaml::to_string(value)?;
    let digest = format!("sha256:{:x}", Sha256::digest(rendered.as_bytes()));
    Ok((shorten(&rendered, PREVIEW_CHARACTER_LIMIT), digest))
}

fn shorten(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{EvalErrorKind, JsonPathEvaluator};
    use carto_core::{ClusterSourceTemplate, ClusterTemplate, GenericTemplateSpec, SourceTemplateSpec};
    use serde_json::json;

    fn source_model() -> TemplateModel {
        let t = ClusterSourceTemplate::new("git", SourceTemplateSpec {
            template: json!({}),
            params: vec![],
            url_path: ".status.url".into(),
            revision_path: ".status.revision".into(),
        });
        TemplateModel::new(Template::Source(t), Arc::new(JsonPathEvaluator))
    }

    #[test]
    fn source_output_from_stamped_status() {
        let mut m = source_model();
        m.set_stamped_object(json!({ "status": { "url": "http://src", "revision": "abc" } }));
        let out = m.get_output().unwrap().unwrap();
        assert_eq!(out, Output::Source { url: json!("http://src"), revision: json!("abc") });
        let descs = m.generate_resource_output(Some(&out)).unwrap();
        let names: Vec<_> = descs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["url", "revision"]);
        assert_eq!(descs[0].preview, "http://src\n");
    }

    #[test]
    fn missing_path_names_the_expression() {
        let mut m = source_model();
        m.set_stamped_object(json!({ "status": {} }));
        let err = m.get_output().unwrap_err();
        assert_eq!(err.expression, ".status.url");
        assert_eq!(err.field, "url");
        assert_eq!(err.source.kind, EvalErrorKind::NotFound);
    }

    #[test]
    fn generic_template_has_no_output_and_ignores_inputs() {
        let t = ClusterTemplate::new("dep-tpl", GenericTemplateSpec { template: json!({}), params: vec![] });
        let mut m = TemplateModel::new(Template::Generic(t), Arc::new(JsonPathEvaluator));
        m.set_inputs(Inputs { images: vec![NamedValue { name: "i".into(), value: json!("x") }], ..Default::default() });
        assert!(m.inputs().is_none());
        assert!(m.get_output().unwrap().is_none());
        assert!(m.generate_resource_output(None).unwrap().is_empty());
    }

    #[test]
    fn digests_are_stable_and_value_sensitive() {
        let (_, a) = digest_value(&json!({ "b": 1, "a": [1, 2] })).unwrap();
        let (_, b) = digest_value(&json!({ "b": 1, "a": [1, 2] })).unwrap();
        let (_, c) = digest_value(&json!({ "b": 1, "a": [2, 1] })).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("sha256:"));
        assert_eq!(a.len(), "sha256:".len() + 64);
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(shorten("aé", 2), "a");
        let long = "x".repeat(PREVIEW_CHARACTER_LIMIT * 2);
        let (preview, _) = digest_value(&json!(long)).unwrap();
        assert_eq!(preview.len(), PREVIEW_CHARACTER_LIMIT);
        assert!(serde_yaml::to_string(&json!(long)).unwrap().starts_with(&preview));
    }
}
