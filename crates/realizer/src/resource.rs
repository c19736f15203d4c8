//! Realization of a single supply-chain entry: template lookup, input
//! resolution, stamping, submission and output extraction.

use std::collections::BTreeMap;
use std::sync::Arc;

use carto_core::{labels, ClusterSupplyChain, OutputDescriptor, ResourceInput, StampedRef, SupplyChainResource, Workload};
use carto_kubehub::{has_token, ClientBuilder, KubeRepository, Repository, Scheme, SubmissionCache};
use carto_templates::{
    merge_params, Evaluator, Inputs, NamedValue, Output, SourceInput, StampContext, Stamper, TemplateModel,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use serde_json::{Map, Value};
use tracing::debug;

use crate::RealizeError;

/// Outputs of the entries realized so far, by entry name.
#[derive(Debug, Clone, Default)]
pub struct Outputs {
    by_resource: BTreeMap<String, Output>,
}

impl Outputs {
    pub fn add(&mut self, resource: &str, output: Output) {
        self.by_resource.insert(resource.to_string(), output);
    }

    pub fn get(&self, resource: &str) -> Option<&Output> {
        self.by_resource.get(resource)
    }

    /// Resolve the entry's bindings against realized siblings.
    pub fn inputs_for(&self, entry: &SupplyChainResource) -> Result<Inputs, String> {
        let mut inputs = Inputs::default();
        for b in &entry.sources {
            match self.get(&b.resource) {
                Some(Output::Source { url, revision }) => {
                    inputs.sources.push(SourceInput { name: b.name.clone(), url: url.clone(), revision: revision.clone() })
                }
                other => return Err(binding_error("source", &b.name, &b.resource, other)),
            }
        }
        for b in &entry.images {
            match self.get(&b.resource) {
                Some(Output::Image { image }) => inputs.images.push(NamedValue { name: b.name.clone(), value: image.clone() }),
                other => return Err(binding_error("image", &b.name, &b.resource, other)),
            }
        }
        for b in &entry.configs {
            match self.get(&b.resource) {
                Some(Output::Config { config }) => inputs.configs.push(NamedValue { name: b.name.clone(), value: config.clone() }),
                other => return Err(binding_error("config", &b.name, &b.resource, other)),
            }
        }
        Ok(inputs)
    }
}

fn binding_error(want: &str, binding: &str, resource: &str, found: Option<&Output>) -> String {
    match found {
        None => format!("input [{}] references resource [{}] which has no output", binding, resource),
        Some(_) => format!("input [{}] expects a {} from resource [{}]", binding, want, resource),
    }
}

/// Result of realizing one entry. `stamped` is set as soon as an object was
/// stamped, even if a later step failed.
#[derive(Debug, Default)]
pub struct ResourceOutcome {
    pub stamped: Option<Value>,
    pub inputs: Vec<ResourceInput>,
    pub output: Option<Output>,
    pub descriptors: Vec<OutputDescriptor>,
    pub error: Option<RealizeError>,
}

impl ResourceOutcome {
    pub fn stamped_ref(&self) -> Option<StampedRef> {
        self.stamped.as_ref().and_then(StampedRef::from_object)
    }
}

pub struct ResourceRealizer {
    repo: Arc<dyn Repository>,
    evaluator: Arc<dyn Evaluator>,
    workload: Workload,
    owner: OwnerReference,
    chain_name: String,
    chain_params: Vec<carto_core::Param>,
}

impl ResourceRealizer {
    pub fn new(
        repo: Arc<dyn Repository>,
        evaluator: Arc<dyn Evaluator>,
        workload: &Workload,
        chain: &ClusterSupplyChain,
    ) -> Result<Self, RealizeError> {
        let mut owner = workload
            .controller_owner_ref(&())
            .ok_or_else(|| RealizeError::RealizerBuild(format!("workload {} has no uid", workload.key())))?;
        owner.block_owner_deletion = Some(true);
        Ok(Self {
            repo,
            evaluator,
            workload: workload.clone(),
            owner,
            chain_name: chain.name_any(),
            chain_params: chain.spec.params.clone(),
        })
    }

    pub async fn realize_resource(&self, entry: &SupplyChainResource, outputs: &Outputs) -> ResourceOutcome {
        let mut outcome = ResourceOutcome::default();
        if let Err(e) = self.run(entry, outputs, &mut outcome).await {
            outcome.error = Some(e);
        }
        outcome
    }

    async fn run(&self, entry: &SupplyChainResource, outputs: &Outputs, outcome: &mut ResourceOutcome) -> Result<(), RealizeError> {
        let resource = entry.name.clone();
        let template = self.repo.get_template(&entry.template_ref).await.map_err(|source| RealizeError::TemplateResolution {
            resource: resource.clone(),
            template: entry.template_ref.name.clone(),
            source,
        })?;
        let mut model = TemplateModel::new(template, Arc::clone(&self.evaluator));

        let inputs = outputs
            .inputs_for(entry)
            .map_err(|detail| RealizeError::TemplateInputs { resource: resource.clone(), detail })?;
        outcome.inputs = inputs.resource_inputs();
        model.set_inputs(inputs);

        let params = merge_params(model.get_default_params(), [self.chain_params.as_slice(), entry.params.as_slice()]);
        let stamp_err = |source| RealizeError::Stamp { resource: resource.clone(), source };
        let context = StampContext::new(&self.workload).map_err(stamp_err)?.with_params(params).with_inputs(model.inputs());
        let mut obj = Stamper::new(self.evaluator.as_ref(), context)
            .stamp(model.get_resource_template())
            .map_err(stamp_err)?;
        self.decorate(&mut obj, entry, &model);
        outcome.stamped = Some(obj.clone());

        let stamped = outcome.stamped_ref().map(|r| r.to_string()).unwrap_or_default();
        self.repo.ensure_object_exists_on_cluster(&mut obj, &self.owner).await.map_err(|source| {
            RealizeError::ApplyStampedObject { resource: resource.clone(), stamped: stamped.clone(), source }
        })?;
        debug!(workload = %self.workload.key(), resource = %resource, object = %stamped, "stamped object submitted");
        model.set_stamped_object(obj.clone());
        outcome.stamped = Some(obj);

        let output = model.get_output().map_err(|source| RealizeError::JsonPath { resource: resource.clone(), source })?;
        outcome.descriptors = model
            .generate_resource_output(output.as_ref())
            .map_err(|source| RealizeError::OutputSerialization { resource: resource.clone(), source })?;
        outcome.output = output;
        Ok(())
    }

    /// Stamped labels and namespace defaulting.
    fn decorate(&self, obj: &mut Value, entry: &SupplyChainResource, model: &TemplateModel) {
        let Some(root) = obj.as_object_mut() else { return };
        let meta = root.entry("metadata").or_insert_with(|| Value::Object(Map::new()));
        let Some(meta) = meta.as_object_mut() else { return };
        let ns_missing = meta.get("namespace").and_then(|v| v.as_str()).map(|s| s.is_empty()).unwrap_or(true);
        if ns_missing {
            meta.insert("namespace".into(), Value::String(self.workload.namespace().unwrap_or_default()));
        }
        let stamped_labels = [
            (labels::WORKLOAD_NAME, self.workload.name_any()),
            (labels::WORKLOAD_NAMESPACE, self.workload.namespace().unwrap_or_default()),
            (labels::SUPPLY_CHAIN_NAME, self.chain_name.clone()),
            (labels::RESOURCE_NAME, entry.name.clone()),
            (labels::TEMPLATE_KIND, model.get_kind().as_kind().to_string()),
            (labels::TEMPLATE_NAME, model.get_name()),
        ];
        let labels_value = meta.entry("labels").or_insert_with(|| Value::Object(Map::new()));
        if !labels_value.is_object() {
            *labels_value = Value::Object(Map::new());
        }
        if let Some(labels_map) = labels_value.as_object_mut() {
            for (k, v) in stamped_labels {
                labels_map.insert(k.to_string(), Value::String(v));
            }
        }
    }
}

/// Builds the per-reconciliation realizer from the service account's token secret.
pub trait ResourceRealizerBuilder: Send + Sync {
    fn build(&self, workload: &Workload, chain: &ClusterSupplyChain, secret: &Secret) -> Result<ResourceRealizer, RealizeError>;
}

/// Submits through a client authenticated as the workload's service account.
pub struct ScopedRealizerBuilder {
    clients: ClientBuilder,
    cache: Arc<SubmissionCache>,
    scheme: Arc<Scheme>,
    evaluator: Arc<dyn Evaluator>,
}

impl ScopedRealizerBuilder {
    pub fn new(clients: ClientBuilder, cache: Arc<SubmissionCache>, scheme: Arc<Scheme>, evaluator: Arc<dyn Evaluator>) -> Self {
        Self { clients, cache, scheme, evaluator }
    }
}

impl ResourceRealizerBuilder for ScopedRealizerBuilder {
    fn build(&self, workload: &Workload, chain: &ClusterSupplyChain, secret: &Secret) -> Result<ResourceRealizer, RealizeError> {
        let client = self.clients.client_for(secret).map_err(|e| RealizeError::RealizerBuild(format!("{:#}", e)))?;
        let repo: Arc<dyn Repository> = Arc::new(KubeRepository::new(client, Arc::clone(&self.cache), Arc::clone(&self.scheme)));
        ResourceRealizer::new(repo, Arc::clone(&self.evaluator), workload, chain)
    }
}

/// Realizes through a fixed repository; the secret only has to carry a token.
pub struct RepositoryRealizerBuilder {
    repo: Arc<dyn Repository>,
    evaluator: Arc<dyn Evaluator>,
}

impl RepositoryRealizerBuilder {
    pub fn new(repo: Arc<dyn Repository>, evaluator: Arc<dyn Evaluator>) -> Self {
        Self { repo, evaluator }
    }
}

impl ResourceRealizerBuilder for RepositoryRealizerBuilder {
    fn build(&self, workload: &Workload, chain: &ClusterSupplyChain, secret: &Secret) -> Result<ResourceRealizer, RealizeError> {
        if !has_token(secret) {
            return Err(RealizeError::RealizerBuild("service account secret has no token".into()));
        }
        ResourceRealizer::new(Arc::clone(&self.repo), Arc::clone(&self.evaluator), workload, chain)
    }
}
