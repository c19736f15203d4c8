use carto_core::conditions::{reasons, resources_submitted_failure};
use carto_core::Condition;
use carto_kubehub::RepoError;
use carto_templates::{PathError, StampError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealizeError {
    #[error("unable to build resource realizer: {0}")]
    RealizerBuild(String),
    #[error("unable to get template [{template}] for resource [{resource}]: {source}")]
    TemplateResolution {
        resource: String,
        template: String,
        #[source]
        source: RepoError,
    },
    #[error("unable to resolve inputs for resource [{resource}]: {detail}")]
    TemplateInputs { resource: String, detail: String },
    #[error("unable to stamp object for resource [{resource}]: {source}")]
    Stamp {
        resource: String,
        #[source]
        source: StampError,
    },
    #[error("unable to apply object [{stamped}] for resource [{resource}]: {source}")]
    ApplyStampedObject {
        resource: String,
        stamped: String,
        #[source]
        source: RepoError,
    },
    #[error("unable to retrieve outputs from stamped object for resource [{resource}]: {source}")]
    JsonPath {
        resource: String,
        #[source]
        source: PathError,
    },
    #[error("unable to render outputs for resource [{resource}]: {source}")]
    OutputSerialization {
        resource: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("supply chain [{chain}] has a cycle through resources [{}]", .resources.join(", "))]
    Cycle { chain: String, resources: Vec<String> },
}

impl RealizeError {
    /// System faults the user cannot fix by editing the workload or chain.
    pub fn is_unhandled(&self) -> bool {
        match self {
            Self::RealizerBuild(_) | Self::OutputSerialization { .. } => true,
            Self::TemplateResolution { source, .. } => !(source.is_not_found() || matches!(source, RepoError::UnknownKind(_))),
            Self::ApplyStampedObject { source, .. } => !source.is_rejected(),
            Self::TemplateInputs { .. } | Self::Stamp { .. } | Self::JsonPath { .. } | Self::Cycle { .. } => false,
        }
    }

    pub fn condition_reason(&self) -> &'static str {
        match self {
            Self::RealizerBuild(_) => reasons::RESOURCE_REALIZER_BUILDER_ERROR,
            Self::TemplateResolution { .. } => reasons::TEMPLATE_OBJECT_RETRIEVAL_FAILURE,
            Self::TemplateInputs { .. } | Self::Cycle { .. } => reasons::TEMPLATE_INPUTS_ERROR,
            Self::Stamp { .. } | Self::JsonPath { .. } | Self::OutputSerialization { .. } => reasons::TEMPLATE_STAMP_FAILURE,
            Self::ApplyStampedObject { .. } => reasons::APPLY_STAMPED_OBJECT_ERROR,
        }
    }

    /// Name of the error category, as used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RealizerBuild(_) => "RealizerBuildError",
            Self::TemplateResolution { .. } => "GetTemplateError",
            Self::TemplateInputs { .. } => reasons::TEMPLATE_INPUTS_ERROR,
            Self::Stamp { .. } => reasons::STAMP_ERROR,
            Self::ApplyStampedObject { .. } => reasons::APPLY_STAMPED_OBJECT_ERROR,
            Self::JsonPath { .. } => reasons::JSON_PATH_ERROR,
            Self::OutputSerialization { .. } => "OutputSerializationError",
            Self::Cycle { .. } => "CycleError",
        }
    }

    /// Offending path expression, for output extraction failures.
    pub fn expression(&self) -> Option<&str> {
        match self {
            Self::JsonPath { source, .. } => Some(&source.expression),
            _ => None,
        }
    }
}

/// Workload-level `ResourcesSubmitted` condition for a failed realization.
pub fn add_condition_for_resource_submitted(err: &RealizeError) -> Condition {
    resources_submitted_failure(err.condition_reason(), err.to_string())
}
