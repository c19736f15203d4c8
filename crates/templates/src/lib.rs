//! Carto templates: path evaluation, template models and stamping.

#![forbid(unsafe_code)]

pub mod evaluator;
pub mod model;
pub mod stamper;

pub use evaluator::{EvalError, EvalErrorKind, Evaluator, JsonPathEvaluator};
pub use model::{digest_value, Inputs, NamedValue, Output, PathError, SourceInput, TemplateModel, PREVIEW_CHARACTER_LIMIT};
pub use stamper::{merge_params, StampContext, StampError, Stamper};
