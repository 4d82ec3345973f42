//! Name-based pipeline lookup, shared by the scheduler side and worker
//! processes.

use am_types::Pipeline;
use std::sync::Arc;

use crate::fault::{Fault, FaultPipeline};
use crate::pipeline::{ClassifierPipeline, CLASSIFIER_PIPELINE};

/// Resolve a pipeline by name. Fault pipelines are parsed from their name.
pub fn lookup(name: &str) -> Option<Arc<dyn Pipeline>> {
    if name == CLASSIFIER_PIPELINE {
        return Some(Arc::new(ClassifierPipeline::new()));
    }
    Fault::parse(name).map(|fault| Arc::new(FaultPipeline::new(fault)) as Arc<dyn Pipeline>)
}

/// Names of the fixed pipelines. Fault pipelines are parameterized and not
/// listed.
pub fn names() -> Vec<&'static str> {
    vec![CLASSIFIER_PIPELINE]
}
