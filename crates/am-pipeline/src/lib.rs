//! Concrete pipelines for Sweepline: preprocessing, classifiers, and the
//! registry worker processes use to rebuild a pipeline from its name.

pub mod classifiers;
pub mod fault;
pub mod pipeline;
pub mod preprocessing;
pub mod registry;

pub use classifiers::{Classifier, GaussianNB, KNearestNeighbors, LogisticRegression, NeighborWeights};
pub use fault::{Fault, FaultPipeline};
pub use pipeline::{ClassifierPipeline, CLASSIFIER_PIPELINE};
pub use preprocessing::{CategoricalEncoding, ImputeStrategy, Preprocessor};
pub use registry::{lookup, names};
