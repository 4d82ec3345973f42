//! Datasets, outer folds, feature providers and result artifacts for
//! Sweepline experiments.

pub mod features;
pub mod loaders;
pub mod splits;
pub mod storage;
pub mod synthetic;

pub use features::*;
pub use loaders::*;
pub use splits::*;
pub use storage::*;
pub use synthetic::*;
