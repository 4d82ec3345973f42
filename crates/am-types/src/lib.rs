pub mod data;
pub mod errors;
pub mod estimator;
pub mod metric;
pub mod space;
pub mod table;

pub use data::*;
pub use errors::*;
pub use estimator::*;
pub use metric::*;
pub use space::*;
pub use table::*;
