//! On-disk model inspection.

pub mod cache;
pub mod on_disk;
pub mod resolver;
pub mod variant;

pub use cache::{Metadata, OnDiskCache};
pub use on_disk::ModelOnDisk;
pub use resolver::{ResolutionError, WeightFileResolver};
pub use variant::RepoVariant;
