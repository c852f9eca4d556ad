//! Configuration: storage-core constants and the open-settings surface.

pub mod constants;
mod settings;

pub use constants::*;
pub use settings::{Collation, StorageSettings};
