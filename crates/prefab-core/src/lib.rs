//! Prefab Core - resource specifications, manifests, and error handling

pub mod error;
pub mod manifest;
pub mod resource;

pub use error::{Error, Result};
pub use manifest::Manifest;
pub use resource::*;
