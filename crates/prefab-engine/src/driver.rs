//! Host driver abstraction — the engine's only view of the machine it converges.
//!
//! The engine decides *when* a resource is checked and applied. The driver
//! decides *how*. `SystemHost` talks to a real Debian host; tests plug in
//! recording fakes.

use prefab_core::{Package, Resource, Result};

#[async_trait::async_trait]
pub trait HostDriver: Send + Sync {
    /// Whether the host already matches this resource.
    async fn is_satisfied(&self, resource: Resource<'_>) -> Result<bool>;

    /// Mutate the host so the resource is satisfied.
    async fn apply(&self, resource: Resource<'_>) -> Result<()>;

    /// URLs of the archives `package` needs that are not on the host yet.
    async fn archive_locators(&self, package: &Package) -> Result<Vec<String>>;

    /// Global package index refresh (`apt-get update`).
    async fn refresh_index(&self) -> Result<()>;
}
