//! Scoped, exclusive hold on one pooled resource.

use std::ops::{Deref, DerefMut};

use super::{ElementId, Pool, ResourceManager};

/// Exclusive access to one pooled resource.
///
/// On drop: the resource returns to the pool. [`Lease::evict`] instead removes
/// it from the pool and destroys it.
#[must_use = "dropping a lease immediately returns the resource to the pool"]
pub struct Lease<'a, M: ResourceManager> {
    pool: &'a Pool<M>,
    id: ElementId,
    /// `None` only after the resource has been handed back or evicted.
    resource: Option<M::Resource>,
}

impl<'a, M: ResourceManager> Lease<'a, M> {
    pub(super) fn new(pool: &'a Pool<M>, id: ElementId, resource: M::Resource) -> Self {
        Self {
            pool,
            id,
            resource: Some(resource),
        }
    }

    /// Remove this element from the pool and destroy its resource.
    pub fn evict(mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.evict(self.id, resource);
        }
    }

    pub fn pool(&self) -> &'a Pool<M> {
        self.pool
    }
}

impl<M: ResourceManager> Deref for Lease<'_, M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource
            .as_ref()
            .expect("lease resource is present until the lease is consumed")
    }
}

impl<M: ResourceManager> DerefMut for Lease<'_, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource
            .as_mut()
            .expect("lease resource is present until the lease is consumed")
    }
}

impl<M: ResourceManager> Drop for Lease<'_, M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(self.id, resource);
        }
    }
}

impl<M: ResourceManager> std::fmt::Debug for Lease<'_, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("element", &self.id).finish()
    }
}
