//! Thread-safe pool of reusable resources.
//!
//! Leases are exclusive and scoped:
//! - dropping a [`Lease`] returns its resource to the pool;
//! - [`Lease::evict`] removes the element and destroys the resource;
//! - [`Pool::sweep`] visits every element that existed when it was called,
//!   waiting for leased ones to come back.
//!
//! `take` never waits: when no free element matches, a new resource is
//! created, so the pool grows to the peak number of concurrent leases.

mod lease;
mod sweep;

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

pub use lease::Lease;
pub use sweep::Sweep;

/// Creates and destroys the resources held by a [`Pool`].
pub trait ResourceManager: Send + Sync {
    type Resource: Send;
    type Error;

    fn create_resource(&self) -> Result<Self::Resource, Self::Error>;

    /// Release whatever the resource holds. Must not fail, even if the
    /// resource is already defunct.
    fn destroy_resource(&self, resource: Self::Resource);
}

pub(crate) type ElementId = u64;

/// A pooled resource. `resource` is `None` while the element is leased.
struct Element<R> {
    id: ElementId,
    resource: Option<R>,
}

struct Elements<R> {
    items: Vec<Element<R>>,
    next_id: ElementId,
}

impl<R> Elements<R> {
    fn insert_claimed(&mut self) -> ElementId {
        let id = self.next_id;
        self.next_id += 1;
        self.items.push(Element { id, resource: None });
        id
    }

    fn claim_matching<F>(&mut self, mut filter: F) -> Option<(ElementId, R)>
    where
        F: FnMut(&R) -> bool,
    {
        self.items.iter_mut().find_map(|element| {
            let matches = element.resource.as_ref().is_some_and(&mut filter);
            if matches {
                element.resource.take().map(|resource| (element.id, resource))
            } else {
                None
            }
        })
    }

    fn claim(&mut self, id: ElementId) -> Option<R> {
        self.items
            .iter_mut()
            .find(|element| element.id == id)
            .and_then(|element| element.resource.take())
    }

    fn contains(&self, id: ElementId) -> bool {
        self.items.iter().any(|element| element.id == id)
    }
}

/// Element counts at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
}

pub struct Pool<M: ResourceManager> {
    manager: M,
    elements: Mutex<Elements<M::Resource>>,
    /// Signalled whenever an element is released or removed.
    released: Condvar,
}

impl<M: ResourceManager> Pool<M> {
    pub fn new(manager: M) -> Self {
        Self {
            manager,
            elements: Mutex::new(Elements {
                items: Vec::new(),
                next_id: 0,
            }),
            released: Condvar::new(),
        }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Lease any free resource, creating one if none is free.
    pub fn take(&self) -> Result<Lease<'_, M>, M::Error> {
        self.take_with(|_| true, None)
    }

    /// Lease a free resource accepted by `filter`, creating one if none is.
    ///
    /// The filter runs under the pool lock and must not touch the pool.
    pub fn take_filtered<F>(&self, filter: F) -> Result<Lease<'_, M>, M::Error>
    where
        F: FnMut(&M::Resource) -> bool,
    {
        self.take_with(filter, None)
    }

    /// Lease a free resource, or adopt `default` as a new element.
    /// Never calls `create_resource`. An unused `default` is destroyed.
    pub fn take_or(&self, default: M::Resource) -> Lease<'_, M> {
        let mut elements = self.lock();
        if let Some((id, resource)) = elements.claim_matching(|_| true) {
            drop(elements);
            self.discard(id, default);
            return Lease::new(self, id, resource);
        }
        let id = elements.insert_claimed();
        drop(elements);
        Lease::new(self, id, default)
    }

    /// General form of `take`: reuse a free element accepted by `filter`,
    /// otherwise adopt `default` or create a new resource.
    ///
    /// Creation happens outside the pool lock; a creation error is returned
    /// and nothing is added to the pool. A `default` passed in but not needed
    /// is destroyed.
    pub fn take_with<F>(
        &self,
        filter: F,
        default: Option<M::Resource>,
    ) -> Result<Lease<'_, M>, M::Error>
    where
        F: FnMut(&M::Resource) -> bool,
    {
        let claimed = self.lock().claim_matching(filter);
        if let Some((id, resource)) = claimed {
            if let Some(unused) = default {
                self.discard(id, unused);
            }
            return Ok(Lease::new(self, id, resource));
        }

        let resource = match default {
            Some(resource) => resource,
            None => self.manager.create_resource()?,
        };
        let id = self.lock().insert_claimed();
        tracing::trace!(element = id, "Added resource to pool");
        Ok(Lease::new(self, id, resource))
    }

    /// Iterate over every element present now, each exactly once.
    ///
    /// Elements leased elsewhere are waited for; elements added after this
    /// call are never visited. Holding a lease on one of the visited elements
    /// on the iterating thread deadlocks.
    pub fn sweep(&self) -> Sweep<'_, M> {
        let pending = self.lock().items.iter().map(|element| element.id).collect();
        Sweep::new(self, pending)
    }

    /// Evict and destroy every element present now, waiting for leased ones
    /// to be released first.
    pub fn clear(&self) {
        let mut evicted = 0usize;
        for lease in self.sweep() {
            lease.evict();
            evicted += 1;
        }
        tracing::debug!(evicted, "Pool cleared");
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PoolStats {
        let elements = self.lock();
        PoolStats {
            total: elements.items.len(),
            in_use: elements
                .items
                .iter()
                .filter(|element| element.resource.is_none())
                .count(),
        }
    }

    pub(crate) fn release(&self, id: ElementId, resource: M::Resource) {
        let orphan = {
            let mut elements = self.lock();
            match elements.items.iter_mut().find(|element| element.id == id) {
                Some(element) => {
                    element.resource = Some(resource);
                    None
                }
                None => Some(resource),
            }
        };
        // Only a lease's own evict removes a leased element, and that consumes
        // the lease.
        debug_assert!(orphan.is_none(), "released element {id} is not in the pool");
        if let Some(resource) = orphan {
            tracing::error!(element = id, "Released resource not in pool - destroying");
            self.manager.destroy_resource(resource);
        }
        self.released.notify_all();
    }

    pub(crate) fn evict(&self, id: ElementId, resource: M::Resource) {
        self.lock().items.retain(|element| element.id != id);
        tracing::debug!(element = id, "Evicting resource from pool");
        self.manager.destroy_resource(resource);
        self.released.notify_all();
    }

    /// Destroy a caller-supplied default that lost to a pooled element.
    fn discard(&self, reused: ElementId, default: M::Resource) {
        tracing::trace!(element = reused, "Reusing pooled resource; destroying unused default");
        self.manager.destroy_resource(default);
    }

    fn lock(&self) -> MutexGuard<'_, Elements<M::Resource>> {
        self.elements.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Pool lock poisoned - recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    fn wait<'g>(
        &self,
        guard: MutexGuard<'g, Elements<M::Resource>>,
    ) -> MutexGuard<'g, Elements<M::Resource>> {
        self.released
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<M: ResourceManager> Drop for Pool<M> {
    fn drop(&mut self) {
        let elements = self
            .elements
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for element in elements.items.drain(..) {
            if let Some(resource) = element.resource {
                self.manager.destroy_resource(resource);
            }
        }
    }
}

impl<M: ResourceManager> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Pool")
            .field("total", &stats.total)
            .field("in_use", &stats.in_use)
            .finish()
    }
}
