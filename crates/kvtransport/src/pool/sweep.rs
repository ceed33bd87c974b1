//! Full-pool iteration.

use super::{ElementId, Lease, Pool, ResourceManager};

/// Yields a lease on each element that existed when the sweep began.
///
/// Busy elements are waited for; elements evicted before they could be
/// visited are skipped.
pub struct Sweep<'a, M: ResourceManager> {
    pool: &'a Pool<M>,
    pending: Vec<ElementId>,
}

impl<'a, M: ResourceManager> Sweep<'a, M> {
    pub(super) fn new(pool: &'a Pool<M>, pending: Vec<ElementId>) -> Self {
        Self { pool, pending }
    }

    /// Elements not yet visited.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl<'a, M: ResourceManager> Iterator for Sweep<'a, M> {
    type Item = Lease<'a, M>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut elements = self.pool.lock();
        loop {
            self.pending.retain(|id| elements.contains(*id));
            if self.pending.is_empty() {
                return None;
            }

            let claimed = self
                .pending
                .iter()
                .enumerate()
                .find_map(|(idx, id)| elements.claim(*id).map(|resource| (idx, *id, resource)));

            if let Some((idx, id, resource)) = claimed {
                self.pending.swap_remove(idx);
                return Some(Lease::new(self.pool, id, resource));
            }

            elements = self.pool.wait(elements);
        }
    }
}
