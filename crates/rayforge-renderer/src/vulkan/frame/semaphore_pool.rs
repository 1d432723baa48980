//! Free list of image-acquisition semaphores.

use ash::vk;

use super::FrameBackend;
use crate::error::Result;

/// Recycles "image acquired" semaphores across frames.
///
/// A semaphore is either in the pool or bound to exactly one frame slot.
/// It only returns to the pool once the slot's fence has been observed
/// signaled, i.e. once the submission that waited on it has completed.
#[derive(Debug, Default)]
pub struct SemaphorePool {
    free: Vec<vk::Semaphore>,
    created: usize,
}

impl SemaphorePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a recycled semaphore, or create a new one if the pool is empty.
    pub fn acquire<B: FrameBackend>(&mut self, backend: &B) -> Result<vk::Semaphore> {
        if let Some(semaphore) = self.free.pop() {
            return Ok(semaphore);
        }

        let semaphore = backend.create_semaphore()?;
        self.created += 1;
        log::debug!("Semaphore pool empty, created acquisition semaphore #{}", self.created);
        Ok(semaphore)
    }

    /// Return a semaphore that no in-flight frame can still wait on.
    pub fn release(&mut self, semaphore: vk::Semaphore) {
        debug_assert!(!self.free.contains(&semaphore), "semaphore released twice");
        self.free.push(semaphore);
    }

    /// Number of semaphores waiting for reuse.
    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Total semaphores this pool ever created.
    pub fn created(&self) -> usize {
        self.created
    }

    pub fn contains(&self, semaphore: vk::Semaphore) -> bool {
        self.free.contains(&semaphore)
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self) -> &[vk::Semaphore] {
        &self.free
    }

    /// Destroy every pooled semaphore.
    pub fn destroy<B: FrameBackend>(&mut self, backend: &B) {
        for semaphore in self.free.drain(..) {
            backend.destroy_semaphore(semaphore);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::fakes::FakeFrameBackend;

    #[test]
    fn test_empty_pool_creates() {
        let backend = FakeFrameBackend::new(2);
        let mut pool = SemaphorePool::new();

        let a = pool.acquire(&backend).unwrap();
        let b = pool.acquire(&backend).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.created(), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_released_semaphore_is_reused() {
        let backend = FakeFrameBackend::new(2);
        let mut pool = SemaphorePool::new();

        let a = pool.acquire(&backend).unwrap();
        pool.release(a);
        assert!(pool.contains(a));

        let again = pool.acquire(&backend).unwrap();
        assert_eq!(again, a);
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn test_destroy_drains_pool() {
        let backend = FakeFrameBackend::new(2);
        let mut pool = SemaphorePool::new();

        let a = pool.acquire(&backend).unwrap();
        pool.release(a);
        pool.destroy(&backend);

        assert!(pool.is_empty());
        assert_eq!(backend.destroyed_semaphores(), vec![a]);
    }
}
