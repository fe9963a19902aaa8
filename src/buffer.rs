//! Buffer cores and view handles
//!
//! A [`BufferCore`] owns one physical buffer. Every array view onto it holds
//! its own [`ArrayHandle`]; the core counts live handles and frees the storage
//! when the last one is released. All views of a core share its storage lock.
//!
//! Each handle is released exactly once. A second explicit release is an
//! error, and dropping a handle nobody released falls back to releasing it.

use crate::dispose::Disposable;
use crate::error::{KilnError, Result};
use crate::leak::LeakDetector;
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
}

pub struct BufferCore<S> {
    storage: Mutex<Option<Arc<S>>>,
    live_views: AtomicUsize,
}

impl<S> BufferCore<S> {
    fn slot(&self) -> MutexGuard<'_, Option<Arc<S>>> {
        self.storage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the physical buffer has been freed
    #[must_use]
    pub fn is_freed(&self) -> bool {
        self.slot().is_none()
    }

    #[must_use]
    pub fn live_views(&self) -> usize {
        self.live_views.load(Ordering::Acquire)
    }
}

pub struct ArrayHandle<S> {
    id: u64,
    core: Arc<BufferCore<S>>,
    released: AtomicBool,
    leaks: Option<Arc<LeakDetector>>,
}

impl<S> std::fmt::Debug for ArrayHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayHandle")
            .field("id", &self.id)
            .field("released", &self.is_released())
            .field("live_views", &self.core.live_views())
            .finish()
    }
}

impl<S> ArrayHandle<S> {
    /// First view onto freshly allocated storage
    pub fn new(storage: S, leaks: Option<&Arc<LeakDetector>>) -> Self {
        let core = Arc::new(BufferCore {
            storage: Mutex::new(Some(Arc::new(storage))),
            live_views: AtomicUsize::new(1),
        });
        Self::attach(core, leaks)
    }

    fn attach(core: Arc<BufferCore<S>>, leaks: Option<&Arc<LeakDetector>>) -> Self {
        let id = next_id();
        let leaks = leaks.filter(|det| det.track(id)).cloned();
        Self {
            id,
            core,
            released: AtomicBool::new(false),
            leaks,
        }
    }

    /// Another handle onto the same core
    ///
    /// # Errors
    /// `AlreadyReleased` when this handle was released.
    pub fn view(&self, leaks: Option<&Arc<LeakDetector>>) -> Result<Self> {
        // Holding the slot lock orders this against a concurrent final release.
        let slot = self.core.slot();
        if self.is_released() || slot.is_none() {
            return Err(KilnError::AlreadyReleased { id: self.id });
        }
        self.core.live_views.fetch_add(1, Ordering::AcqRel);
        drop(slot);
        Ok(Self::attach(Arc::clone(&self.core), leaks))
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn core(&self) -> &Arc<BufferCore<S>> {
        &self.core
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Shared reference to the physical storage
    ///
    /// # Errors
    /// `AlreadyReleased` when this handle was released.
    pub fn storage(&self) -> Result<Arc<S>> {
        if self.is_released() {
            return Err(KilnError::AlreadyReleased { id: self.id });
        }
        self.core
            .slot()
            .as_ref()
            .map(Arc::clone)
            .ok_or(KilnError::AlreadyReleased { id: self.id })
    }

    /// Release this view; the storage is freed with the last live view
    ///
    /// # Errors
    /// `AlreadyReleased` when called a second time.
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(KilnError::AlreadyReleased { id: self.id });
        }
        if let Some(det) = &self.leaks {
            det.untrack(self.id);
        }
        let mut slot = self.core.slot();
        if self.core.live_views.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Dropped outside the lock so a device wait never blocks other views.
            let storage = slot.take();
            drop(slot);
            drop(storage);
        }
        Ok(())
    }
}

impl<S> Disposable for ArrayHandle<S> {
    fn id(&self) -> u64 {
        self.id
    }

    fn dispose(&self) -> Result<()> {
        self.release()
    }

    fn is_released(&self) -> bool {
        ArrayHandle::is_released(self)
    }
}

impl<S> Drop for ArrayHandle<S> {
    fn drop(&mut self) {
        if !self.is_released() {
            debug!("array handle {} dropped unreleased; releasing", self.id);
            let _ = self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_freed_with_last_view() {
        let a = ArrayHandle::new(vec![1.0f32, 2.0], None);
        let b = a.view(None).unwrap();
        assert_eq!(a.core().live_views(), 2);

        a.release().unwrap();
        assert!(!a.core().is_freed());
        assert_eq!(b.storage().unwrap().as_slice(), &[1.0, 2.0]);

        b.release().unwrap();
        assert!(b.core().is_freed());
    }

    #[test]
    fn double_release_is_rejected() {
        let a = ArrayHandle::new(vec![0.0f32], None);
        let id = a.id();
        a.release().unwrap();
        assert!(matches!(a.release(), Err(KilnError::AlreadyReleased { id: got }) if got == id));
        assert!(matches!(a.storage(), Err(KilnError::AlreadyReleased { .. })));
        assert!(matches!(a.view(None), Err(KilnError::AlreadyReleased { .. })));
    }

    #[test]
    fn drop_releases_unreleased_handle() {
        let a = ArrayHandle::new(vec![0.0f32; 4], None);
        let core = Arc::clone(a.core());
        drop(a);
        assert!(core.is_freed());
        assert_eq!(core.live_views(), 0);
    }

    #[test]
    fn released_handles_are_untracked() {
        let det = Arc::new(LeakDetector::new(1, 1));
        let a = ArrayHandle::new(vec![0.0f32], Some(&det));
        assert_eq!(det.tracked(), 1);
        a.release().unwrap();
        assert_eq!(det.tracked(), 0);
    }
}
