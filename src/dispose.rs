//! Disposal scopes
//!
//! A [`ScopeStack`] holds one registration list per active scope. Every
//! [`Disposable`] created while a scope is open lands in the top list; closing
//! the scope releases everything not in its keep set and hands kept items to
//! the enclosing scope.

use crate::error::Result;
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// Anything with an explicit release
pub trait Disposable {
    fn id(&self) -> u64;
    /// # Errors
    /// `AlreadyReleased` on a second call.
    fn dispose(&self) -> Result<()>;
    fn is_released(&self) -> bool;
}

/// Collects the ids a value keeps alive when it leaves a scope
pub trait Retain {
    fn retain_into(&self, keep: &mut HashSet<u64>);

    fn keep_set(&self) -> HashSet<u64> {
        let mut keep = HashSet::new();
        self.retain_into(&mut keep);
        keep
    }
}

impl Retain for () {
    fn retain_into(&self, _keep: &mut HashSet<u64>) {}
}

impl Retain for f32 {
    fn retain_into(&self, _keep: &mut HashSet<u64>) {}
}

impl<T: Retain + ?Sized> Retain for &T {
    fn retain_into(&self, keep: &mut HashSet<u64>) {
        (**self).retain_into(keep);
    }
}

impl<T: Retain> Retain for [T] {
    fn retain_into(&self, keep: &mut HashSet<u64>) {
        for item in self {
            item.retain_into(keep);
        }
    }
}

impl<T: Retain> Retain for Vec<T> {
    fn retain_into(&self, keep: &mut HashSet<u64>) {
        self.as_slice().retain_into(keep);
    }
}

impl<T: Retain> Retain for Option<T> {
    fn retain_into(&self, keep: &mut HashSet<u64>) {
        if let Some(item) = self {
            item.retain_into(keep);
        }
    }
}

macro_rules! retain_tuple {
    ($($name:ident),+) => {
        impl<$($name: Retain),+> Retain for ($($name,)+) {
            #[allow(non_snake_case)]
            fn retain_into(&self, keep: &mut HashSet<u64>) {
                let ($($name,)+) = self;
                $($name.retain_into(keep);)+
            }
        }
    };
}

retain_tuple!(A);
retain_tuple!(A, B);
retain_tuple!(A, B, C);
retain_tuple!(A, B, C, D);

#[derive(Default)]
pub struct ScopeStack {
    frames: Vec<Vec<Arc<dyn Disposable>>>,
}

impl ScopeStack {
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push(&mut self) -> usize {
        self.frames.push(Vec::new());
        debug!("disposal scope {} opened", self.frames.len());
        self.frames.len()
    }

    /// Append to the innermost scope; no-op when none is open
    pub fn register(&mut self, item: Arc<dyn Disposable>) {
        if let Some(top) = self.frames.last_mut() {
            top.push(item);
        }
    }

    /// Detach the innermost registration list
    pub fn pop(&mut self) -> Option<Vec<Arc<dyn Disposable>>> {
        self.frames.pop()
    }

    /// Hand kept items to the (new) innermost scope
    pub fn adopt(&mut self, items: Vec<Arc<dyn Disposable>>) {
        if let Some(top) = self.frames.last_mut() {
            top.extend(items);
        }
    }
}

/// Release every item not in `keep`; returns the kept items and the number
/// released
///
/// Items already released explicitly inside the scope are skipped.
pub fn release_frame(
    frame: Vec<Arc<dyn Disposable>>,
    keep: &HashSet<u64>,
) -> (Vec<Arc<dyn Disposable>>, usize) {
    let mut kept = Vec::new();
    let mut released = 0;
    for item in frame {
        if keep.contains(&item.id()) {
            kept.push(item);
        } else if !item.is_released() {
            match item.dispose() {
                Ok(()) => released += 1,
                Err(e) => warn!("scope release of {} failed: {e}", item.id()),
            }
        }
    }
    debug!(
        "disposal scope closed: {released} released, {} kept",
        kept.len()
    );
    (kept, released)
}
