//! The shared mutable working directory: a small value behind a
//! read/write lock with a change-notification callback, scoped to one
//! conversation rather than a process-wide global.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Invoked with the new path after a successful [`MutableWorkingDir::set`].
/// Runs outside the write lock so a slow callback (e.g. persisting to the
/// store) never blocks readers.
pub type ChangeCallback = Arc<dyn Fn(&Path) + Send + Sync>;

#[derive(Clone)]
pub struct MutableWorkingDir {
    inner: Arc<RwLock<PathBuf>>,
    on_change: Option<ChangeCallback>,
}

impl MutableWorkingDir {
    pub fn new(initial: PathBuf) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
            on_change: None,
        }
    }

    pub fn with_callback(initial: PathBuf, on_change: ChangeCallback) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
            on_change: Some(on_change),
        }
    }

    pub async fn get(&self) -> PathBuf {
        self.inner.read().await.clone()
    }

    /// Updates the directory and, if a callback is registered, invokes it
    /// with the new value after releasing the write lock.
    pub async fn set(&self, new_dir: PathBuf) {
        {
            let mut guard = self.inner.write().await;
            if *guard == new_dir {
                return;
            }
            *guard = new_dir.clone();
        }
        if let Some(cb) = &self.on_change {
            cb(&new_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn get_returns_initial() {
        let wd = MutableWorkingDir::new(PathBuf::from("/tmp"));
        assert_eq!(wd.get().await, PathBuf::from("/tmp"));
    }

    #[tokio::test]
    async fn set_updates_and_invokes_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let wd = MutableWorkingDir::with_callback(
            PathBuf::from("/a"),
            Arc::new(move |_p: &Path| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        wd.set(PathBuf::from("/b")).await;
        assert_eq!(wd.get().await, PathBuf::from("/b"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn set_to_same_value_skips_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let wd = MutableWorkingDir::with_callback(
            PathBuf::from("/a"),
            Arc::new(move |_p: &Path| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        wd.set(PathBuf::from("/a")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
