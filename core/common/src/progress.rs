//! Progress reporting for uploads.
//!
//! Observers are advisory: a callback can never stop or alter an upload.
//! Cancellation goes through a cancellation token instead.

use std::marker::PhantomData;

/// Progress observation emitted after every chunk the server acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadProgress {
    /// Remote file name being uploaded.
    pub file_name: String,
    /// Bytes the server has acknowledged so far.
    pub bytes_committed: u64,
    /// Total size of the upload.
    pub total_bytes: u64,
    /// 1-based index of the chunk just acknowledged.
    pub chunk_index: u64,
    /// Number of chunks in the session.
    pub chunk_count: u64,
}

impl UploadProgress {
    /// Fraction of the upload committed, in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            self.bytes_committed as f64 / self.total_bytes as f64
        }
    }
}

/// Generic progress callback trait.
///
/// Type parameter `T` is the progress data type.
pub trait ProgressCallback<T>: Send + Sync {
    /// Called with progress updates.
    fn on_progress(&self, progress: &T);
}

/// A no-op progress callback.
pub struct NoOpProgress;

impl<T> ProgressCallback<T> for NoOpProgress {
    fn on_progress(&self, _progress: &T) {}
}

/// A progress callback that wraps a closure.
pub struct FnProgress<F, T> {
    callback: F,
    _marker: PhantomData<fn(&T)>,
}

impl<F, T> FnProgress<F, T>
where
    F: Fn(&T) + Send + Sync,
{
    /// Create a new closure-based progress callback.
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            _marker: PhantomData,
        }
    }
}

impl<F, T> ProgressCallback<T> for FnProgress<F, T>
where
    F: Fn(&T) + Send + Sync,
{
    fn on_progress(&self, progress: &T) {
        (self.callback)(progress)
    }
}

/// Create a progress callback from a closure.
pub fn progress_fn<F, T>(f: F) -> FnProgress<F, T>
where
    F: Fn(&T) + Send + Sync,
{
    FnProgress::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn sample(committed: u64) -> UploadProgress {
        UploadProgress {
            file_name: "a.pdf".to_string(),
            bytes_committed: committed,
            total_bytes: 1000,
            chunk_index: 1,
            chunk_count: 4,
        }
    }

    #[test]
    fn test_fn_progress_receives_updates() {
        let last = Arc::new(AtomicU64::new(0));
        let seen = last.clone();
        let callback = progress_fn(move |p: &UploadProgress| {
            seen.store(p.bytes_committed, Ordering::SeqCst);
        });

        callback.on_progress(&sample(250));
        callback.on_progress(&sample(500));

        assert_eq!(last.load(Ordering::SeqCst), 500);
    }

    #[test]
    fn test_noop_progress() {
        <NoOpProgress as ProgressCallback<UploadProgress>>::on_progress(&NoOpProgress, &sample(1));
    }

    #[test]
    fn test_fraction() {
        assert!((sample(250).fraction() - 0.25).abs() < f64::EPSILON);
        let empty = UploadProgress {
            total_bytes: 0,
            ..sample(0)
        };
        assert_eq!(empty.fraction(), 1.0);
    }
}
