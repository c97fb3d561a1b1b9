// ABOUTME: Bounded admission of concurrent sandboxes per engine
// ABOUTME: Atomic check-and-increment with a guard that frees the slot on every exit path

use crate::error::{EngineError, Result};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

struct AdmissionInner {
    running: AtomicUsize,
    max: usize,
}

/// Counter of in-flight sandboxes, never above `max`.
#[derive(Clone)]
pub struct Admission {
    inner: Arc<AdmissionInner>,
}

impl Admission {
    pub fn new(max: usize) -> Self {
        Self {
            inner: Arc::new(AdmissionInner {
                running: AtomicUsize::new(0),
                max,
            }),
        }
    }

    /// Take a slot or fail immediately with `MaxConcurrencyExceeded`.
    ///
    /// The slot is held by the returned guard and handed back when the
    /// guard drops, whether the builder is discarded, fails to start or
    /// its sandbox is disposed.
    pub fn try_admit(&self) -> Result<AdmissionGuard> {
        let max = self.inner.max;
        self.inner
            .running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |running| {
                (running < max).then_some(running + 1)
            })
            .map_err(|_| EngineError::MaxConcurrencyExceeded)?;
        debug!("Admitted sandbox ({}/{})", self.running(), max);
        Ok(AdmissionGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.inner.max
    }
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("running", &self.running())
            .field("max", &self.inner.max)
            .finish()
    }
}

/// One occupied admission slot.
pub struct AdmissionGuard {
    inner: Arc<AdmissionInner>,
}

impl fmt::Debug for AdmissionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AdmissionGuard")
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.inner.running.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_is_bounded() {
        let admission = Admission::new(2);
        let first = admission.try_admit().unwrap();
        let _second = admission.try_admit().unwrap();

        assert!(matches!(
            admission.try_admit(),
            Err(EngineError::MaxConcurrencyExceeded)
        ));
        assert_eq!(admission.running(), 2);

        drop(first);
        assert_eq!(admission.running(), 1);
        assert!(admission.try_admit().is_ok());
    }

    #[test]
    fn test_rejection_does_not_touch_counter() {
        let admission = Admission::new(1);
        let _held = admission.try_admit().unwrap();
        for _ in 0..10 {
            assert!(admission.try_admit().is_err());
        }
        assert_eq!(admission.running(), 1);
    }

    #[test]
    fn test_zero_capacity_admits_nothing() {
        let admission = Admission::new(0);
        assert!(admission.try_admit().is_err());
        assert_eq!(admission.running(), 0);
    }

    #[test]
    fn test_racing_admissions_never_exceed_limit() {
        let admission = Admission::new(3);
        let barrier = Arc::new(std::sync::Barrier::new(16));
        let threads: Vec<_> = (0..16)
            .map(|_| {
                let admission = admission.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    admission.try_admit().ok()
                })
            })
            .collect();

        let guards: Vec<_> = threads
            .into_iter()
            .filter_map(|t| t.join().unwrap())
            .collect();
        assert_eq!(guards.len(), 3);
        assert_eq!(admission.running(), 3);

        drop(guards);
        assert_eq!(admission.running(), 0);
    }
}
