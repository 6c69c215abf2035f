//! Component G: lifecycle (§4.G).
//!
//! The original serializes init/teardown on a three-state CAS word;
//! §9 design notes call that a portability artifact and recommend an
//! idempotent-init pattern instead. This is modeled with a plain
//! `Mutex<bool>` guarding the up/down transition: `open`/`close` are
//! each idempotent, and unlike a one-shot cell, the pair can cycle
//! (open, close, open again) since teardown must be able to run and a
//! later re-init must be possible.

use std::sync::Mutex;

use crate::error::TqResult;

/// Hooks the lifecycle drives on open/close. A real deployment wires
/// these to the partition's timer wheel and stream subsystem starter;
/// tests use no-op closures.
pub trait LifecycleHooks: Send + Sync {
    fn start_timer_wheel(&self) -> TqResult<()>;
    fn stop_timer_wheel(&self);
    fn start_stream_subsystem(&self) -> TqResult<()>;
    fn stop_stream_subsystem(&self);
}

pub struct Lifecycle {
    hooks: Box<dyn LifecycleHooks>,
    up: Mutex<bool>,
}

impl Lifecycle {
    pub fn new(hooks: Box<dyn LifecycleHooks>) -> Self {
        Self { hooks, up: Mutex::new(false) }
    }

    /// Idempotent: a second `open` while already up is a no-op success.
    pub fn open(&self) -> TqResult<()> {
        let mut up = self.up.lock().unwrap();
        if *up {
            tracing::debug!("lifecycle open: already up");
            return Ok(());
        }
        self.hooks.start_timer_wheel()?;
        self.hooks.start_stream_subsystem()?;
        *up = true;
        tracing::info!("tq lifecycle up");
        Ok(())
    }

    /// Idempotent: closing an already-down instance is a no-op.
    pub fn close(&self) {
        let mut up = self.up.lock().unwrap();
        if !*up {
            tracing::debug!("lifecycle close: already down");
            return;
        }
        self.hooks.stop_stream_subsystem();
        self.hooks.stop_timer_wheel();
        *up = false;
        tracing::info!("tq lifecycle down");
    }

    pub fn is_up(&self) -> bool {
        *self.up.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingHooks {
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    impl LifecycleHooks for CountingHooks {
        fn start_timer_wheel(&self) -> TqResult<()> {
            Ok(())
        }
        fn stop_timer_wheel(&self) {}
        fn start_stream_subsystem(&self) -> TqResult<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn stop_stream_subsystem(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn open_and_close_are_idempotent() {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let lc = Lifecycle::new(Box::new(CountingHooks { starts: starts.clone(), stops: stops.clone() }));
        lc.open().unwrap();
        lc.open().unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(lc.is_up());

        lc.close();
        lc.close();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(!lc.is_up());
    }
}
