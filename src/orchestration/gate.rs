//! # Mutation Gate
//!
//! Serializes the mutating broker verbs (provision, deprovision, bind, unbind). The gate is
//! held for the whole verb, provider call included, so those verbs run in a single total
//! order across every instance.
//!
//! Callers pass the instance id they are about to mutate. The id is currently only logged;
//! the gate can become per-instance later without touching call sites.
//!
//! ```rust
//! use cache_broker::orchestration::MutationGate;
//!
//! # tokio_test::block_on(async {
//! let gate = MutationGate::new();
//! let pass = gate.enter("instance-a").await;
//! assert!(gate.try_enter("instance-b").is_none());
//! drop(pass);
//! assert!(gate.try_enter("instance-b").is_some());
//! # });
//! ```

use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
pub struct MutationGate {
    lock: Mutex<()>,
}

/// Held while a mutating verb runs; releases the gate on drop
#[derive(Debug)]
pub struct GatePass<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl MutationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enter(&self, instance_id: &str) -> GatePass<'_> {
        let waiting_since = Instant::now();
        let guard = self.lock.lock().await;
        debug!(
            instance_id = instance_id,
            waited_ms = waiting_since.elapsed().as_millis() as u64,
            "Mutation gate acquired"
        );
        GatePass { _guard: guard }
    }

    /// Non-blocking variant, `None` when another verb holds the gate
    pub fn try_enter(&self, instance_id: &str) -> Option<GatePass<'_>> {
        let guard = self.lock.try_lock().ok()?;
        debug!(instance_id = instance_id, "Mutation gate acquired");
        Some(GatePass { _guard: guard })
    }
}
