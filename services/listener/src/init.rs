//! Warm-up dependencies of a warming generation.
//!
//! A chain builder may register named targets (a certificate fetch, a
//! dependent resource) while a generation is being built. The generation is
//! eligible to go active once every target has called [`InitTarget::ready`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::filter_chain::GenerationId;

#[derive(Debug)]
struct InitShared {
    manager: String,
    generation: GenerationId,
    // One extra count is held by the manager until `initialize` so that
    // targets finishing during the build cannot signal readiness early.
    pending: AtomicUsize,
    notify: UnboundedSender<GenerationId>,
}

impl InitShared {
    fn release(&self) -> bool {
        let remaining = self.pending.fetch_sub(1, Ordering::AcqRel) - 1;
        remaining == 0
    }
}

/// Tracks the targets of one warming generation.
#[derive(Debug)]
pub struct InitManager {
    shared: Arc<InitShared>,
    targets: Vec<String>,
    initialized: bool,
}

impl InitManager {
    pub(crate) fn new(
        name: impl Into<String>,
        generation: GenerationId,
        notify: UnboundedSender<GenerationId>,
    ) -> Self {
        Self {
            shared: Arc::new(InitShared {
                manager: name.into(),
                generation,
                pending: AtomicUsize::new(1),
                notify,
            }),
            targets: Vec::new(),
            initialized: false,
        }
    }

    /// Register a target that must become ready before the generation warms.
    pub fn add_target(&mut self, name: impl Into<String>) -> InitTarget {
        let name = name.into();
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        debug!(
            manager = %self.shared.manager,
            generation = %self.shared.generation,
            target = %name,
            "Init target registered"
        );
        self.targets.push(name.clone());
        InitTarget {
            name,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stop accepting targets and release the build guard.
    ///
    /// Returns true if every target is already ready. Otherwise the last
    /// target to become ready queues a notification for the generation.
    pub(crate) fn initialize(&mut self) -> bool {
        if self.initialized {
            return self.is_ready();
        }
        self.initialized = true;
        self.shared.release()
    }

    /// Number of targets still outstanding.
    pub fn pending(&self) -> usize {
        let raw = self.shared.pending.load(Ordering::Acquire);
        if self.initialized {
            raw
        } else {
            raw.saturating_sub(1)
        }
    }

    pub fn is_ready(&self) -> bool {
        self.initialized && self.shared.pending.load(Ordering::Acquire) == 0
    }

    pub fn target_names(&self) -> &[String] {
        &self.targets
    }

    pub fn generation(&self) -> GenerationId {
        self.shared.generation
    }
}

/// Handle a dependency uses to report readiness.
#[derive(Debug)]
pub struct InitTarget {
    name: String,
    shared: Arc<InitShared>,
}

impl InitTarget {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark this target ready. Consumes the handle so it can fire only once.
    pub fn ready(self) {
        debug!(
            manager = %self.shared.manager,
            generation = %self.shared.generation,
            target = %self.name,
            "Init target ready"
        );
        if self.shared.release() {
            // The registry may already be gone during shutdown.
            let _ = self.shared.notify.send(self.shared.generation);
        }
    }
}
