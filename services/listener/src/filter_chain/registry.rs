//! Active and warming filter chain generations.
//!
//! Readers always see a complete generation: lookups load the active
//! [`MatchIndex`] through an `ArcSwapOption` and never observe a partially
//! built one. A new batch is built into the warming slot and swapped in once
//! its init targets are ready. A newer batch replaces an older warming one,
//! whose eventual readiness notification is then ignored.

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use super::{
    BuildContext, FilterChain, FilterChainDescriptor, FilterChainFactoryBuilder, FilterChainId,
    GenerationId, MatchIndex,
};
use crate::error::Result;
use crate::init::InitManager;
use crate::network::ConnectionSocket;

/// Outcome of [`FilterChainRegistry::begin_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The generation had no pending init targets and is already active.
    Activated(Activation),
    /// The generation waits for init targets before it can go active.
    Warming {
        generation: GenerationId,
        pending_targets: usize,
    },
}

/// Record of one warm swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub generation: GenerationId,
    pub previous: Option<GenerationId>,
    /// Chains of the previous generation that the new one no longer carries.
    /// Their connections must be drained by the listener.
    pub removed_filter_chains: Vec<FilterChainId>,
}

/// A successful lookup.
#[derive(Debug, Clone)]
pub struct LookupResult {
    pub filter_chain: Arc<FilterChain>,
    /// The generation the match was made against. Connections keep it alive.
    pub generation: Arc<MatchIndex>,
}

struct Warming {
    index: Arc<MatchIndex>,
    init: InitManager,
}

/// Owns the generations of one listener's filter chains.
pub struct FilterChainRegistry {
    listener: String,
    active: ArcSwapOption<MatchIndex>,
    warming: Option<Warming>,
    next_generation: u64,
    warmed_tx: UnboundedSender<GenerationId>,
    warmed_rx: UnboundedReceiver<GenerationId>,
}

impl FilterChainRegistry {
    pub fn new(listener: impl Into<String>) -> Self {
        let (warmed_tx, warmed_rx) = unbounded_channel();
        Self {
            listener: listener.into(),
            active: ArcSwapOption::empty(),
            warming: None,
            next_generation: 1,
            warmed_tx,
            warmed_rx,
        }
    }

    pub fn listener_name(&self) -> &str {
        &self.listener
    }

    /// Build a batch into the warming slot.
    ///
    /// Chains unchanged from the active generation are reused. On error the
    /// active and warming generations are left as they were.
    pub fn begin_update(
        &mut self,
        descriptors: &[FilterChainDescriptor],
        builder: &dyn FilterChainFactoryBuilder,
    ) -> Result<UpdateOutcome> {
        let generation = GenerationId(self.next_generation);
        self.next_generation += 1;

        let mut init = InitManager::new(self.listener.clone(), generation, self.warmed_tx.clone());
        let previous = self.active.load_full();
        let index = {
            let mut context = BuildContext::new(&self.listener, &mut init);
            MatchIndex::build(
                generation,
                descriptors,
                builder,
                previous.as_deref(),
                &mut context,
            )?
        };

        if let Some(superseded) = self.warming.take() {
            info!(
                listener = %self.listener,
                generation = %superseded.index.generation(),
                superseded_by = %generation,
                pending_targets = superseded.init.pending(),
                "Discarding superseded warming generation"
            );
        }

        let ready = init.initialize();
        let pending_targets = init.pending();
        self.warming = Some(Warming {
            index: Arc::new(index),
            init,
        });

        if ready {
            if let Some(activation) = self.on_warmup_complete(generation) {
                return Ok(UpdateOutcome::Activated(activation));
            }
        }

        info!(
            listener = %self.listener,
            generation = %generation,
            pending_targets = pending_targets,
            "Filter chain generation warming"
        );
        Ok(UpdateOutcome::Warming {
            generation,
            pending_targets,
        })
    }

    /// Swap a warmed generation in.
    ///
    /// Returns `None` when `generation` is no longer the warming generation.
    pub fn on_warmup_complete(&mut self, generation: GenerationId) -> Option<Activation> {
        let is_current = self
            .warming
            .as_ref()
            .is_some_and(|warming| warming.index.generation() == generation);
        if !is_current {
            debug!(
                listener = %self.listener,
                generation = %generation,
                "Ignoring warm-up completion of a stale generation"
            );
            return None;
        }

        let warming = self.warming.take()?;
        let previous = self.active.swap(Some(Arc::clone(&warming.index)));

        info!(
            listener = %self.listener,
            generation = %generation,
            filter_chains = warming.index.len(),
            reused = warming.index.reused_count(),
            "Filter chain generation activated"
        );

        let previous_generation = previous.as_ref().map(|index| index.generation());
        let removed_filter_chains = match previous {
            Some(old) => self.retire(old),
            None => Vec::new(),
        };

        Some(Activation {
            generation,
            previous: previous_generation,
            removed_filter_chains,
        })
    }

    /// Deliver queued warm-up notifications. Called from the event loop.
    pub fn dispatch_warmed(&mut self) -> Vec<Activation> {
        let mut activations = Vec::new();
        while let Ok(generation) = self.warmed_rx.try_recv() {
            if let Some(activation) = self.on_warmup_complete(generation) {
                activations.push(activation);
            }
        }
        activations
    }

    /// Release the registry's hold on a replaced generation.
    ///
    /// Returns the chains it carried that the active generation does not. The
    /// generation itself lives on until its last connection is gone.
    pub fn retire(&mut self, old: Arc<MatchIndex>) -> Vec<FilterChainId> {
        let current: HashSet<FilterChainId> = self
            .active
            .load()
            .as_ref()
            .map(|index| index.filter_chain_ids())
            .unwrap_or_default();

        let mut removed: Vec<FilterChainId> = old
            .filter_chain_ids()
            .into_iter()
            .filter(|id| !current.contains(id))
            .collect();
        removed.sort();

        debug!(
            listener = %self.listener,
            generation = %old.generation(),
            removed_filter_chains = removed.len(),
            still_referenced = Arc::strong_count(&old) - 1,
            "Retired filter chain generation"
        );
        removed
    }

    /// Find the filter chain for a socket in the active generation.
    pub fn lookup(&self, socket: &dyn ConnectionSocket) -> Option<LookupResult> {
        let generation = match self.active.load_full() {
            Some(index) => index,
            None => {
                warn!(
                    listener = %self.listener,
                    "Filter chains are not active yet"
                );
                return None;
            }
        };

        let filter_chain = Arc::clone(generation.find(socket)?);
        Some(LookupResult {
            filter_chain,
            generation,
        })
    }

    pub fn active(&self) -> Option<Arc<MatchIndex>> {
        self.active.load_full()
    }

    pub fn active_generation(&self) -> Option<GenerationId> {
        self.active.load().as_ref().map(|index| index.generation())
    }

    pub fn warming_generation(&self) -> Option<GenerationId> {
        self.warming.as_ref().map(|warming| warming.index.generation())
    }

    /// Init targets the warming generation still waits for.
    pub fn warming_pending_targets(&self) -> usize {
        self.warming
            .as_ref()
            .map(|warming| warming.init.pending())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for FilterChainRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChainRegistry")
            .field("listener", &self.listener)
            .field("active", &self.active_generation())
            .field("warming", &self.warming_generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::filter_chain::{FactoryConfig, MatchCriteria};
    use crate::testing::{FakeChainBuilder, FakeSocket};

    fn descriptor(name: &str, port: u16) -> FilterChainDescriptor {
        FilterChainDescriptor::new(
            name,
            MatchCriteria {
                destination_port: port,
                ..Default::default()
            },
        )
        .with_filter(FactoryConfig::new("echo"))
    }

    fn socket(port: u16) -> FakeSocket {
        FakeSocket::new(
            format!("10.0.0.1:{port}").parse().unwrap(),
            "192.0.2.1:40000".parse().unwrap(),
        )
    }

    fn lookup_name(registry: &FilterChainRegistry, port: u16) -> Option<String> {
        registry
            .lookup(&socket(port))
            .map(|result| result.filter_chain.name().to_string())
    }

    fn activated(outcome: UpdateOutcome) -> Activation {
        match outcome {
            UpdateOutcome::Activated(activation) => activation,
            other => panic!("expected activation, got {other:?}"),
        }
    }

    #[test]
    fn test_lookup_before_first_update() {
        let registry = FilterChainRegistry::new("test");
        assert!(registry.lookup(&socket(80)).is_none());
        assert_eq!(registry.active_generation(), None);
    }

    #[test]
    fn test_update_without_targets_activates_immediately() {
        let mut registry = FilterChainRegistry::new("test");
        let builder = FakeChainBuilder::new();

        let activation =
            activated(registry.begin_update(&[descriptor("web", 80)], &builder).unwrap());
        assert_eq!(activation.previous, None);
        assert!(activation.removed_filter_chains.is_empty());
        assert_eq!(registry.active_generation(), Some(activation.generation));
        assert_eq!(registry.warming_generation(), None);
        assert_eq!(lookup_name(&registry, 80).as_deref(), Some("web"));
        assert_eq!(lookup_name(&registry, 81), None);
    }

    #[test]
    fn test_identical_batch_reuses_every_chain() {
        let mut registry = FilterChainRegistry::new("test");
        let builder = FakeChainBuilder::new();
        let batch = [descriptor("web", 80), descriptor("api", 8080)];

        activated(registry.begin_update(&batch, &builder).unwrap());
        let before = registry.lookup(&socket(80)).unwrap().filter_chain;

        let activation = activated(registry.begin_update(&batch, &builder).unwrap());
        assert!(activation.removed_filter_chains.is_empty());
        assert_eq!(builder.build_count(), 2);
        assert_eq!(registry.active().unwrap().reused_count(), 2);

        let after = registry.lookup(&socket(80)).unwrap().filter_chain;
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_removed_chains_reported() {
        let mut registry = FilterChainRegistry::new("test");
        let builder = FakeChainBuilder::new();

        activated(
            registry
                .begin_update(&[descriptor("web", 80), descriptor("api", 8080)], &builder)
                .unwrap(),
        );
        let old = registry.lookup(&socket(8080)).unwrap();

        let activation =
            activated(registry.begin_update(&[descriptor("web", 80)], &builder).unwrap());
        assert_eq!(activation.removed_filter_chains, vec![old.filter_chain.id()]);
        assert_eq!(lookup_name(&registry, 8080), None);

        // The retired generation stays usable by holders of the lookup result.
        assert_eq!(old.generation.generation(), activation.previous.unwrap());
        assert!(old.generation.find(&socket(8080)).is_some());
    }

    #[test]
    fn test_failed_update_keeps_active() {
        let mut registry = FilterChainRegistry::new("test");
        let builder = FakeChainBuilder::new();
        activated(registry.begin_update(&[descriptor("web", 80)], &builder).unwrap());
        let active = registry.active_generation();

        let err = registry
            .begin_update(&[descriptor("a", 90), descriptor("b", 90)], &builder)
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateMatchRule { .. }));
        assert_eq!(registry.active_generation(), active);
        assert_eq!(registry.warming_generation(), None);
        assert_eq!(lookup_name(&registry, 80).as_deref(), Some("web"));
    }

    #[test]
    fn test_init_targets_delay_activation() {
        let mut registry = FilterChainRegistry::new("test");
        let builder = FakeChainBuilder::new().with_init_targets();

        let outcome = registry.begin_update(&[descriptor("web", 80)], &builder).unwrap();
        let generation = match outcome {
            UpdateOutcome::Warming {
                generation,
                pending_targets,
            } => {
                assert_eq!(pending_targets, 1);
                generation
            }
            other => panic!("expected warming, got {other:?}"),
        };
        assert_eq!(registry.warming_generation(), Some(generation));
        assert!(registry.lookup(&socket(80)).is_none());
        assert!(registry.dispatch_warmed().is_empty());

        for target in builder.take_init_targets() {
            target.ready();
        }
        let activations = registry.dispatch_warmed();
        assert_eq!(activations.len(), 1);
        assert_eq!(activations[0].generation, generation);
        assert_eq!(lookup_name(&registry, 80).as_deref(), Some("web"));
    }

    #[test]
    fn test_superseded_warming_is_discarded() {
        let mut registry = FilterChainRegistry::new("test");
        let builder = FakeChainBuilder::new().with_init_targets();

        registry.begin_update(&[descriptor("first", 80)], &builder).unwrap();
        let first_targets = builder.take_init_targets();

        registry.begin_update(&[descriptor("second", 80)], &builder).unwrap();
        let second_targets = builder.take_init_targets();

        for target in first_targets {
            target.ready();
        }
        assert!(registry.dispatch_warmed().is_empty());
        assert_eq!(registry.active_generation(), None);

        for target in second_targets {
            target.ready();
        }
        assert_eq!(registry.dispatch_warmed().len(), 1);
        assert_eq!(lookup_name(&registry, 80).as_deref(), Some("second"));
        assert_eq!(registry.warming_generation(), None);
    }

    #[test]
    fn test_stale_completion_ignored() {
        let mut registry = FilterChainRegistry::new("test");
        let builder = FakeChainBuilder::new();
        let activation =
            activated(registry.begin_update(&[descriptor("web", 80)], &builder).unwrap());
        assert!(registry.on_warmup_complete(activation.generation).is_none());
        assert!(registry.on_warmup_complete(GenerationId(99)).is_none());
    }
}
