use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::schemes::{IdGenerator, SchemeRegistry};
use crate::stress::cancel::CancelToken;
use crate::stress::config::StressConfig;
use crate::stress::error::{StressError, StressResult};
use crate::stress::guard::{GuardStats, ResourceGuard, ResourceProbe};
use crate::stress::processor::{SchemeProcessor, SchemeResult};

/// Runs every configured scheme, at most `max_parallel_schemes` at a time.
pub struct StressRunner {
    config: Arc<StressConfig>,
    registry: SchemeRegistry,
    guard: ResourceGuard,
    cancel: CancelToken,
}

impl StressRunner {
    pub fn new(config: StressConfig) -> StressResult<Self> {
        Ok(Self {
            config: Arc::new(config.normalized()?),
            registry: SchemeRegistry::builtin(),
            guard: ResourceGuard::system(),
            cancel: CancelToken::new(),
        })
    }

    pub fn with_registry(mut self, registry: SchemeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.guard = ResourceGuard::new(probe);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &StressConfig {
        &self.config
    }

    pub fn guard_stats(&self) -> GuardStats {
        self.guard.stats()
    }

    /// Returns one result per scheme in configuration order, or the first
    /// real failure. A failing scheme cancels its siblings; nothing partial
    /// is returned.
    pub async fn run(&self) -> StressResult<Vec<SchemeResult>> {
        // Unknown schemes fail here, before any scratch space exists.
        let mut generators: Vec<(String, Arc<dyn IdGenerator>)> = Vec::new();
        for name in &self.config.schemes {
            generators.push((name.clone(), self.registry.resolve(name)?));
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_schemes));
        let mut tasks = JoinSet::new();
        let mut scheduled = 0usize;

        for (position, (scheme, generator)) in generators.into_iter().enumerate() {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|_| StressError::Cancelled)?;
            if self.cancel.is_cancelled() {
                break;
            }

            info!("starting scheme {} ({}/{})", scheme, position + 1, self.config.schemes.len());
            let processor = SchemeProcessor::new(
                &scheme,
                generator,
                Arc::clone(&self.config),
                self.guard.clone(),
                self.cancel.clone(),
            );
            let cancel = self.cancel.clone();

            tasks.spawn_blocking(move || {
                let _permit = permit;
                let result = processor.run();
                if let Err(e) = &result {
                    if !e.is_cancelled() {
                        error!("scheme {} failed: {}", scheme, e);
                        cancel.cancel();
                    }
                }
                (position, result)
            });
            scheduled += 1;
        }

        let mut slots: Vec<Option<SchemeResult>> = Vec::new();
        slots.resize_with(self.config.schemes.len(), || None);
        let mut failure: Option<StressError> = None;

        while let Some(joined) = tasks.join_next().await {
            let (position, result) = match joined {
                Ok(pair) => pair,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => {
                    warn!("scheme task did not complete: {}", e);
                    record_failure(&mut failure, StressError::Cancelled);
                    continue;
                }
            };
            match result {
                Ok(result) => slots[position] = Some(result),
                Err(e) => record_failure(&mut failure, e),
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if scheduled < slots.len() {
            return Err(StressError::Cancelled);
        }

        slots
            .into_iter()
            .map(|slot| slot.ok_or(StressError::Cancelled))
            .collect()
    }
}

/// Keeps the first real failure; cancellation only fills an empty slot.
fn record_failure(slot: &mut Option<StressError>, error: StressError) {
    let replace = match slot {
        None => true,
        Some(existing) => existing.is_cancelled() && !error.is_cancelled(),
    };
    if replace {
        *slot = Some(error);
    }
}

/// Builds a runner over the built-in schemes and the system probe.
pub async fn run(config: StressConfig, cancel: CancelToken) -> StressResult<Vec<SchemeResult>> {
    StressRunner::new(config)?.with_cancel(cancel).run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_failure_beats_cancellation() {
        let mut slot = None;
        record_failure(&mut slot, StressError::Cancelled);
        record_failure(&mut slot, StressError::consistency("boom"));
        record_failure(&mut slot, StressError::manifest("later"));
        assert!(matches!(slot, Some(StressError::ConsistencyFault { .. })));
    }
}
