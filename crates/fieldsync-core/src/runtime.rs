//! Wiring of the sync core services from one configuration.

use std::sync::Arc;

use crate::api::SyncApi;
use crate::config::CoreConfig;
use crate::conflict::ConflictEngine;
use crate::connectivity::{ConnectivityMonitor, ManualConnectivity};
use crate::error::{Error, Result};
use crate::exchange::ServerExchange;
use crate::orchestrator::{SyncOrchestrator, SyncServices};
use crate::priority::PriorityAssigner;
use crate::scheduler::{Clock, Scheduler, SystemClock};
use crate::services::{QueueService, Store};
use crate::tracker::UpdateTracker;

/// Every service of the sync core, sharing one store, clock and scheduler
#[derive(Clone)]
pub struct SyncRuntime {
    config: CoreConfig,
    services: SyncServices,
    connectivity: Arc<dyn ConnectivityMonitor>,
    orchestrator: SyncOrchestrator,
}

impl SyncRuntime {
    pub fn builder(config: CoreConfig) -> SyncRuntimeBuilder {
        SyncRuntimeBuilder {
            config,
            store: None,
            clock: None,
            connectivity: None,
            exchange: None,
        }
    }

    pub const fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub const fn store(&self) -> &Store {
        &self.services.store
    }

    pub const fn queue(&self) -> &QueueService {
        &self.services.queue
    }

    pub const fn conflicts(&self) -> &ConflictEngine {
        &self.services.conflicts
    }

    pub const fn tracker(&self) -> &UpdateTracker {
        &self.services.tracker
    }

    pub const fn scheduler(&self) -> &Scheduler {
        &self.services.scheduler
    }

    pub const fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    pub fn connectivity(&self) -> &dyn ConnectivityMonitor {
        self.connectivity.as_ref()
    }

    /// Request/response facade over the services
    pub fn api(&self) -> SyncApi {
        SyncApi::new(
            self.services.conflicts.clone(),
            self.services.tracker.clone(),
            self.orchestrator.clone(),
            Arc::clone(self.services.scheduler.clock()),
        )
    }
}

pub struct SyncRuntimeBuilder {
    config: CoreConfig,
    store: Option<Store>,
    clock: Option<Arc<dyn Clock>>,
    connectivity: Option<Arc<dyn ConnectivityMonitor>>,
    exchange: Option<Arc<dyn ServerExchange>>,
}

impl SyncRuntimeBuilder {
    #[must_use]
    pub fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to the system clock
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to a [`ManualConnectivity`] that reports online
    #[must_use]
    pub fn connectivity(mut self, connectivity: Arc<dyn ConnectivityMonitor>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    #[must_use]
    pub fn exchange(mut self, exchange: Arc<dyn ServerExchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn build(self) -> Result<SyncRuntime> {
        let Self {
            config,
            store,
            clock,
            connectivity,
            exchange,
        } = self;
        config.validate()?;
        let store = store.ok_or_else(|| Error::Config("a local store is required".to_string()))?;
        let exchange =
            exchange.ok_or_else(|| Error::Config("a server exchange is required".to_string()))?;
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let connectivity =
            connectivity.unwrap_or_else(|| Arc::new(ManualConnectivity::default()));

        let assigner = Arc::new(PriorityAssigner::new(
            config.priority.clone(),
            Arc::clone(&clock),
        )?);
        let scheduler = Scheduler::new(Arc::clone(&clock));
        let queue = QueueService::new(store.clone(), assigner, Arc::clone(&clock));
        let conflicts = ConflictEngine::new(
            store.clone(),
            Arc::clone(&clock),
            config.severity.clone(),
            config.resolution.clone(),
        );
        let tracker = UpdateTracker::new(
            store.clone(),
            queue.clone(),
            scheduler.clone(),
            config.retry.clone(),
        );
        let services = SyncServices {
            store,
            queue,
            conflicts,
            tracker,
            scheduler,
        };
        let orchestrator = SyncOrchestrator::new(
            services.clone(),
            exchange,
            Arc::clone(&connectivity),
            config.sync.clone(),
        );

        Ok(SyncRuntime {
            config,
            services,
            connectivity,
            orchestrator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedExchange;

    #[test]
    fn build_requires_store_and_exchange() {
        let missing_store = SyncRuntime::builder(CoreConfig::default())
            .exchange(ScriptedExchange::new())
            .build();
        assert!(matches!(missing_store, Err(Error::Config(_))));

        let missing_exchange = SyncRuntime::builder(CoreConfig::default())
            .store(Store::open_in_memory().unwrap())
            .build();
        assert!(matches!(missing_exchange, Err(Error::Config(_))));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let mut config = CoreConfig::default();
        config.sync.max_parallel_exchanges = 0;
        let result = SyncRuntime::builder(config)
            .store(Store::open_in_memory().unwrap())
            .exchange(ScriptedExchange::new())
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn defaults_to_an_online_monitor() {
        let runtime = SyncRuntime::builder(CoreConfig::default())
            .store(Store::open_in_memory().unwrap())
            .exchange(ScriptedExchange::new())
            .build()
            .unwrap();
        assert!(runtime.connectivity().current_status().is_online);
        assert!(runtime.orchestrator().can_sync());
    }
}
