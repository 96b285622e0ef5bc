//! Application layer orchestrating the domain against the storage ports.
//!
//! [`engine::EngagementEngine`] owns the lifecycle and calls into
//! [`ledger::LedgerService`] for gating. [`reconciliation::PaymentReconciler`]
//! and [`sweeper::Sweeper`] re-enter the engine as the system actor.

pub mod engine;
pub mod ledger;
pub mod locks;
pub mod reconciliation;
pub mod responses;
pub mod sweeper;

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::domain::ports::{Clock, CoverageProvider, Notifier, Stores};
use engine::EngagementEngine;
use ledger::LedgerService;
use reconciliation::PaymentReconciler;
use responses::ResponseTracker;

/// Every service wired onto one set of stores.
pub struct Services {
    pub ledger: Arc<LedgerService>,
    pub engine: Arc<EngagementEngine>,
    pub reconciler: PaymentReconciler,
    pub responses: ResponseTracker,
    pub stores: Stores,
}

impl Services {
    pub fn new(
        stores: Stores,
        notifier: Arc<dyn Notifier>,
        coverage: Arc<dyn CoverageProvider>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let ledger = Arc::new(LedgerService::new(
            stores.ledgers.clone(),
            stores.subscriptions.clone(),
            clock.clone(),
        ));
        let responses = ResponseTracker::new(stores.clone(), clock.clone(), &config);
        let policy = config.unknown_reference;
        let engine = Arc::new(EngagementEngine::new(
            stores.clone(),
            ledger.clone(),
            notifier,
            coverage,
            clock.clone(),
            config,
        ));
        let reconciler =
            PaymentReconciler::new(stores.clone(), ledger.clone(), engine.clone(), clock, policy);
        Self {
            ledger,
            engine,
            reconciler,
            responses,
            stores,
        }
    }
}
