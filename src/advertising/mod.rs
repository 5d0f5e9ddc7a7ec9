pub mod api;
pub mod cron;
pub mod cron_api;
pub mod directory;
pub mod gateway;
pub mod ledger;
pub mod models;
pub mod state;
pub mod store;
pub mod tracker;

use std::sync::Arc;

use crate::config::AdvertisingConfig;

pub use cron::{
    renewal_payment_id, BillingFailure, BillingOrchestrator, CronJob, CronRunError, JobReport,
    RowFailure,
};
pub use directory::{ListingDirectory, PgListingDirectory};
pub use gateway::{
    ChargeOutcome, ChargeRequest, CreditOnlyGateway, HttpPaymentGateway, PaymentGateway,
    StoredPaymentMethod,
};
pub use ledger::{CreditDraw, CreditLedger};
pub use models::{
    AdvertisingImpression, AdvertisingPayment, AdvertisingSubscription, CreditReason,
    CreditTransaction, PackageType, PaymentMethod, PaymentStatus, SubscriptionStatus,
};
pub use state::{SubscriptionEvent, SubscriptionStateMachine, TransitionOutcome};
pub use store::{AdvertisingStore, MemoryAdvertisingStore, PgAdvertisingStore};
pub use tracker::{AdTracker, TrackOutcome, TrackingValidationError};

/// key: advertising-context -> wiring shared by every advertising handler
#[derive(Clone)]
pub struct AdvertisingContext {
    pub store: Arc<dyn AdvertisingStore>,
    pub directory: Arc<dyn ListingDirectory>,
    pub config: Arc<AdvertisingConfig>,
    pub tracker: AdTracker,
    pub machine: SubscriptionStateMachine,
    pub ledger: CreditLedger,
    pub orchestrator: BillingOrchestrator,
}

impl AdvertisingContext {
    pub fn new(
        store: Arc<dyn AdvertisingStore>,
        directory: Arc<dyn ListingDirectory>,
        gateway: Arc<dyn PaymentGateway>,
        config: AdvertisingConfig,
    ) -> Self {
        let orchestrator = BillingOrchestrator::new(store.clone(), gateway, &config);
        Self {
            tracker: AdTracker::new(store.clone()),
            machine: SubscriptionStateMachine::new(store.clone()),
            ledger: CreditLedger::new(store.clone()),
            orchestrator,
            store,
            directory,
            config: Arc::new(config),
        }
    }

    /// Engine on a fresh in-memory store, which also acts as the listing directory.
    pub fn in_memory(
        gateway: Arc<dyn PaymentGateway>,
        config: AdvertisingConfig,
    ) -> (Self, Arc<MemoryAdvertisingStore>) {
        let store = Arc::new(MemoryAdvertisingStore::new());
        let context = Self::new(store.clone(), store.clone(), gateway, config);
        (context, store)
    }
}
