pub mod billing;
pub mod cache;
pub mod exchange;
pub mod explorer;
pub mod notifications;
pub mod reconciler;
pub mod redis_store;
pub mod store;
pub mod subscriptions;
pub mod verification;
pub mod worker;

pub use billing::{BillOutcome, BillingEngine, BillingReport};
pub use cache::{CacheKey, CacheService, CacheStats};
pub use exchange::{format_currency, ExchangeService, RateProviderKind, RateTable};
pub use explorer::{ExplorerClient, ExplorerError, ExplorerRequest};
pub use notifications::{
    DispatcherStatus, LogSender, NotificationDispatcher, NotificationSender, SendError,
    WebhookSender,
};
pub use reconciler::{Outcome, ReconcileReport, Reconciler};
pub use redis_store::RedisStore;
pub use store::{MemoryStore, RecordStore, StoreError, StoreResult, SubscriptionFilter};
pub use subscriptions::{NewSubscription, SubscriptionService};
pub use verification::VerificationService;
pub use worker::{PeriodicWorker, Sweep, WorkerStatus};
