//! # taskrelay queue
//!
//! Queue semantics (enqueue, claim, complete, observe result) on top of a
//! remote key-value store that only offers independent `get`, `put` with TTL,
//! `delete` and `list(prefix)`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────────────────────────────────────┐
//! │ RequestShaper│──►│                    TaskQueue                      │
//! └──────────────┘   │  enqueue / get_request / store_result / claim    │
//!                    └───────┬────────────────────────┬─────────────────┘
//!                            │                        │
//!                            ▼                        ▼
//!                ┌──────────────────────┐  ┌──────────────────────┐
//!                │   TaskIndexCache     │  │  LeaseCoordinator    │
//!                │ (one list per window)│  │ (one list per claim) │
//!                └──────────┬───────────┘  └──────────┬───────────┘
//!                           └────────────┬────────────┘
//!                                        ▼
//!                         ┌──────────────────────────────┐
//!                         │ KvStore (HTTP / in-memory)   │
//!                         └──────────────────────────────┘
//! ```
//!
//! Reads that depend on enumeration degrade closed: a stale index is served
//! only within the staleness tolerance, and a failed lease enumeration means
//! nothing is claimable. Writes always surface their errors.
//!
//! Claims race: the store has no conditional write, so two workers can both
//! acquire the same task. Handlers must be safe to run twice.
//!
//! ## Example
//!
//! ```ignore
//! use taskrelay_queue::prelude::*;
//!
//! let store = Arc::new(HttpKvStore::new(HttpKvConfig::from_env()?)?);
//! let queue = TaskQueue::new(store, QueueConfig::from_env()?);
//!
//! let acceptance = queue
//!     .submit(TaskPayload::new("chat_message", "slack", "hello").with_priority("high"))
//!     .await?;
//!
//! if let Some(claimed) = queue.claim("worker-1").await? {
//!     queue
//!         .store_result(&claimed.task.id, TaskResult::completed("done"))
//!         .await?;
//! }
//! ```

pub mod clock;
pub mod config;
pub mod delivery;
pub mod handler;
pub mod index;
pub mod keys;
pub mod lease;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod shaper;
pub mod store;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ClaimVerification, DeliveryMode, FallbackPolicy, QueueConfig};
    pub use crate::delivery::{build_delivery, DeliveryError, DeliveryOutcome, TaskDelivery};
    pub use crate::handler::{HandlerError, TaskHandler};
    pub use crate::model::{
        Acceptance, Priority, ResultRecord, ResultStatus, TaskId, TaskRecord, TaskResult,
    };
    pub use crate::queue::{ClaimedTask, QueueError, TaskQueue};
    pub use crate::shaper::TaskPayload;
    pub use crate::store::{HttpKvConfig, HttpKvStore, InMemoryKvStore, KvStore, StoreError};
    pub use std::sync::Arc;
}

// Re-export key types at crate root
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    env_secs, ClaimVerification, ConfigError, DeliveryMode, FallbackPolicy, QueueConfig,
};
pub use delivery::{
    build_delivery, DeliveryError, DeliveryFailure, DeliveryOutcome, DirectDelivery,
    KvQueueDelivery, TaskDelivery, WebhookDelivery,
};
pub use handler::{HandlerError, TaskHandler};
pub use index::{IndexRead, IndexSnapshot, ReadSource, TaskIndexCache};
pub use keys::KeySpace;
pub use lease::{AcquireOutcome, LeaseCoordinator};
pub use model::{
    Acceptance, AcceptanceStatus, LeaseRecord, Priority, ResultRecord, ResultStatus, TaskId,
    TaskRecord, TaskResult, ValidationError,
};
pub use queue::{CancelOutcome, ClaimedTask, QueueError, TaskQueue};
pub use shaper::{Classifier, PassthroughClassifier, RequestShaper, ShaperLimits, TaskPayload};
pub use store::{HttpKvConfig, HttpKvStore, InMemoryKvStore, KvStore, StoreError};
