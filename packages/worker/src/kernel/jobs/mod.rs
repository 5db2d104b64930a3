//! Durable job infrastructure: the queue contract, the Postgres
//! implementation, the per-job state machine, and the polling loop.
//!
//! ```text
//! Poller (single-flight tick)
//!     │
//!     ├─► JobStore.claim (FOR UPDATE SKIP LOCKED)
//!     └─► Processor.process(job)
//!             ├─► SnapshotResolver → TemplateRenderer → RenderPool
//!             ├─► OutputValidator → BlobStore → JobStore.complete
//!             └─► RetryPolicy on any failure
//! ```

pub mod job;
pub mod pg_store;
pub mod poller;
pub mod processor;
pub mod retry;
pub mod store;
pub mod testing;

pub use job::{CompletedArtifact, Job, JobFamily, JobKind, JobState, QueueStats};
pub use pg_store::PgJobStore;
pub use poller::{Poller, PollerConfig};
pub use processor::{ProcessError, Processor};
pub use retry::{
    backoff_delay_seconds, classify, decide, Classification, ErrorCategory, RetryDecision,
    BACKOFF_BASE_SECS, BACKOFF_CAP_SECS, MAX_RETRIES,
};
pub use store::{JobStore, ProcessingFields, StoreError, STALE_THRESHOLD_SECS};
