//! Worker and job identity helpers.

use uuid::Uuid;

/// Default worker identity when `WORKER_ID` is unset.
pub fn default_worker_id() -> String {
    format!("worker-{}", std::process::id())
}

/// Fresh job id for enqueued rows.
pub fn new_job_id() -> Uuid {
    Uuid::new_v4()
}
