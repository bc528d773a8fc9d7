use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

static IMPORT_SEMAPHORE: Lazy<Arc<Semaphore>> = Lazy::new(|| {
    let limit: Option<usize> = envmnt::get_parse("IMPORT_CONCURRENCY").ok();
    let limit = limit.filter(|v| *v > 0).unwrap_or(1);
    Arc::new(Semaphore::new(limit))
});

/// Limits how many feed imports run at once; the permit is held for the whole run
pub async fn acquire_import_permit() -> Result<OwnedSemaphorePermit, AcquireError> {
    IMPORT_SEMAPHORE.clone().acquire_owned().await
}
