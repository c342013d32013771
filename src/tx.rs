//! Runs operations as units of work: a unit's writes become visible together or not at all.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::ForumError;
use crate::repo::{Access, Store, Transactional, Unit};

pub type UnitFuture<'u, T> = BoxFuture<'u, Result<T, ForumError>>;

#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn Store>,
    unit_timeout: Duration,
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>, unit_timeout: Duration) -> Self {
        Self { store, unit_timeout }
    }

    pub async fn read<T, F>(&self, work: F) -> Result<T, ForumError>
    where
        F: for<'u> FnOnce(&'u mut dyn Unit) -> UnitFuture<'u, T>,
    {
        self.run(Access::ReadOnly, work).await
    }

    pub async fn write<T, F>(&self, work: F) -> Result<T, ForumError>
    where
        F: for<'u> FnOnce(&'u mut dyn Unit) -> UnitFuture<'u, T>,
    {
        self.run(Access::ReadWrite, work).await
    }

    /// Commit when `work` succeeds, roll back when it fails. A unit that outlives the timeout is
    /// dropped, which discards its writes.
    pub async fn run<T, F>(&self, access: Access, work: F) -> Result<T, ForumError>
    where
        F: for<'u> FnOnce(&'u mut dyn Unit) -> UnitFuture<'u, T>,
    {
        let unit = async {
            let mut unit = self.store.begin(access).await?;
            let outcome = work(&mut *unit).await;
            match outcome {
                Ok(value) => {
                    unit.commit().await?;
                    Ok(value)
                }
                Err(e) => {
                    debug!(?access, error = %e, "rolling back unit");
                    if let Err(rb) = unit.rollback().await {
                        warn!(error = %rb, "rollback failed");
                    }
                    Err(e)
                }
            }
        };
        match tokio::time::timeout(self.unit_timeout, unit).await {
            Ok(res) => res,
            Err(_) => {
                let timeout_ms = self.unit_timeout.as_millis() as u64;
                warn!(timeout_ms, ?access, "unit of work timed out");
                Err(ForumError::Internal("unit of work timed out".into()))
            }
        }
    }
}
