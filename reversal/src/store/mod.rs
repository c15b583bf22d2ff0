pub mod sqlite_store;

use async_trait::async_trait;

use crate::model::{CrashId, PriceCrashState};

/// Durable storage for completed crash episodes.
#[async_trait]
pub trait CrashRecordStore: Send + Sync {
    async fn save(&self, record: &PriceCrashState) -> anyhow::Result<()>;

    async fn find(&self, id: CrashId) -> anyhow::Result<Option<PriceCrashState>>;

    /// Reverse-chronological page of records. `start_at_event_time` is
    /// an exclusive cursor: the record carrying it is never repeated.
    async fn list(
        &self,
        limit: u32,
        start_at_event_time: Option<i64>,
    ) -> anyhow::Result<Vec<PriceCrashState>>;
}
