use async_trait::async_trait;

use crate::model::CrashId;

/// Archival collaborator for crash-window numeric series.
///
/// The engine opens a session at activation, feeds it the points value
/// on every recomputation, and closes it at deactivation. The recorder
/// owns the OHLC-style aggregation and storage.
#[async_trait]
pub trait EventHistoryRecorder: Send + Sync {
    async fn open(&self, id: CrashId) -> anyhow::Result<()>;

    async fn record(&self, id: CrashId, value: f64, ts_ms: i64) -> anyhow::Result<()>;

    async fn close(&self, id: CrashId) -> anyhow::Result<()>;
}

/// Recorder that drops everything. For deployments and tests that do
/// not archive crash windows.
pub struct NoopHistoryRecorder;

#[async_trait]
impl EventHistoryRecorder for NoopHistoryRecorder {
    async fn open(&self, _id: CrashId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn record(&self, _id: CrashId, _value: f64, _ts_ms: i64) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self, _id: CrashId) -> anyhow::Result<()> {
        Ok(())
    }
}
