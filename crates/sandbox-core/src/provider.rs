use async_trait::async_trait;
use sandbox_types::{
    Capabilities, CreateRequest, ExecRequest, ExecResult, HealthStatus, ListFilesRequest,
    ListFilesResult, ReadFileRequest, ReadFileResult, WriteFileRequest,
};

use crate::error::CoreResult;

/// The uniform sandbox contract every backend driver implements. Modeled as
/// a trait object (`Arc<dyn Provider>`) rather than an enum of backends —
/// the orchestrator only ever needs `capabilities()` plus these ten
/// operations, never the concrete backend type.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a sandbox and returns its provider-local id. Must roll back
    /// any partial allocation on failure — no orphaned resources.
    async fn create(&self, req: CreateRequest) -> CoreResult<String>;

    /// Idempotent: destroying an already-gone sandbox is not an error.
    async fn destroy(&self, id: &str) -> CoreResult<()>;

    async fn stop(&self, id: &str) -> CoreResult<()>;

    async fn resume(&self, id: &str) -> CoreResult<()>;

    async fn exec(&self, id: &str, req: ExecRequest) -> CoreResult<ExecResult>;

    async fn read_file(&self, id: &str, req: ReadFileRequest) -> CoreResult<ReadFileResult>;

    async fn write_file(&self, id: &str, req: WriteFileRequest) -> CoreResult<()>;

    async fn list_files(&self, id: &str, req: ListFilesRequest) -> CoreResult<ListFilesResult>;

    /// Fails with [`crate::error::CoreError::SnapshotNotSupported`] on
    /// backends without the capability.
    async fn snapshot(&self, id: &str) -> CoreResult<String>;

    async fn create_from_snapshot(
        &self,
        snapshot_id: &str,
        req: CreateRequest,
    ) -> CoreResult<String>;

    /// Must never throw; an unreachable backend reports `healthy: false`.
    async fn health(&self) -> HealthStatus;

    /// Pure and stateless.
    fn capabilities(&self) -> Capabilities;
}
