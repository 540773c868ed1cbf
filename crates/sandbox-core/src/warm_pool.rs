//! Pre-created sandboxes of a single preferred provider kind, handed out
//! under a latency budget. One mutex guards the pool slice and target size,
//! the same single-lock discipline used for the other in-memory registries
//! in this crate.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sandbox_types::{ContainerKind, CreateRequest, ProviderKind};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::CoreResult;
use crate::provider::Provider;

#[derive(Debug, Clone)]
pub struct WarmEntry {
    pub provider_local_id: String,
    pub provider_kind: ProviderKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WarmPoolMetrics {
    pub hits: u64,
    pub misses: u64,
    pub current_size: usize,
    pub target_size: usize,
}

struct Inner {
    entries: Vec<WarmEntry>,
    target_size: usize,
}

pub struct WarmPool {
    provider_kind: ProviderKind,
    provider: Arc<dyn Provider>,
    replenish_timeout: Duration,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl WarmPool {
    pub fn new(provider_kind: ProviderKind, provider: Arc<dyn Provider>, target_size: usize) -> Arc<Self> {
        Arc::new(Self {
            provider_kind,
            provider,
            replenish_timeout: Duration::from_secs(30),
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                target_size,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub async fn is_enabled(&self) -> bool {
        self.inner.lock().await.target_size > 0
    }

    /// Creates up to the target size sequentially. A partial failure
    /// shrinks the resulting pool but does not fail start; each failure is
    /// logged individually.
    pub async fn start(self: &Arc<Self>) {
        let target = self.inner.lock().await.target_size;
        for _ in 0..target {
            match self.create_one().await {
                Ok(entry) => self.inner.lock().await.entries.push(entry),
                Err(err) => warn!(error = %err, "warm pool entry creation failed"),
            }
        }
    }

    async fn create_one(&self) -> CoreResult<WarmEntry> {
        let req = CreateRequest {
            container_kind: ContainerKind::Workspace,
            ..Default::default()
        };
        let provider_local_id = self.provider.create(req).await?;
        Ok(WarmEntry {
            provider_local_id,
            provider_kind: self.provider_kind,
            created_at: Utc::now(),
        })
    }

    /// Scans for the first entry of `kind`, removes it and returns it. On a
    /// hit, asynchronously kicks off one replenishment; the hit path itself
    /// never waits on it.
    pub async fn acquire(self: &Arc<Self>, kind: ProviderKind) -> Option<WarmEntry> {
        if kind != self.provider_kind {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let entry = {
            let mut guard = self.inner.lock().await;
            let pos = guard.entries.iter().position(|e| e.provider_kind == kind);
            pos.map(|i| guard.entries.remove(i))
        };

        match entry {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("warm_pool_acquire_hits", 1);
                let pool = self.clone();
                tokio::spawn(async move {
                    let _ = tokio::time::timeout(pool.replenish_timeout, pool.replenish_one()).await;
                });
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("warm_pool_acquire_misses", 1);
                None
            }
        }
    }

    async fn replenish_one(&self) {
        match self.create_one().await {
            Ok(entry) => {
                let mut guard = self.inner.lock().await;
                if guard.entries.len() < guard.target_size {
                    guard.entries.push(entry);
                } else {
                    // Target shrank while the replenishment was in flight;
                    // the backing sandbox still gets destroyed by whatever
                    // reaps unowned entries, nothing to do here.
                }
            }
            Err(err) => warn!(error = %err, "warm pool replenishment failed"),
        }
    }

    /// Smaller destroys the trailing excess (front entries survive);
    /// larger creates the difference. Equal is a no-op. Negative sizes
    /// are rejected by the `usize` type itself.
    pub async fn resize(self: &Arc<Self>, new_size: usize) {
        let (to_destroy, to_create) = {
            let mut guard = self.inner.lock().await;
            let old_size = guard.entries.len();
            guard.target_size = new_size;
            if new_size < old_size {
                let removed = guard.entries.split_off(new_size);
                (removed, 0)
            } else {
                (Vec::new(), new_size.saturating_sub(old_size))
            }
        };

        for entry in to_destroy {
            if let Err(err) = self.provider.destroy(&entry.provider_local_id).await {
                warn!(error = %err, id = %entry.provider_local_id, "failed to destroy excess warm entry");
            }
        }

        for _ in 0..to_create {
            match self.create_one().await {
                Ok(entry) => self.inner.lock().await.entries.push(entry),
                Err(err) => warn!(error = %err, "warm pool resize creation failed"),
            }
        }
    }

    /// Destroys every held entry and clears the pool. Idempotent: calling
    /// Stop on an already-empty pool is a no-op.
    pub async fn stop(&self) {
        let entries = std::mem::take(&mut self.inner.lock().await.entries);
        for entry in entries {
            if let Err(err) = self.provider.destroy(&entry.provider_local_id).await {
                warn!(error = %err, id = %entry.provider_local_id, "failed to destroy warm entry on stop");
            }
        }
    }

    pub async fn metrics(&self) -> WarmPoolMetrics {
        let guard = self.inner.lock().await;
        WarmPoolMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            current_size: guard.entries.len(),
            target_size: guard.target_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sandbox_types::{
        Capabilities, ExecRequest, ExecResult, HealthStatus, ListFilesRequest, ListFilesResult,
        ReadFileRequest, ReadFileResult, WriteFileRequest,
    };
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    struct CountingProvider {
        created: StdAtomicU64,
    }

    #[async_trait]
    impl Provider for CountingProvider {
        async fn create(&self, _req: CreateRequest) -> CoreResult<String> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("warm-{n}"))
        }
        async fn destroy(&self, _id: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn stop(&self, _id: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn resume(&self, _id: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn exec(&self, _id: &str, _req: ExecRequest) -> CoreResult<ExecResult> {
            unimplemented!()
        }
        async fn read_file(&self, _id: &str, _req: ReadFileRequest) -> CoreResult<ReadFileResult> {
            unimplemented!()
        }
        async fn write_file(&self, _id: &str, _req: WriteFileRequest) -> CoreResult<()> {
            Ok(())
        }
        async fn list_files(&self, _id: &str, _req: ListFilesRequest) -> CoreResult<ListFilesResult> {
            unimplemented!()
        }
        async fn snapshot(&self, _id: &str) -> CoreResult<String> {
            unimplemented!()
        }
        async fn create_from_snapshot(&self, _s: &str, _r: CreateRequest) -> CoreResult<String> {
            unimplemented!()
        }
        async fn health(&self) -> HealthStatus {
            HealthStatus { healthy: true, message: String::new(), active_count: 0 }
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                name: "counting",
                supports_persistence: false,
                supports_snapshots: false,
                supports_warm_pool: true,
                requires_kvm: false,
                estimated_startup_ms: 0,
                provider_kind: ProviderKind::UserKernel,
            }
        }
    }

    #[tokio::test]
    async fn start_populates_to_target_size() {
        let provider = Arc::new(CountingProvider { created: StdAtomicU64::new(0) });
        let pool = WarmPool::new(ProviderKind::UserKernel, provider, 2);
        pool.start().await;
        let metrics = pool.metrics().await;
        assert_eq!(metrics.current_size, 2);
        assert_eq!(metrics.target_size, 2);
    }

    #[tokio::test]
    async fn acquire_hit_decrements_pool_and_counts_hit() {
        let provider = Arc::new(CountingProvider { created: StdAtomicU64::new(0) });
        let pool = WarmPool::new(ProviderKind::UserKernel, provider, 2);
        pool.start().await;

        let entry = pool.acquire(ProviderKind::UserKernel).await;
        assert!(entry.is_some());
        assert_eq!(pool.metrics().await.current_size, 1);
        assert_eq!(pool.metrics().await.hits, 1);
    }

    #[tokio::test]
    async fn acquire_wrong_kind_misses() {
        let provider = Arc::new(CountingProvider { created: StdAtomicU64::new(0) });
        let pool = WarmPool::new(ProviderKind::UserKernel, provider, 1);
        pool.start().await;

        let entry = pool.acquire(ProviderKind::MicroVm).await;
        assert!(entry.is_none());
        assert_eq!(pool.metrics().await.misses, 1);
        assert_eq!(pool.metrics().await.current_size, 1);
    }

    #[tokio::test]
    async fn resize_down_keeps_front_entries() {
        let provider = Arc::new(CountingProvider { created: StdAtomicU64::new(0) });
        let pool = WarmPool::new(ProviderKind::UserKernel, provider, 3);
        pool.start().await;
        pool.resize(1).await;
        assert_eq!(pool.metrics().await.current_size, 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let provider = Arc::new(CountingProvider { created: StdAtomicU64::new(0) });
        let pool = WarmPool::new(ProviderKind::UserKernel, provider, 1);
        pool.start().await;
        pool.stop().await;
        pool.stop().await;
        assert_eq!(pool.metrics().await.current_size, 0);
    }
}
