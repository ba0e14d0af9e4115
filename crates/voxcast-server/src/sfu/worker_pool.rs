//! Media worker pool
//!
//! Owns one engine worker per configured core. Worker death leaves that
//! worker's routers in an unrecoverable state, so it is fatal for the
//! whole control process; supervising infrastructure restarts us.

use std::sync::Arc;

use crate::engine::{EngineResult, MediaEngine, MediaWorker, WorkerSettings};

pub struct WorkerPool {
    workers: Vec<Arc<dyn MediaWorker>>,
}

impl WorkerPool {
    pub async fn start(
        engine: &Arc<dyn MediaEngine>,
        size: usize,
        settings: &WorkerSettings,
    ) -> EngineResult<Arc<Self>> {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        for _ in 0..size {
            let worker = engine.spawn_worker(settings).await?;
            tokio::spawn(monitor(Arc::clone(&worker)));
            tracing::info!(worker = %worker.id(), "created media worker");
            workers.push(worker);
        }
        tracing::info!(size, "media worker pool started");
        Ok(Arc::new(Self { workers }))
    }

    pub fn workers(&self) -> &[Arc<dyn MediaWorker>] {
        &self.workers
    }
}

async fn monitor(worker: Arc<dyn MediaWorker>) {
    let reason = worker.died().await;
    tracing::error!(worker = %worker.id(), %reason, "media worker died, terminating");
    std::process::exit(1);
}
