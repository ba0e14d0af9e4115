//! Router registry
//!
//! Maps channel keys to their router set: one router per worker, created
//! lazily the first time a channel is used, so a channel's producers are
//! pipeable to consumers regardless of which worker they land on.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::try_join_all;
use tokio::sync::{Mutex, RwLock};

use voxcast_protocol::{ChannelKey, RouterId};

use crate::engine::{EngineResult, MediaRouter};
use crate::sfu::worker_pool::WorkerPool;

/// Load snapshot of a single router, queried from the engine on demand
/// rather than tracked by a counter that could drift from reality.
#[derive(Debug, Clone, Copy)]
pub struct RouterLoad {
    pub router_id: RouterId,
    pub live_transports: usize,
}

/// Least-loaded selection: fewest live transports wins, ties broken by
/// registration order.
pub fn select_least_loaded(loads: &[RouterLoad]) -> Option<RouterId> {
    loads
        .iter()
        .enumerate()
        .min_by_key(|(index, load)| (load.live_transports, *index))
        .map(|(_, load)| load.router_id)
}

pub struct RouterRegistry {
    pool: Arc<WorkerPool>,
    channels: RwLock<HashMap<ChannelKey, Vec<Arc<dyn MediaRouter>>>>,
    creation_locks: Mutex<HashMap<ChannelKey, Arc<Mutex<()>>>>,
}

impl RouterRegistry {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            channels: RwLock::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the channel's router set (one per worker, in parallel) if it
    /// does not exist yet. Idempotent.
    pub async fn ensure_channel(&self, channel: &ChannelKey) -> EngineResult<()> {
        if self.channels.read().await.contains_key(channel) {
            return Ok(());
        }
        let mut channels = self.channels.write().await;
        if channels.contains_key(channel) {
            return Ok(());
        }
        let routers = try_join_all(
            self.pool
                .workers()
                .iter()
                .map(|worker| worker.create_router()),
        )
        .await?;
        tracing::info!(%channel, routers = routers.len(), "created router set for channel");
        channels.insert(channel.clone(), routers);
        Ok(())
    }

    /// Picks the least-loaded router of the channel's set.
    ///
    /// Calling this for a channel that was never initialized is a
    /// programming error in the caller; `ensure_channel` must come first.
    pub async fn select_router(&self, channel: &ChannelKey) -> EngineResult<Arc<dyn MediaRouter>> {
        let routers = self.routers_for(channel).await;
        let mut loads = Vec::with_capacity(routers.len());
        for router in &routers {
            loads.push(RouterLoad {
                router_id: router.id(),
                live_transports: router.live_transport_count().await?,
            });
        }
        let Some(selected) = select_least_loaded(&loads) else {
            unreachable!("router sets always hold one router per worker");
        };
        let Some(router) = routers.into_iter().find(|router| router.id() == selected) else {
            unreachable!("selected router comes from the same snapshot");
        };
        Ok(router)
    }

    /// The channel's full router set. Same precondition as `select_router`.
    pub async fn routers_for(&self, channel: &ChannelKey) -> Vec<Arc<dyn MediaRouter>> {
        match self.channels.read().await.get(channel) {
            Some(routers) => routers.clone(),
            None => panic!(
                "router set for channel {channel} not initialized; call ensure_channel first"
            ),
        }
    }

    pub async fn router_in(
        &self,
        channel: &ChannelKey,
        router_id: RouterId,
    ) -> Option<Arc<dyn MediaRouter>> {
        self.routers_for(channel)
            .await
            .into_iter()
            .find(|router| router.id() == router_id)
    }

    /// Per-channel lock held by TransportManager across select-and-create,
    /// so two concurrent creations cannot both observe the same minimum
    /// before either transport exists.
    pub async fn channel_lock(&self, channel: &ChannelKey) -> Arc<Mutex<()>> {
        let mut locks = self.creation_locks.lock().await;
        Arc::clone(locks.entry(channel.clone()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(router_id: RouterId, live_transports: usize) -> RouterLoad {
        RouterLoad {
            router_id,
            live_transports,
        }
    }

    #[test]
    fn picks_the_router_with_fewest_live_transports() {
        let ids: Vec<RouterId> = (0..3).map(|_| RouterId::new()).collect();
        let loads = vec![load(ids[0], 4), load(ids[1], 1), load(ids[2], 2)];
        assert_eq!(select_least_loaded(&loads), Some(ids[1]));
    }

    #[test]
    fn ties_break_by_registration_order() {
        let ids: Vec<RouterId> = (0..3).map(|_| RouterId::new()).collect();
        let loads = vec![load(ids[0], 2), load(ids[1], 1), load(ids[2], 1)];
        assert_eq!(select_least_loaded(&loads), Some(ids[1]));
    }

    #[test]
    fn empty_snapshot_selects_nothing() {
        assert_eq!(select_least_loaded(&[]), None);
    }
}
