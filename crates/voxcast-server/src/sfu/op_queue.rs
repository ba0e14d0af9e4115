//! Pause/resume operation queue
//!
//! Engine pause/resume calls are asynchronous; issuing a resume while a
//! pause is still in flight can leave the engine disagreeing with our
//! bookkeeping. This queue drains one operation at a time, each awaited
//! before the next is issued, so operations on any given producer or
//! consumer apply in submission order. A single global queue trades
//! throughput for simplicity; operations on independent targets could be
//! issued concurrently but are serialized along with everything else.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::engine::{MediaConsumer, MediaProducer};

#[derive(Clone)]
pub enum PauseTarget {
    Producer(Arc<dyn MediaProducer>),
    Consumer(Arc<dyn MediaConsumer>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseAction {
    Pause,
    Resume,
}

enum Op {
    Apply {
        target: PauseTarget,
        action: PauseAction,
    },
    Flush(oneshot::Sender<()>),
}

pub struct OperationQueue {
    tx: mpsc::UnboundedSender<Op>,
}

impl OperationQueue {
    pub fn start() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    Op::Apply { target, action } => {
                        let result = match (&target, action) {
                            (PauseTarget::Producer(p), PauseAction::Pause) => p.pause().await,
                            (PauseTarget::Producer(p), PauseAction::Resume) => p.resume().await,
                            (PauseTarget::Consumer(c), PauseAction::Pause) => c.pause().await,
                            (PauseTarget::Consumer(c), PauseAction::Resume) => c.resume().await,
                        };
                        if let Err(error) = result {
                            // The target may have closed while queued.
                            tracing::warn!(%error, ?action, "queued pause/resume failed");
                        }
                    }
                    Op::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        Arc::new(Self { tx })
    }

    pub fn enqueue(&self, target: PauseTarget, action: PauseAction) {
        let _ = self.tx.send(Op::Apply { target, action });
    }

    /// Barrier: resolves once every previously enqueued operation has been
    /// applied.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Op::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}
