//! SFU orchestration: worker pool, routers, sessions, and the media
//! entity managers the signaling layer drives.

pub mod consumer_manager;
pub mod op_queue;
pub mod producer_manager;
pub mod router_registry;
pub mod session_registry;
pub mod transport_manager;
pub mod worker_pool;

pub use consumer_manager::{ConsumerDescriptor, ConsumerManager};
pub use op_queue::{OperationQueue, PauseAction, PauseTarget};
pub use producer_manager::ProducerManager;
pub use router_registry::RouterRegistry;
pub use session_registry::ClientSessionRegistry;
pub use transport_manager::{TransportManager, TransportSettings};
pub use worker_pool::WorkerPool;
