pub mod control;
pub mod handler;
pub mod peers;
pub mod runtime;
pub mod sync;

pub use control::{ControlApi, ControlError, HttpControlClient};
pub use handler::ClusterHandler;
pub use peers::{PeerRecord, PeerState, PeerTable, SUSPECT_AFTER};
pub use runtime::{CtpPeer, Inbound, ListenerHandle, NetError, RequestHandler, Responder};
pub use sync::{SyncEngine, SyncError};
