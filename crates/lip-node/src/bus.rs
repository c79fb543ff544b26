//! Collaborator interfaces
//!
//! The engine consumes a CEC bus for transmit/receive and an optional
//! persistence store for cache blobs; it produces status-change
//! notifications and asks the host to merge device identities. All
//! callbacks may be invoked with the engine lock held, so implementations
//! must not call back into the node from inside them.

use bitflags::bitflags;
use heapless::Vec;
use lip_proto::{CecMessage, LogicalAddress, MAX_UPSTREAM_DEVICES};

/// Receive hook installed on the bus at open; returns true when the frame
/// was consumed by the protocol
pub type MessageReceiver = Box<dyn Fn(&CecMessage) -> bool + Send + Sync>;

/// Transmit failure, surfaced on the wire as a timeout on the peer's side
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cec transmit failed")]
pub struct BusError;

/// CEC bus adapter
pub trait CecBus: Send + Sync {
    /// Own logical address on the bus; must not be the broadcast address
    fn logical_address(&self) -> LogicalAddress;

    /// Transmit one frame
    ///
    /// Called with the engine lock held; the implementation must not invoke
    /// the registered receiver synchronously from here.
    fn transmit(&self, message: &CecMessage) -> Result<(), BusError>;

    /// Install the receive hook
    ///
    /// The engine registers exactly once at open. The hook holds only a
    /// weak handle to the engine and consumes nothing once the node is
    /// closed, so the bus may keep it past the node's lifetime.
    fn register_receiver(&self, receiver: MessageReceiver);
}

/// Persistent store for latency cache blobs, keyed by downstream identity
///
/// The blob is opaque to the store; it round-trips unchanged.
pub trait CachePersistence: Send + Sync {
    fn store(&self, uuid: u32, data: &[u8]);

    /// Read a blob into `buf`, returning the number of bytes read. Anything
    /// short of a full read discards the blob.
    fn read(&self, uuid: u32, buf: &mut [u8]) -> usize;
}

/// Notification of connection changes (new upstream peer, downstream
/// identity learned or replaced)
pub trait StatusListener: Send + Sync {
    fn status_changed(&self, status: &NodeStatus);
}

/// Combines this node's identity with the downstream one; the result is
/// what upstream peers see
pub trait UuidMerge: Send + Sync {
    fn merge(&self, own_uuid: u32, downstream_uuid: u32) -> u32;
}

impl<F> UuidMerge for F
where
    F: Fn(u32, u32) -> u32 + Send + Sync,
{
    fn merge(&self, own_uuid: u32, downstream_uuid: u32) -> u32 {
        self(own_uuid, downstream_uuid)
    }
}

/// Host callbacks handed to [`crate::LipNode::open`]
pub struct Callbacks {
    /// Identity merge, required for every node that may face upstream peers
    pub merge_uuid: Box<dyn UuidMerge>,
    pub persistence: Option<Box<dyn CachePersistence>>,
    pub status: Option<Box<dyn StatusListener>>,
}

impl Callbacks {
    pub fn new(merge_uuid: Box<dyn UuidMerge>) -> Self {
        Self {
            merge_uuid,
            persistence: None,
            status: None,
        }
    }
}

bitflags! {
    /// Connection summary flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConnectionStatus: u32 {
        const DOWNSTREAM_CONNECTED = 1 << 0;
        const UPSTREAM_CONNECTED = 1 << 1;
    }
}

/// Snapshot of the node's connections
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeStatus {
    pub connections: ConnectionStatus,
    /// Downstream peer, once it confirmed protocol support
    pub downstream_addr: Option<LogicalAddress>,
    pub downstream_uuid: Option<u32>,
    /// Upstream peers that asked for protocol support
    pub upstream: Vec<LogicalAddress, MAX_UPSTREAM_DEVICES>,
}
