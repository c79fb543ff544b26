//! Latency Information Protocol engine
//!
//! A LIP node sits on a CEC bus between an optional downstream device (the
//! direction audio/video flows) and up to sixteen upstream peers. On open
//! it discovers whether its downstream neighbour speaks the protocol,
//! merges the two device identities, and from then on answers latency
//! queries from upstream: served from its own latency tables, from the
//! per-identity downstream cache, or by forwarding a single query down the
//! chain and composing the answer.
//!
//! The engine runs two background threads (discovery worker and timeout
//! timer) next to the bus receive callback and blocking API callers; all of
//! them serialize on one internal lock. The CEC transport, cache
//! persistence and identity merging are supplied by the host through the
//! interfaces in [`bus`].

pub mod bus;
pub mod cache;
pub mod config;

mod dispatch;
mod node;
mod pending;
mod state;
mod timer;

pub use lip_proto as proto;

pub use bus::{
    BusError, CachePersistence, Callbacks, CecBus, ConnectionStatus, MessageReceiver, NodeStatus,
    StatusListener, UuidMerge,
};
pub use cache::LatencyCache;
pub use config::{
    Config, RenderMode, UUID_AUDIO_MODE_MASK, UUID_DEVICE_MASK, UUID_VIDEO_MODE_MASK,
};
pub use node::{LipNode, UpstreamRemoval};

/// Errors surfaced by the public API
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LipError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("configuration update rejected: {0}")]
    ConfigRejected(&'static str),
    #[error("no configuration change requested")]
    NoChange,
    #[error("downstream device address is unknown")]
    DownstreamUnknown,
    #[error("invalid video format")]
    InvalidVideoFormat,
    #[error("invalid audio format")]
    InvalidAudioFormat,
    #[error("latency request aborted")]
    Aborted,
    #[error("transmit failed")]
    Transmit,
}

#[cfg(test)]
mod tests;
