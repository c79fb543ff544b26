//! Shared engine state
//!
//! Everything the worker thread, the timer, the receive path, and API
//! callers coordinate on lives in [`Core`], guarded by the single engine
//! mutex.

use std::time::Duration;

use heapless::Vec;
use lip_proto::format::{AudioFormat, VideoFormat, AUDIO_CODECS};
use lip_proto::opcode::LipOpcode;
use lip_proto::{LogicalAddress, INVALID_LATENCY, MAX_UPSTREAM_DEVICES};

use crate::bus::{Callbacks, ConnectionStatus, NodeStatus};
use crate::cache::LatencyCache;
use crate::config::Config;
use crate::pending::PendingTable;
use crate::timer::TimerControl;

/// Reply deadline for a source node (no upstream peers yet)
pub(crate) const SOURCE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Reply deadline for a hub; an upstream peer is waiting on us, so we give
/// up on our own downstream sooner
pub(crate) const HUB_TIMEOUT: Duration = Duration::from_millis(1000);

/// IEC 61937 decoding delay in milliseconds, indexed by audio codec.
/// AC3 = 7, EAC3 = 47, MAT = 6, everything else adds nothing.
pub(crate) const IEC_DECODING_DELAY: [u8; AUDIO_CODECS] = [
    0, 7, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 47, 6, 0, 0, 0, 0, 0, 0, 0, 0,
    0,
];

/// Downstream discovery progression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Init,
    WaitForReply,
    Supported,
    Unsupported,
}

impl DiscoveryState {
    /// Discovery finished, one way or the other
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Supported | Self::Unsupported)
    }
}

/// Which latency composition a lookup wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LatencyKind {
    /// Only what this node adds
    Own,
    /// Only the downstream chain
    Downstream,
    /// Own plus downstream, clamped
    Total,
}

/// The downstream device as learned from discovery
#[derive(Debug)]
pub(crate) struct DownstreamDevice {
    pub addr: Option<LogicalAddress>,
    pub uuid: Option<u32>,
    pub cache: LatencyCache,
}

pub(crate) struct Core {
    pub state: DiscoveryState,
    pub running: bool,
    pub worker_signaled: bool,
    pub config: Config,
    pub downstream: DownstreamDevice,
    pub pending: PendingTable,
    /// Peers that announced themselves with REQUEST_LIP_SUPPORT
    pub upstream: Vec<LogicalAddress, MAX_UPSTREAM_DEVICES>,
    /// Last LIP opcode transmitted per destination, to match feature aborts
    pub last_sent: [Option<LipOpcode>; 16],
    /// Formats of the in-flight downstream query, as the requester asked
    pub req_video_format: Option<VideoFormat>,
    pub req_audio_format: Option<AudioFormat>,
    /// Audio format actually sent downstream (differs under transcoding);
    /// cache entries for downstream audio are keyed by this
    pub sent_audio_format: Option<AudioFormat>,
    /// Add the IEC decoding delay to own audio latencies (TV driving an
    /// audio system discovered through the transmit-only path)
    pub add_iec_decoding_latency: bool,
    pub timer: Option<TimerControl>,
    /// Generation of the most recent arming; stale fires are ignored
    pub timer_generation: Option<u32>,
}

impl Core {
    pub fn new(config: Config) -> Self {
        Self {
            state: DiscoveryState::Init,
            running: true,
            worker_signaled: false,
            config,
            downstream: DownstreamDevice {
                addr: None,
                uuid: None,
                cache: LatencyCache::new(true),
            },
            pending: PendingTable::default(),
            upstream: Vec::new(),
            last_sent: [None; 16],
            req_video_format: None,
            req_audio_format: None,
            sent_audio_format: None,
            add_iec_decoding_latency: false,
            timer: None,
            timer_generation: None,
        }
    }

    /// Restart discovery from scratch; the upstream set survives, buffered
    /// requests keep their slots
    pub fn reset_discovery(&mut self) {
        self.state = DiscoveryState::Init;
        self.downstream.addr = None;
        self.downstream.uuid = None;
        self.add_iec_decoding_latency = false;
        self.last_sent = [None; 16];
        self.timer_generation = None;
    }

    pub fn upstream_present(&self) -> bool {
        !self.upstream.is_empty()
    }

    /// Register an upstream peer; returns false when already known or the
    /// set is full
    pub fn add_upstream(&mut self, addr: LogicalAddress) -> bool {
        if self.upstream.contains(&addr) {
            return false;
        }
        self.upstream.push(addr).is_ok()
    }

    pub fn remove_upstream_peer(&mut self, addr: LogicalAddress) {
        self.upstream.retain(|peer| *peer != addr);
    }

    pub fn remove_all_upstream(&mut self) {
        self.upstream.clear();
    }

    /// Deadline for answering: sources may wait longer than hubs
    pub fn timeout_value(&self) -> Duration {
        if self.upstream_present() {
            HUB_TIMEOUT
        } else {
            SOURCE_TIMEOUT
        }
    }

    /// Identity transmitted upstream: own uuid merged with the downstream
    /// one once that is known
    pub fn merged_uuid(&self, callbacks: &Callbacks) -> u32 {
        match self.downstream.uuid {
            Some(downstream) => callbacks.merge_uuid.merge(self.config.uuid, downstream),
            None => self.config.uuid,
        }
    }

    pub fn status_snapshot(&self) -> NodeStatus {
        let mut connections = ConnectionStatus::empty();
        if self.upstream_present() {
            connections |= ConnectionStatus::UPSTREAM_CONNECTED;
        }
        if self.downstream.addr.is_some() {
            connections |= ConnectionStatus::DOWNSTREAM_CONNECTED;
        }
        NodeStatus {
            connections,
            downstream_addr: self.downstream.addr,
            downstream_uuid: self.downstream.uuid,
            upstream: self.upstream.clone(),
        }
    }

    /// Clamped latency addition: an invalid operand poisons the sum, an
    /// overflow saturates just below the invalid marker
    pub fn sum_latencies(a: u8, b: u8) -> u8 {
        if a == INVALID_LATENCY || b == INVALID_LATENCY {
            return INVALID_LATENCY;
        }
        let sum = a as u16 + b as u16;
        if sum >= INVALID_LATENCY as u16 {
            INVALID_LATENCY - 1
        } else {
            sum as u8
        }
    }

    /// Own audio latency including the IEC decoding delay when enabled
    pub fn own_audio_latency(&self, format: AudioFormat) -> u8 {
        let decoding_delay = if self.add_iec_decoding_latency {
            IEC_DECODING_DELAY
                .get(format.codec.0 as usize)
                .copied()
                .unwrap_or(0)
        } else {
            0
        };
        Self::sum_latencies(self.config.audio_latency(format), decoding_delay)
    }

    pub fn own_video_latency(&self, format: VideoFormat) -> u8 {
        self.config.video_latency(format)
    }

    /// Audio latency lookup; `downstream_format` keys the cache (it differs
    /// from `format` under transcoding). `None` means the downstream value
    /// is needed but not cached.
    pub fn audio_latency_from_cache(
        &self,
        format: AudioFormat,
        downstream_format: AudioFormat,
        kind: LatencyKind,
    ) -> Option<u8> {
        let own = self.own_audio_latency(format);
        match kind {
            LatencyKind::Own => Some(Self::sum_latencies(own, 0)),
            LatencyKind::Downstream => self
                .downstream
                .cache
                .audio_latency(downstream_format)
                .map(|downstream| Self::sum_latencies(0, downstream)),
            LatencyKind::Total => self
                .downstream
                .cache
                .audio_latency(downstream_format)
                .map(|downstream| Self::sum_latencies(own, downstream)),
        }
    }

    pub fn video_latency_from_cache(&self, format: VideoFormat, kind: LatencyKind) -> Option<u8> {
        let own = self.own_video_latency(format);
        match kind {
            LatencyKind::Own => Some(Self::sum_latencies(own, 0)),
            LatencyKind::Downstream => self
                .downstream
                .cache
                .video_latency(format)
                .map(|downstream| Self::sum_latencies(0, downstream)),
            LatencyKind::Total => self
                .downstream
                .cache
                .video_latency(format)
                .map(|downstream| Self::sum_latencies(own, downstream)),
        }
    }
}
