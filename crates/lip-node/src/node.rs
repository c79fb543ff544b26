//! Public engine handle
//!
//! [`LipNode`] owns the worker and timer threads and the monitor they share
//! with the bus receive path and API callers: one mutex around [`Core`],
//! plus condition variables for the worker, for discovery watchers and for
//! pending-request waiters.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use lip_proto::command;
use lip_proto::format::{AudioFormat, VideoFormat};
use lip_proto::opcode::LipOpcode;
use lip_proto::{CecMessage, LogicalAddress, INVALID_LATENCY};

use crate::bus::{Callbacks, CecBus, NodeStatus};
use crate::config::Config;
use crate::dispatch::{self, SlotOutcome};
use crate::pending::SlotState;
use crate::state::{Core, DiscoveryState, LatencyKind};
use crate::timer::{FireOutcome, Timer};
use crate::LipError;

/// Upper bound on re-issued wire queries per blocking call; a downstream
/// that keeps answering with mismatched reports fails the call instead of
/// looping forever
const MAX_QUERY_ATTEMPTS: u32 = 3;

/// Which upstream peers a configuration update forgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpstreamRemoval {
    #[default]
    None,
    Peer(LogicalAddress),
    All,
}

pub(crate) struct Shared {
    pub core: Mutex<Core>,
    /// Wakes the discovery worker
    pub worker_cv: Condvar,
    /// Signalled when discovery reaches a settled state
    pub state_cv: Condvar,
    /// Signalled on every pending-slot transition that may release a waiter
    pub pending_cv: Condvar,
    pub bus: Box<dyn CecBus>,
    pub callbacks: Callbacks,
    pub own_addr: LogicalAddress,
}

/// A running protocol node
///
/// Dropping the handle is equivalent to [`LipNode::close`].
pub struct LipNode {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    timer: Option<Timer>,
}

impl LipNode {
    /// Validate the configuration, wire up the bus and start the worker and
    /// timer threads
    pub fn open(
        config: Config,
        callbacks: Callbacks,
        bus: Box<dyn CecBus>,
    ) -> Result<Self, LipError> {
        let own_addr = bus.logical_address();
        if own_addr.is_broadcast() {
            return Err(LipError::InvalidConfig(
                "own logical address must not be the broadcast address",
            ));
        }
        config.validate().map_err(LipError::InvalidConfig)?;

        let shared = Arc::new(Shared {
            core: Mutex::new(Core::new(config)),
            worker_cv: Condvar::new(),
            state_cv: Condvar::new(),
            pending_cv: Condvar::new(),
            bus,
            callbacks,
            own_addr,
        });

        let timer_shared = Arc::downgrade(&shared);
        let timer = Timer::spawn(move |generation| timer_fired(&timer_shared, generation));
        shared.core.lock().timer = Some(timer.control());

        let receive_shared = Arc::downgrade(&shared);
        shared.bus.register_receiver(Box::new(move |msg| {
            match receive_shared.upgrade() {
                Some(shared) => {
                    let mut core = shared.core.lock();
                    dispatch::handle_cec_message(&mut core, &shared, msg)
                }
                None => false,
            }
        }));

        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || worker_loop(worker_shared));

        Ok(Self {
            shared,
            worker: Some(worker),
            timer: Some(timer),
        })
    }

    /// Stop both threads and persist the cache for the current downstream
    /// identity
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(mut timer) = self.timer.take() {
            timer.stop();
        }
        let Some(worker) = self.worker.take() else {
            return;
        };
        {
            let mut core = self.shared.core.lock();
            core.running = false;
            core.worker_signaled = true;
        }
        self.shared.worker_cv.notify_all();
        let _ = worker.join();

        let core = self.shared.core.lock();
        if let (Some(_), Some(uuid)) = (core.downstream.addr, core.downstream.uuid) {
            if let Some(store) = &self.shared.callbacks.persistence {
                store.store(uuid, &core.downstream.cache.to_bytes());
            }
        }
    }

    /// Connection snapshot; with `wait_for_discovery` the call blocks until
    /// discovery settles
    pub fn status(&self, wait_for_discovery: bool) -> NodeStatus {
        let mut core = self.shared.core.lock();
        if wait_for_discovery {
            while !core.state.is_settled() {
                self.shared.state_cv.wait(&mut core);
            }
        }
        core.status_snapshot()
    }

    /// Downstream audio and video latency for the given formats, querying
    /// the downstream device on a cache miss
    ///
    /// The returned values are the downstream chain only; callers compose
    /// them with their own rendering latency. 255 marks a dimension the
    /// downstream cannot provide.
    pub fn av_latency(
        &self,
        video: VideoFormat,
        audio: AudioFormat,
    ) -> Result<(u8, u8), LipError> {
        if !video.is_valid() {
            return Err(LipError::InvalidVideoFormat);
        }
        if !audio.is_valid() {
            return Err(LipError::InvalidAudioFormat);
        }
        self.blocking_query(Query::Av { video, audio })
    }

    /// Downstream audio latency only
    pub fn audio_latency(&self, audio: AudioFormat) -> Result<u8, LipError> {
        if !audio.is_valid() {
            return Err(LipError::InvalidAudioFormat);
        }
        self.blocking_query(Query::Audio { audio })
            .map(|(_, audio)| audio)
    }

    /// Downstream video latency only
    pub fn video_latency(&self, video: VideoFormat) -> Result<u8, LipError> {
        if !video.is_valid() {
            return Err(LipError::InvalidVideoFormat);
        }
        self.blocking_query(Query::Video { video })
            .map(|(video, _)| video)
    }

    fn blocking_query(&self, query: Query) -> Result<(u8, u8), LipError> {
        let shared = &*self.shared;
        let mut core = shared.core.lock();
        if core.downstream.addr.is_none() {
            log::debug!("downstream address unknown, latency query not sent");
            return Err(LipError::DownstreamUnknown);
        }

        let mut attempts = 0;
        loop {
            if let Some(result) = query.probe(&core) {
                return Ok(result);
            }

            if core.pending.get(shared.own_addr).is_some() {
                // an earlier local query is still in flight; wait our turn
                let timeout = core.timeout_value();
                let _ = shared.pending_cv.wait_for(&mut core, timeout);
                continue;
            }

            if attempts >= MAX_QUERY_ATTEMPTS {
                return Err(LipError::Aborted);
            }
            attempts += 1;

            let Some(destination) = core.downstream.addr else {
                return Err(LipError::DownstreamUnknown);
            };
            let request = query.build(shared.own_addr, destination);
            let mut responses = Vec::new();
            let produced =
                dispatch::handle_local_latency_request(&mut core, shared, &request, &mut responses);

            let mut wait = false;
            let mut aborted = false;
            if produced {
                match responses.first() {
                    Some(first) if command::lip_opcode(first) != Some(query.report_opcode()) => {
                        // cache miss: the handler produced the downstream
                        // query, put it on the wire and wait for the answer
                        if dispatch::transmit(&mut core, shared, first).is_ok() {
                            wait = true;
                        } else {
                            aborted = true;
                        }
                    }
                    _ => {
                        // served from cache; the next probe picks it up
                    }
                }
            } else {
                // buffered behind the in-flight downstream query
                wait = true;
            }

            if wait && !await_own_slot(shared, &mut core) {
                aborted = true;
            }
            if aborted {
                return Err(LipError::Aborted);
            }
        }
    }

    /// Apply a configuration update
    ///
    /// Latency-table, render-mode and transcoding changes are only accepted
    /// together with a new UUID; a rejected update changes nothing. A
    /// downstream address change or `force_discovery` restarts discovery,
    /// keeping the upstream set but dropping the cache. A UUID change is
    /// announced to every upstream peer with the freshly merged identity.
    pub fn set_config(
        &self,
        new_config: Option<&Config>,
        force_discovery: bool,
        remove_upstream: UpstreamRemoval,
    ) -> Result<(), LipError> {
        let shared = &*self.shared;
        let mut core = shared.core.lock();

        if new_config.is_none() && !force_discovery && remove_upstream == UpstreamRemoval::None {
            return Err(LipError::NoChange);
        }

        let mut discovery = force_discovery;
        let mut update_uuid = false;
        if let Some(new) = new_config {
            new.validate().map_err(LipError::InvalidConfig)?;
            update_uuid = new.uuid != core.config.uuid;
            if core.config.downstream_addr != new.downstream_addr {
                discovery = true;
            }
            if !update_uuid {
                if core.config.render_mode != new.render_mode {
                    log::warn!("render mode change without a uuid change, rejecting");
                    return Err(LipError::ConfigRejected(
                        "render mode change requires a uuid change",
                    ));
                }
                if core.config.audio_transcoding != new.audio_transcoding {
                    log::warn!("audio transcoding change without a uuid change, rejecting");
                    return Err(LipError::ConfigRejected(
                        "audio transcoding change requires a uuid change",
                    ));
                }
                if core.config.audio_transcoding
                    && core.config.audio_transcoding_format != new.audio_transcoding_format
                {
                    log::warn!("transcoding format change without a uuid change, rejecting");
                    return Err(LipError::ConfigRejected(
                        "transcoding format change requires a uuid change",
                    ));
                }
                if core.config.video_latencies != new.video_latencies
                    || core.config.audio_latencies != new.audio_latencies
                {
                    log::warn!("latency table change without a uuid change, rejecting");
                    return Err(LipError::ConfigRejected(
                        "latency table change requires a uuid change",
                    ));
                }
            }
            core.config = new.clone();
        }

        match remove_upstream {
            UpstreamRemoval::None => {}
            UpstreamRemoval::Peer(addr) => core.remove_upstream_peer(addr),
            UpstreamRemoval::All => core.remove_all_upstream(),
        }

        if discovery {
            log::info!("restarting downstream discovery");
            core.reset_discovery();
            core.downstream.cache.clear(true, true);
            dispatch::reschedule_timer(&mut core);
            core.worker_signaled = true;
            shared.worker_cv.notify_all();
        }

        if update_uuid && core.upstream_present() {
            let merged = core.merged_uuid(&shared.callbacks);
            let mut failed = false;
            for peer in core.upstream.clone() {
                log::debug!("announcing new identity {merged:#010x} to {peer:?}");
                let msg = command::report_lip_support(
                    shared.own_addr,
                    peer,
                    lip_proto::PROTOCOL_VERSION,
                    merged,
                    true,
                );
                if dispatch::transmit(&mut core, shared, &msg).is_err() {
                    failed = true;
                }
            }
            if failed {
                return Err(LipError::Transmit);
            }
        }
        Ok(())
    }
}

impl Drop for LipNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wait until our own slot settles; true means "probe the cache again",
/// false means the request failed
fn await_own_slot(shared: &Shared, core: &mut MutexGuard<'_, Core>) -> bool {
    let deadline = Instant::now() + core.timeout_value();
    loop {
        match core.pending.state(shared.own_addr) {
            Some(SlotState::AnswerReceived) => {
                core.pending.complete(shared.own_addr);
                return true;
            }
            Some(SlotState::AbortReceived) => {
                log::warn!("local latency query was aborted");
                core.pending.complete(shared.own_addr);
                return false;
            }
            // settled underneath us (served from cache during a drain)
            None => return true,
            Some(_) => {
                if shared.pending_cv.wait_until(core, deadline).timed_out() {
                    log::warn!("no answer for the local latency query in time");
                    core.pending.complete(shared.own_addr);
                    return false;
                }
            }
        }
    }
}

/// A blocking latency query, dispatched through the same path as peer
/// requests
enum Query {
    Av { video: VideoFormat, audio: AudioFormat },
    Audio { audio: AudioFormat },
    Video { video: VideoFormat },
}

impl Query {
    /// Downstream-only cache probe; unused dimensions read as invalid
    fn probe(&self, core: &Core) -> Option<(u8, u8)> {
        match *self {
            Query::Av { video, audio } => {
                let video = core.video_latency_from_cache(video, LatencyKind::Downstream)?;
                let audio = core.audio_latency_from_cache(audio, audio, LatencyKind::Downstream)?;
                Some((video, audio))
            }
            Query::Audio { audio } => core
                .audio_latency_from_cache(audio, audio, LatencyKind::Downstream)
                .map(|audio| (INVALID_LATENCY, audio)),
            Query::Video { video } => core
                .video_latency_from_cache(video, LatencyKind::Downstream)
                .map(|video| (video, INVALID_LATENCY)),
        }
    }

    fn build(&self, initiator: LogicalAddress, destination: LogicalAddress) -> CecMessage {
        match *self {
            Query::Av { video, audio } => {
                command::request_av_latency(initiator, destination, video, audio)
            }
            Query::Audio { audio } => command::request_audio_latency(initiator, destination, audio),
            Query::Video { video } => command::request_video_latency(initiator, destination, video),
        }
    }

    fn report_opcode(&self) -> LipOpcode {
        match self {
            Query::Av { .. } => LipOpcode::ReportAvLatency,
            Query::Audio { .. } => LipOpcode::ReportAudioLatency,
            Query::Video { .. } => LipOpcode::ReportVideoLatency,
        }
    }
}

/// Timer expiry: abort the in-flight downstream query
fn timer_fired(shared: &Weak<Shared>, generation: u32) -> FireOutcome {
    let Some(shared) = shared.upgrade() else {
        return FireOutcome::Done;
    };
    // try-lock: a blocked API caller holds the engine lock while waiting on
    // the pending CV; never sleep on the lock from the timer thread
    let Some(mut core) = shared.core.try_lock() else {
        return FireOutcome::Retry;
    };
    if core.timer_generation != Some(generation) {
        return FireOutcome::Done;
    }
    let Some(sent_addr) = core.pending.sent_addr() else {
        return FireOutcome::Done;
    };
    let slot_opcode = core
        .pending
        .get(sent_addr)
        .and_then(|slot| command::lip_opcode(&slot.msg));

    let outcome = if sent_addr == shared.own_addr {
        log::warn!("no reply within {:?}", core.timeout_value());
        SlotOutcome::AbortReceived
    } else if slot_opcode.is_some_and(|op| {
        op == LipOpcode::RequestLipSupport || op.is_latency_request()
    }) {
        // cancel the stalled request chain with a feature abort so the
        // upstream peer is not left waiting
        log::warn!(
            "no reply within {:?}, refusing {:?}",
            core.timeout_value(),
            sent_addr
        );
        let abort = command::feature_abort(
            shared.own_addr,
            sent_addr,
            lip_proto::CecOpcode::VENDOR_COMMAND_WITH_ID,
            lip_proto::AbortReason::Refused,
        );
        if dispatch::transmit(&mut core, &shared, &abort).is_err() {
            log::warn!("message transmit failed");
        }
        SlotOutcome::Handled
    } else {
        log::warn!("timeout for unexpected opcode {slot_opcode:?}");
        SlotOutcome::AbortReceived
    };
    dispatch::finish_pending(&mut core, &shared, sent_addr, outcome);
    FireOutcome::Done
}

fn worker_loop(shared: Arc<Shared>) {
    let mut core = shared.core.lock();
    // first pass runs immediately to kick off discovery
    let mut deadline: Option<Instant> = Some(Instant::now());
    let mut probe_sent = false;
    loop {
        let mut timed_out = false;
        while !timed_out && !core.worker_signaled && core.running {
            match deadline {
                None => shared.worker_cv.wait(&mut core),
                Some(when) => {
                    if Instant::now() >= when {
                        timed_out = true;
                    } else {
                        timed_out = shared.worker_cv.wait_until(&mut core, when).timed_out();
                    }
                }
            }
        }
        core.worker_signaled = false;
        if !core.running {
            break;
        }

        let previous = core.state;
        match core.state {
            DiscoveryState::Init => {
                if let Some(downstream) = core.config.downstream_addr {
                    log::info!("probing {downstream:?} for lip support");
                    core.state = DiscoveryState::WaitForReply;
                    deadline = Some(Instant::now() + core.timeout_value());
                    let probe = command::request_lip_support(shared.own_addr, downstream);
                    probe_sent = dispatch::transmit(&mut core, &shared, &probe).is_ok();
                } else {
                    // sink: nothing downstream to discover
                    core.state = DiscoveryState::Supported;
                    deadline = Some(Instant::now());
                }
            }
            DiscoveryState::WaitForReply => {
                // no support report arrived. A TV facing an audio system
                // treats the successfully transmitted probe itself as
                // support and starts compensating the IEC decoding delay.
                if probe_sent
                    && shared.own_addr == LogicalAddress::TV
                    && core.config.downstream_addr == Some(LogicalAddress::AUDIO_SYSTEM)
                {
                    core.state = DiscoveryState::Supported;
                    core.add_iec_decoding_latency = true;
                } else {
                    core.state = DiscoveryState::Unsupported;
                }
                deadline = Some(Instant::now());
            }
            DiscoveryState::Supported => {
                dispatch::drain_support_requests(&mut core, &shared);
                deadline = None;
            }
            DiscoveryState::Unsupported => {
                dispatch::refuse_support_requests(&mut core, &shared);
                deadline = None;
            }
        }
        if core.state.is_settled() {
            shared.state_cv.notify_all();
        }
        log::info!(
            "discovery {previous:?} -> {:?} ({})",
            core.state,
            if timed_out { "timeout" } else { "signaled" }
        );
    }
}
