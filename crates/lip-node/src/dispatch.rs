//! Receive-path dispatch
//!
//! Validates every inbound frame against the vendor tag, addressing rules,
//! the per-opcode length table, and the discovery state, then routes it to
//! its handler. Handlers collect their outbound frames into a response list
//! which is transmitted at the end of the dispatch, still under the engine
//! lock.

use std::time::Instant;

use lip_proto::command;
use lip_proto::format::{AudioFormat, HdrMode, VideoFormat};
use lip_proto::opcode::LipOpcode;
use lip_proto::{
    AbortReason, CecMessage, CecOpcode, LogicalAddress, INVALID_LATENCY, MAX_UPSTREAM_DEVICES,
    PROTOCOL_VERSION,
};

use crate::bus::BusError;
use crate::cache::{self, LatencyCache};
use crate::config::{
    RenderMode, UUID_AUDIO_MODE_MASK, UUID_DEVICE_MASK, UUID_VIDEO_MODE_MASK,
};
use crate::node::Shared;
use crate::pending::SlotState;
use crate::state::{Core, DiscoveryState, LatencyKind};

/// How a completed slot releases its waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotOutcome {
    /// Fully served, nobody waits on it
    Handled,
    /// A blocked local caller reads the cache next
    AnswerReceived,
    /// A blocked local caller observes the failure
    AbortReceived,
}

/// Which latency report arrived from downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportKind {
    Av,
    Audio,
    Video,
}

/// Entry point for every frame delivered by the bus; returns true when the
/// frame was consumed by the protocol
pub(crate) fn handle_cec_message(core: &mut Core, shared: &Shared, msg: &CecMessage) -> bool {
    let mut responses: Vec<CecMessage> = Vec::new();
    let mut transmit_responses = false;
    let mut consumed = false;

    if msg.opcode == CecOpcode::FEATURE_ABORT {
        (transmit_responses, consumed) = handle_feature_abort(core, shared, msg, &mut responses);
    } else if msg.opcode == CecOpcode::VENDOR_COMMAND_WITH_ID && command::has_vendor_id(msg) {
        consumed = true;
        match command::lip_opcode(msg) {
            None => {
                log::debug!("unknown lip opcode from {:?}", msg.initiator);
                responses.push(command::feature_abort(
                    shared.own_addr,
                    msg.initiator,
                    CecOpcode::VENDOR_COMMAND_WITH_ID,
                    AbortReason::UnrecognizedOpcode,
                ));
                transmit_responses = true;
            }
            Some(opcode) => {
                if msg.destination.is_broadcast() || msg.initiator.is_broadcast() {
                    log::debug!(
                        "lip frames are never broadcast, dropping {opcode:?} ({:?} -> {:?})",
                        msg.initiator,
                        msg.destination
                    );
                } else if msg.destination != shared.own_addr {
                    log::debug!(
                        "frame for {:?} is not addressed to us ({:?})",
                        msg.destination,
                        shared.own_addr
                    );
                } else if msg.payload.len() < opcode.min_length() {
                    log::debug!(
                        "frame too short for {opcode:?}: {} < {}",
                        msg.payload.len(),
                        opcode.min_length()
                    );
                    responses.push(invalid_operand_abort(shared.own_addr, msg.initiator));
                    transmit_responses = true;
                } else if !opcode_allowed(core.state, opcode) {
                    log::debug!("cannot handle {opcode:?} in {:?}", core.state);
                    responses.push(command::feature_abort(
                        shared.own_addr,
                        msg.initiator,
                        CecOpcode::VENDOR_COMMAND_WITH_ID,
                        AbortReason::NotInCorrectModeToRespond,
                    ));
                    transmit_responses = true;
                } else {
                    log::debug!("handling {opcode:?} from {:?}", msg.initiator);
                    transmit_responses = match opcode {
                        LipOpcode::RequestLipSupport => {
                            handle_request_lip_support(core, shared, msg, &mut responses)
                        }
                        LipOpcode::ReportLipSupport => {
                            handle_report_lip_support(core, shared, msg, &mut responses, false)
                        }
                        LipOpcode::UpdateUuid => {
                            handle_report_lip_support(core, shared, msg, &mut responses, true)
                        }
                        LipOpcode::RequestAvLatency => {
                            handle_request_av_latency(core, shared, msg, &mut responses, false)
                        }
                        LipOpcode::ReportAvLatency => {
                            handle_report_av_latency(core, shared, msg, &mut responses)
                        }
                        LipOpcode::RequestAudioLatency => {
                            handle_request_audio_latency(core, shared, msg, &mut responses, false)
                        }
                        LipOpcode::ReportAudioLatency => {
                            handle_report_audio_latency(core, shared, msg, &mut responses)
                        }
                        LipOpcode::RequestVideoLatency => {
                            handle_request_video_latency(core, shared, msg, &mut responses, false)
                        }
                        LipOpcode::ReportVideoLatency => {
                            handle_report_video_latency(core, shared, msg, &mut responses)
                        }
                    };
                }
            }
        }
    }

    if transmit_responses {
        transmit_all(core, shared, &responses);
    }
    consumed
}

/// Transmit one frame, recording its LIP opcode for feature-abort matching
pub(crate) fn transmit(core: &mut Core, shared: &Shared, msg: &CecMessage) -> Result<(), BusError> {
    log::debug!(
        "transmitting {:?} -> {:?}, opcode {:#04x}, {} bytes",
        msg.initiator,
        msg.destination,
        msg.opcode.0,
        msg.payload.len()
    );
    core.last_sent[msg.destination.index()] = command::lip_opcode(msg);
    shared.bus.transmit(msg)
}

fn transmit_all(core: &mut Core, shared: &Shared, responses: &[CecMessage]) {
    for msg in responses {
        if msg.destination == shared.own_addr {
            // answer to a locally issued query; the blocked caller reads the
            // cache instead
            continue;
        }
        if transmit(core, shared, msg).is_err() {
            log::warn!("message transmit failed");
        }
    }
}

/// REPORT_LIP_SUPPORT and REQUEST_LIP_SUPPORT work everywhere except in
/// Unsupported; everything else needs an established link
const fn opcode_allowed(state: DiscoveryState, opcode: LipOpcode) -> bool {
    match opcode {
        LipOpcode::RequestLipSupport | LipOpcode::ReportLipSupport => {
            !matches!(state, DiscoveryState::Unsupported)
        }
        _ => matches!(state, DiscoveryState::Supported),
    }
}

fn invalid_operand_abort(own: LogicalAddress, to: LogicalAddress) -> CecMessage {
    command::feature_abort(
        own,
        to,
        CecOpcode::VENDOR_COMMAND_WITH_ID,
        AbortReason::InvalidOperand,
    )
}

fn notify_status(core: &Core, shared: &Shared) {
    if let Some(listener) = &shared.callbacks.status {
        listener.status_changed(&core.status_snapshot());
    }
}

/// Complete or transition a slot, then give buffered requests a chance to
/// run, fix up the timer deadline and wake every waiter
pub(crate) fn finish_pending(
    core: &mut Core,
    shared: &Shared,
    addr: LogicalAddress,
    outcome: SlotOutcome,
) {
    match outcome {
        SlotOutcome::Handled => core.pending.complete(addr),
        SlotOutcome::AnswerReceived => core.pending.set_state(addr, SlotState::AnswerReceived),
        SlotOutcome::AbortReceived => core.pending.set_state(addr, SlotState::AbortReceived),
    }
    drain_pending(core, shared);
    reschedule_timer(core);
    shared.pending_cv.notify_all();
}

/// Keep the timer deadline equal to the earliest Sent-slot expiry
pub(crate) fn reschedule_timer(core: &mut Core) {
    let deadline = core.pending.earliest_sent_deadline();
    let Some(timer) = core.timer.clone() else {
        return;
    };
    match deadline {
        Some(deadline) => core.timer_generation = Some(timer.arm_until(deadline)),
        None => {
            timer.cancel();
            core.timer_generation = None;
        }
    }
}

/// Re-dispatch buffered Pending requests in ascending address order,
/// preserving each slot's original expiry
fn drain_pending(core: &mut Core, shared: &Shared) {
    for index in 0..MAX_UPSTREAM_DEVICES {
        let Some(addr) = LogicalAddress::new(index as u8) else {
            continue;
        };
        let Some((msg, expiry)) = core.pending.take_if_pending(addr) else {
            continue;
        };
        if msg.initiator == shared.own_addr {
            // locally issued query: retry on the local path so it can be
            // promoted or served from the freshly filled cache
            let mut responses = Vec::new();
            if handle_local_latency_request(core, shared, &msg, &mut responses) {
                transmit_all(core, shared, &responses);
            }
        } else {
            handle_cec_message(core, shared, &msg);
        }
        core.pending.set_expiry(addr, expiry);
    }
}

/// Dispatch a query issued by this node itself, bypassing the addressing
/// checks (the frame is addressed downstream, not to us)
pub(crate) fn handle_local_latency_request(
    core: &mut Core,
    shared: &Shared,
    msg: &CecMessage,
    responses: &mut Vec<CecMessage>,
) -> bool {
    match command::lip_opcode(msg) {
        Some(LipOpcode::RequestAvLatency) => {
            handle_request_av_latency(core, shared, msg, responses, true)
        }
        Some(LipOpcode::RequestAudioLatency) => {
            handle_request_audio_latency(core, shared, msg, responses, true)
        }
        Some(LipOpcode::RequestVideoLatency) => {
            handle_request_video_latency(core, shared, msg, responses, true)
        }
        _ => false,
    }
}

/// Answer every buffered REQUEST_LIP_SUPPORT now that support is settled
pub(crate) fn drain_support_requests(core: &mut Core, shared: &Shared) {
    for_each_buffered_support_request(core, |core, addr| {
        let Some((msg, _)) = core.pending.take_if_pending(addr) else {
            return;
        };
        let mut responses = Vec::new();
        if handle_request_lip_support(core, shared, &msg, &mut responses) {
            transmit_all(core, shared, &responses);
        }
    });
}

/// Refuse every buffered REQUEST_LIP_SUPPORT; this node does not speak the
/// protocol toward its downstream
pub(crate) fn refuse_support_requests(core: &mut Core, shared: &Shared) {
    for_each_buffered_support_request(core, |core, addr| {
        let Some((msg, _)) = core.pending.take_if_pending(addr) else {
            return;
        };
        log::debug!("support unavailable, refusing {:?}", msg.initiator);
        let abort = command::feature_abort(
            shared.own_addr,
            msg.initiator,
            CecOpcode::VENDOR_COMMAND_WITH_ID,
            AbortReason::Refused,
        );
        if transmit(core, shared, &abort).is_err() {
            log::warn!("message transmit failed");
        }
    });
}

fn for_each_buffered_support_request(core: &mut Core, mut f: impl FnMut(&mut Core, LogicalAddress)) {
    for index in 0..MAX_UPSTREAM_DEVICES {
        let Some(addr) = LogicalAddress::new(index as u8) else {
            continue;
        };
        let buffered = core.pending.get(addr).is_some_and(|slot| {
            slot.state == SlotState::Pending
                && command::lip_opcode(&slot.msg) == Some(LipOpcode::RequestLipSupport)
        });
        if buffered {
            f(core, addr);
        }
    }
}

fn handle_request_lip_support(
    core: &mut Core,
    shared: &Shared,
    msg: &CecMessage,
    responses: &mut Vec<CecMessage>,
) -> bool {
    log::debug!("support request from {:?} in {:?}", msg.initiator, core.state);
    match core.state {
        DiscoveryState::Supported => {
            let uuid = core.merged_uuid(&shared.callbacks);
            core.add_upstream(msg.initiator);
            notify_status(core, shared);
            log::debug!("reporting support to {:?}", msg.initiator);
            responses.push(command::report_lip_support(
                shared.own_addr,
                msg.initiator,
                PROTOCOL_VERSION,
                uuid,
                false,
            ));
            true
        }
        _ => {
            // support not settled yet; buffer it, the worker answers later
            let expires_at = Instant::now() + core.timeout_value();
            core.pending.insert(msg.initiator, msg.clone(), expires_at);
            false
        }
    }
}

fn handle_report_lip_support(
    core: &mut Core,
    shared: &Shared,
    msg: &CecMessage,
    responses: &mut Vec<CecMessage>,
    update_uuid: bool,
) -> bool {
    let Some(uuid) = command::uuid_from_be(&msg.payload[5..9]) else {
        return false;
    };
    if core.config.downstream_addr != Some(msg.initiator) {
        log::debug!(
            "support report from {:?} does not match the configured downstream, ignoring",
            msg.initiator
        );
        return false;
    }
    if !update_uuid && core.state == DiscoveryState::Supported {
        log::debug!("support report while already supported, ignoring");
        return false;
    }
    if update_uuid && core.state != DiscoveryState::Supported {
        log::debug!("uuid update before support was established, ignoring");
        return false;
    }

    log::info!(
        "downstream {:?} speaks lip, uuid {uuid:#010x}, version {}",
        msg.initiator,
        msg.payload[4]
    );
    if core.downstream.uuid != Some(uuid) {
        rotate_cache(core, shared, uuid);
    }
    core.downstream.addr = Some(msg.initiator);
    core.downstream.uuid = Some(uuid);
    core.state = DiscoveryState::Supported;

    // peers that asked for support while discovery was running get the
    // plain report right away
    let mut answered: Vec<LogicalAddress> = Vec::new();
    for index in 0..MAX_UPSTREAM_DEVICES {
        let Some(addr) = LogicalAddress::new(index as u8) else {
            continue;
        };
        let buffered = core.pending.get(addr).is_some_and(|slot| {
            slot.state == SlotState::Pending
                && command::lip_opcode(&slot.msg) == Some(LipOpcode::RequestLipSupport)
        });
        if buffered {
            core.pending.complete(addr);
            core.add_upstream(addr);
            answered.push(addr);
        }
    }

    reschedule_timer(core);
    notify_status(core, shared);

    let mut transmit_responses = false;
    if core.upstream_present() {
        let merged = core.merged_uuid(&shared.callbacks);
        for peer in core.upstream.iter() {
            let update = update_uuid && !answered.contains(peer);
            log::debug!(
                "propagating identity {merged:#010x} to {peer:?} ({})",
                if update { "uuid update" } else { "support report" }
            );
            responses.push(command::report_lip_support(
                shared.own_addr,
                *peer,
                PROTOCOL_VERSION,
                merged,
                update,
            ));
        }
        transmit_responses = true;
    }
    if !update_uuid {
        core.worker_signaled = true;
        shared.worker_cv.notify_one();
    }
    transmit_responses
}

/// Swap the cache to the new downstream identity: persist the old blob, try
/// to load one for the new identity, and otherwise clear exactly the parts
/// the identity change invalidates
fn rotate_cache(core: &mut Core, shared: &Shared, new_uuid: u32) {
    if let (Some(_), Some(old_uuid)) = (core.downstream.addr, core.downstream.uuid) {
        if let Some(store) = &shared.callbacks.persistence {
            store.store(old_uuid, &core.downstream.cache.to_bytes());
        }
    }

    if let Some(store) = &shared.callbacks.persistence {
        let mut blob = vec![0u8; cache::SERIALIZED_LEN];
        let read = store.read(new_uuid, &mut blob);
        if read == blob.len() {
            if let Some(restored) = LatencyCache::from_bytes(&blob) {
                log::debug!("restored cache blob for {new_uuid:#010x}");
                core.downstream.cache = restored;
                return;
            }
        }
    }

    let (clear_audio, clear_video) = match core.downstream.uuid {
        None => (true, true),
        Some(old) => {
            let changed = old ^ new_uuid;
            let device_changed = changed & UUID_DEVICE_MASK != 0;
            (
                device_changed || changed & UUID_AUDIO_MODE_MASK != 0,
                device_changed || changed & UUID_VIDEO_MODE_MASK != 0,
            )
        }
    };
    log::debug!("no cache blob for {new_uuid:#010x}, clearing audio={clear_audio} video={clear_video}");
    core.downstream.cache.clear(clear_audio, clear_video);
}

/// Audio format used toward the downstream device; a transcoder queries for
/// its output format, not the requester's input format
fn downstream_audio_format(core: &Core, requested: AudioFormat, force_local: bool) -> AudioFormat {
    if core.config.audio_transcoding && !force_local {
        core.config.audio_transcoding_format
    } else {
        requested
    }
}

fn handle_request_av_latency(
    core: &mut Core,
    shared: &Shared,
    msg: &CecMessage,
    responses: &mut Vec<CecMessage>,
    force_local: bool,
) -> bool {
    let audio = AudioFormat::from_wire(msg.payload[6], msg.payload.get(7).copied());
    if !audio.is_valid() {
        log::debug!("invalid audio format from {:?}", msg.initiator);
        responses.push(invalid_operand_abort(shared.own_addr, msg.initiator));
        return true;
    }
    let video = match HdrMode::from_wire(msg.payload[5]) {
        Some(hdr) => VideoFormat::new(msg.payload[4], hdr),
        None => {
            log::debug!("invalid video format from {:?}", msg.initiator);
            responses.push(invalid_operand_abort(shared.own_addr, msg.initiator));
            return true;
        }
    };
    if !video.is_valid() {
        log::debug!("invalid video format from {:?}", msg.initiator);
        responses.push(invalid_operand_abort(shared.own_addr, msg.initiator));
        return true;
    }

    let downstream_present = core.downstream.addr.is_some();
    let ask_video = (!core.config.render_mode.contains(RenderMode::VIDEO) && downstream_present)
        || force_local;
    let ask_audio = (!core.config.render_mode.contains(RenderMode::AUDIO) && downstream_present)
        || force_local;
    let video_kind = if ask_video { LatencyKind::Total } else { LatencyKind::Own };
    let audio_kind = if ask_audio { LatencyKind::Total } else { LatencyKind::Own };
    let audio_downstream = downstream_audio_format(core, audio, force_local);

    let video_hit = core.video_latency_from_cache(video, video_kind);
    let audio_hit = core.audio_latency_from_cache(audio, audio_downstream, audio_kind);

    if let (Some(video_latency), Some(audio_latency)) = (video_hit, audio_hit) {
        log::debug!("av latency served from cache");
        responses.push(command::report_av_latency(
            shared.own_addr,
            msg.initiator,
            video_latency,
            audio_latency,
        ));
        return true;
    }

    log::debug!(
        "av latency cache miss (video hit: {}, audio hit: {}), buffering",
        video_hit.is_some(),
        audio_hit.is_some()
    );
    let expires_at = Instant::now() + core.timeout_value();
    core.pending.insert(msg.initiator, msg.clone(), expires_at);
    if core.pending.any_sent() {
        return false;
    }
    let Some(downstream) = core.downstream.addr else {
        return false;
    };
    core.pending.set_state(msg.initiator, SlotState::Sent);
    core.req_video_format = Some(video);
    core.req_audio_format = Some(audio);
    core.sent_audio_format = Some(audio_downstream);
    reschedule_timer(core);

    let request = if video_hit.is_none() && audio_hit.is_none() {
        command::request_av_latency(shared.own_addr, downstream, video, audio_downstream)
    } else if video_hit.is_none() {
        command::request_video_latency(shared.own_addr, downstream, video)
    } else {
        command::request_audio_latency(shared.own_addr, downstream, audio_downstream)
    };
    responses.push(request);
    true
}

fn handle_request_audio_latency(
    core: &mut Core,
    shared: &Shared,
    msg: &CecMessage,
    responses: &mut Vec<CecMessage>,
    force_local: bool,
) -> bool {
    let audio = AudioFormat::from_wire(msg.payload[4], msg.payload.get(5).copied());
    if !audio.is_valid() {
        log::debug!("invalid audio format from {:?}", msg.initiator);
        responses.push(invalid_operand_abort(shared.own_addr, msg.initiator));
        return true;
    }

    let downstream_present = core.downstream.addr.is_some();
    let ask_downstream = (!core.config.render_mode.contains(RenderMode::AUDIO)
        && downstream_present)
        || force_local;
    let kind = if ask_downstream { LatencyKind::Total } else { LatencyKind::Own };
    let audio_downstream = downstream_audio_format(core, audio, force_local);

    if let Some(latency) = core.audio_latency_from_cache(audio, audio_downstream, kind) {
        responses.push(command::report_audio_latency(
            shared.own_addr,
            msg.initiator,
            latency,
        ));
        return true;
    }

    let expires_at = Instant::now() + core.timeout_value();
    core.pending.insert(msg.initiator, msg.clone(), expires_at);
    if core.pending.any_sent() {
        return false;
    }
    let Some(downstream) = core.downstream.addr else {
        return false;
    };
    core.pending.set_state(msg.initiator, SlotState::Sent);
    core.req_audio_format = Some(audio);
    core.sent_audio_format = Some(audio_downstream);
    reschedule_timer(core);
    responses.push(command::request_audio_latency(
        shared.own_addr,
        downstream,
        audio_downstream,
    ));
    true
}

fn handle_request_video_latency(
    core: &mut Core,
    shared: &Shared,
    msg: &CecMessage,
    responses: &mut Vec<CecMessage>,
    force_local: bool,
) -> bool {
    let video = match HdrMode::from_wire(msg.payload[5]) {
        Some(hdr) => VideoFormat::new(msg.payload[4], hdr),
        None => {
            log::debug!("invalid video format from {:?}", msg.initiator);
            responses.push(invalid_operand_abort(shared.own_addr, msg.initiator));
            return true;
        }
    };
    if !video.is_valid() {
        log::debug!("invalid video format from {:?}", msg.initiator);
        responses.push(invalid_operand_abort(shared.own_addr, msg.initiator));
        return true;
    }

    let downstream_present = core.downstream.addr.is_some();
    let ask_downstream = (!core.config.render_mode.contains(RenderMode::VIDEO)
        && downstream_present)
        || force_local;
    let kind = if ask_downstream { LatencyKind::Total } else { LatencyKind::Own };

    if let Some(latency) = core.video_latency_from_cache(video, kind) {
        responses.push(command::report_video_latency(
            shared.own_addr,
            msg.initiator,
            latency,
        ));
        return true;
    }

    let expires_at = Instant::now() + core.timeout_value();
    core.pending.insert(msg.initiator, msg.clone(), expires_at);
    if core.pending.any_sent() {
        return false;
    }
    let Some(downstream) = core.downstream.addr else {
        return false;
    };
    core.pending.set_state(msg.initiator, SlotState::Sent);
    core.req_video_format = Some(video);
    reschedule_timer(core);
    responses.push(command::request_video_latency(shared.own_addr, downstream, video));
    true
}

/// Own latency for the upstream reply, from the formats remembered at
/// promotion time
fn reply_audio_latency(core: &Core, kind: LatencyKind) -> u8 {
    match core.req_audio_format {
        Some(format) => {
            let downstream_key = core.sent_audio_format.unwrap_or(format);
            core.audio_latency_from_cache(format, downstream_key, kind)
                .unwrap_or(INVALID_LATENCY)
        }
        None => INVALID_LATENCY,
    }
}

fn reply_video_latency(core: &Core, kind: LatencyKind) -> u8 {
    core.req_video_format
        .and_then(|format| core.video_latency_from_cache(format, kind))
        .unwrap_or(INVALID_LATENCY)
}

/// Serve the unique Sent slot from the cache after a downstream report (or
/// complete it silently on a dimension mismatch)
fn respond_to_sent_slot(
    core: &mut Core,
    shared: &Shared,
    responses: &mut Vec<CecMessage>,
    received: ReportKind,
) -> bool {
    let Some(sent_addr) = core.pending.sent_addr() else {
        return false;
    };
    let slot_opcode = core
        .pending
        .get(sent_addr)
        .and_then(|slot| command::lip_opcode(&slot.msg));

    let reply = match (received, slot_opcode) {
        (_, Some(LipOpcode::RequestAvLatency)) => Some(ReportKind::Av),
        (ReportKind::Av, Some(op)) if op.is_latency_request() => Some(ReportKind::Av),
        (ReportKind::Audio, Some(LipOpcode::RequestAudioLatency)) => Some(ReportKind::Audio),
        (ReportKind::Video, Some(LipOpcode::RequestVideoLatency)) => Some(ReportKind::Video),
        (ReportKind::Audio, Some(LipOpcode::RequestVideoLatency))
        | (ReportKind::Video, Some(LipOpcode::RequestAudioLatency)) => {
            log::debug!("report does not match the request in flight, dropping the slot");
            None
        }
        _ => return false,
    };

    let audio_kind = if core.config.render_mode.contains(RenderMode::AUDIO) {
        LatencyKind::Own
    } else {
        LatencyKind::Total
    };
    let video_kind = if core.config.render_mode.contains(RenderMode::VIDEO) {
        LatencyKind::Own
    } else {
        LatencyKind::Total
    };

    let mut transmit_responses = false;
    let outcome = match reply {
        None => SlotOutcome::Handled,
        Some(_) if sent_addr == shared.own_addr => SlotOutcome::AnswerReceived,
        Some(kind) => {
            match kind {
                ReportKind::Av => responses.push(command::report_av_latency(
                    shared.own_addr,
                    sent_addr,
                    reply_video_latency(core, video_kind),
                    reply_audio_latency(core, audio_kind),
                )),
                ReportKind::Audio => responses.push(command::report_audio_latency(
                    shared.own_addr,
                    sent_addr,
                    reply_audio_latency(core, audio_kind),
                )),
                ReportKind::Video => responses.push(command::report_video_latency(
                    shared.own_addr,
                    sent_addr,
                    reply_video_latency(core, video_kind),
                )),
            }
            transmit_responses = true;
            SlotOutcome::Handled
        }
    };
    finish_pending(core, shared, sent_addr, outcome);
    transmit_responses
}

fn handle_report_av_latency(
    core: &mut Core,
    shared: &Shared,
    msg: &CecMessage,
    responses: &mut Vec<CecMessage>,
) -> bool {
    if let Some(format) = core.req_video_format {
        core.downstream.cache.set_video_latency(format, msg.payload[4]);
    }
    if let Some(format) = core.sent_audio_format {
        core.downstream.cache.set_audio_latency(format, msg.payload[5]);
    }
    respond_to_sent_slot(core, shared, responses, ReportKind::Av)
}

fn handle_report_audio_latency(
    core: &mut Core,
    shared: &Shared,
    msg: &CecMessage,
    responses: &mut Vec<CecMessage>,
) -> bool {
    if let Some(format) = core.sent_audio_format {
        core.downstream.cache.set_audio_latency(format, msg.payload[4]);
    }
    respond_to_sent_slot(core, shared, responses, ReportKind::Audio)
}

fn handle_report_video_latency(
    core: &mut Core,
    shared: &Shared,
    msg: &CecMessage,
    responses: &mut Vec<CecMessage>,
) -> bool {
    if let Some(format) = core.req_video_format {
        core.downstream.cache.set_video_latency(format, msg.payload[4]);
    }
    respond_to_sent_slot(core, shared, responses, ReportKind::Video)
}

/// A Feature Abort from a peer we queried; matched against the last opcode
/// sent to that peer
fn handle_feature_abort(
    core: &mut Core,
    shared: &Shared,
    msg: &CecMessage,
    responses: &mut Vec<CecMessage>,
) -> (bool, bool) {
    if msg.payload.first() != Some(&CecOpcode::VENDOR_COMMAND_WITH_ID.0) {
        return (false, false);
    }
    let mut transmit_responses = false;
    let mut consumed = false;

    match core.last_sent[msg.initiator.index()] {
        Some(LipOpcode::RequestLipSupport) => {
            if core.state == DiscoveryState::WaitForReply {
                log::debug!("downstream refused the support probe");
                consumed = true;
                core.worker_signaled = true;
                shared.worker_cv.notify_one();
            }
        }
        Some(opcode) if opcode.is_latency_request() => {
            let Some(sent_addr) = core.pending.sent_addr() else {
                return (false, false);
            };
            let slot_is_latency = core
                .pending
                .get(sent_addr)
                .and_then(|slot| command::lip_opcode(&slot.msg))
                .is_some_and(LipOpcode::is_latency_request);
            if slot_is_latency {
                consumed = true;
                let outcome = if sent_addr == shared.own_addr {
                    // the blocked caller observes the failure itself
                    SlotOutcome::AbortReceived
                } else {
                    log::debug!("downstream aborted, refusing {sent_addr:?}");
                    responses.push(command::feature_abort(
                        shared.own_addr,
                        sent_addr,
                        CecOpcode::VENDOR_COMMAND_WITH_ID,
                        AbortReason::Refused,
                    ));
                    transmit_responses = true;
                    SlotOutcome::Handled
                };
                finish_pending(core, shared, sent_addr, outcome);
            }
        }
        _ => {}
    }
    (transmit_responses, consumed)
}
