//! Engine scenarios over an in-memory bus

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use lip_proto::command::{self, lip_opcode};
use lip_proto::format::{AudioCodec, AudioFormat, HdrMode, HdrStatic, VideoFormat};
use lip_proto::opcode::LipOpcode;
use lip_proto::{
    AbortReason, CecMessage, CecOpcode, LogicalAddress, INVALID_LATENCY, PROTOCOL_VERSION,
};

use crate::bus::{CachePersistence, Callbacks, CecBus, ConnectionStatus, MessageReceiver};
use crate::config::{Config, RenderMode};
use crate::{LipError, LipNode, UpstreamRemoval};

const TV: LogicalAddress = LogicalAddress::TV;
const AVR: LogicalAddress = LogicalAddress::AUDIO_SYSTEM;
const STB: LogicalAddress = LogicalAddress::RECORDING_DEVICE_1;
const PLAYER: LogicalAddress = LogicalAddress::PLAYBACK_DEVICE_1;

const DOWNSTREAM_UUID: u32 = 0x1122_0301;

fn sdr(vic: u8) -> VideoFormat {
    VideoFormat::new(vic, HdrMode::Static(HdrStatic::Sdr))
}

fn ac3() -> AudioFormat {
    AudioFormat::new(AudioCodec::AC3)
}

#[derive(Clone)]
struct MockBus(Arc<MockBusInner>);

struct MockBusInner {
    addr: LogicalAddress,
    sent: Mutex<Vec<CecMessage>>,
    receiver: Mutex<Option<MessageReceiver>>,
}

impl MockBus {
    fn new(addr: LogicalAddress) -> Self {
        Self(Arc::new(MockBusInner {
            addr,
            sent: Mutex::new(Vec::new()),
            receiver: Mutex::new(None),
        }))
    }

    fn take_sent(&self) -> Vec<CecMessage> {
        std::mem::take(&mut *self.0.sent.lock())
    }

    fn inject(&self, msg: &CecMessage) -> bool {
        let receiver = self.0.receiver.lock();
        match receiver.as_ref() {
            Some(receiver) => receiver(msg),
            None => false,
        }
    }
}

impl CecBus for MockBus {
    fn logical_address(&self) -> LogicalAddress {
        self.0.addr
    }

    fn transmit(&self, message: &CecMessage) -> Result<(), crate::BusError> {
        self.0.sent.lock().push(message.clone());
        Ok(())
    }

    fn register_receiver(&self, receiver: MessageReceiver) {
        *self.0.receiver.lock() = Some(receiver);
    }
}

#[derive(Clone, Default)]
struct MemStore(Arc<Mutex<HashMap<u32, Vec<u8>>>>);

impl CachePersistence for MemStore {
    fn store(&self, uuid: u32, data: &[u8]) {
        self.0.lock().insert(uuid, data.to_vec());
    }

    fn read(&self, uuid: u32, buf: &mut [u8]) -> usize {
        match self.0.lock().get(&uuid) {
            Some(blob) => {
                let len = blob.len().min(buf.len());
                buf[..len].copy_from_slice(&blob[..len]);
                len
            }
            None => 0,
        }
    }
}

fn merge_or() -> Box<dyn crate::UuidMerge> {
    Box::new(|own: u32, downstream: u32| own | downstream)
}

fn open_node(config: Config, persistence: Option<MemStore>, addr: LogicalAddress) -> (LipNode, MockBus) {
    let bus = MockBus::new(addr);
    let mut callbacks = Callbacks::new(merge_or());
    if let Some(store) = persistence {
        callbacks.persistence = Some(Box::new(store));
    }
    let node = LipNode::open(config, callbacks, Box::new(bus.clone())).unwrap();
    (node, bus)
}

/// Hub config: downstream TV, no own rendering, AC3 passthrough costs 15 ms
/// and video passthrough nothing
fn hub_config() -> Config {
    let mut config = Config::default();
    config.downstream_addr = Some(TV);
    config.uuid = 0x5500_0000;
    config.set_audio_latency(ac3(), 15);
    config.set_video_latency(sdr(4), 0);
    config
}

/// Bring a hub to the Supported state by reporting downstream support
fn supported_hub(config: Config, persistence: Option<MemStore>) -> (LipNode, MockBus) {
    let (node, bus) = open_node(config, persistence, AVR);
    assert!(bus.inject(&command::report_lip_support(
        TV,
        AVR,
        PROTOCOL_VERSION,
        DOWNSTREAM_UUID,
        false,
    )));
    let status = node.status(true);
    assert!(status.connections.contains(ConnectionStatus::DOWNSTREAM_CONNECTED));
    assert_eq!(status.downstream_uuid, Some(DOWNSTREAM_UUID));
    bus.take_sent();
    (node, bus)
}

fn wait_for(
    bus: &MockBus,
    timeout: Duration,
    pred: impl Fn(&CecMessage) -> bool,
) -> Option<CecMessage> {
    let deadline = Instant::now() + timeout;
    loop {
        for msg in bus.take_sent() {
            if pred(&msg) {
                return Some(msg);
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn find_lip(frames: &[CecMessage], opcode: LipOpcode) -> Option<CecMessage> {
    frames.iter().find(|msg| lip_opcode(msg) == Some(opcode)).cloned()
}

fn abort_reason(msg: &CecMessage) -> Option<u8> {
    if msg.opcode == CecOpcode::FEATURE_ABORT {
        msg.payload.get(1).copied()
    } else {
        None
    }
}

#[test]
fn test_sink_answers_support_and_av_latency() {
    let mut config = Config::default();
    config.uuid = 0xABCD_0000;
    config.render_mode = RenderMode::VIDEO | RenderMode::AUDIO;
    config.set_video_latency(sdr(16), 10);
    config.set_audio_latency(AudioFormat::new(AudioCodec::EAC3), 20);
    let (node, bus) = open_node(config, None, TV);

    let status = node.status(true);
    assert!(!status.connections.contains(ConnectionStatus::DOWNSTREAM_CONNECTED));

    assert!(bus.inject(&command::request_lip_support(PLAYER, TV)));
    let sent = bus.take_sent();
    let report = find_lip(&sent, LipOpcode::ReportLipSupport).expect("support report");
    assert_eq!(report.destination, PLAYER);
    assert_eq!(report.payload[4], PROTOCOL_VERSION);
    assert_eq!(command::uuid_from_be(&report.payload[5..9]), Some(0xABCD_0000));

    assert!(bus.inject(&command::request_av_latency(
        PLAYER,
        TV,
        sdr(16),
        AudioFormat::new(AudioCodec::EAC3),
    )));
    let sent = bus.take_sent();
    let report = find_lip(&sent, LipOpcode::ReportAvLatency).expect("latency report");
    assert_eq!(report.destination, PLAYER);
    assert_eq!(report.payload[4], 10);
    assert_eq!(report.payload[5], 20);
}

#[test]
fn test_hub_cache_miss_then_hit() {
    let (_node, bus) = supported_hub(hub_config(), None);

    // both dimensions miss: the narrowest covering query is the av request
    assert!(bus.inject(&command::request_av_latency(STB, AVR, sdr(4), ac3())));
    let sent = bus.take_sent();
    let downstream_query = find_lip(&sent, LipOpcode::RequestAvLatency).expect("downstream query");
    assert_eq!(downstream_query.destination, TV);
    assert!(find_lip(&sent, LipOpcode::ReportAvLatency).is_none());

    assert!(bus.inject(&command::report_av_latency(TV, AVR, 30, 5)));
    let sent = bus.take_sent();
    let report = find_lip(&sent, LipOpcode::ReportAvLatency).expect("upstream reply");
    assert_eq!(report.destination, STB);
    assert_eq!(report.payload[4], 30); // video: passthrough 0 + downstream 30
    assert_eq!(report.payload[5], 20); // audio: own 15 + downstream 5

    // identical query is now served from cache without downstream traffic
    assert!(bus.inject(&command::request_av_latency(STB, AVR, sdr(4), ac3())));
    let sent = bus.take_sent();
    let report = find_lip(&sent, LipOpcode::ReportAvLatency).expect("cached reply");
    assert_eq!((report.payload[4], report.payload[5]), (30, 20));
    assert!(find_lip(&sent, LipOpcode::RequestAvLatency).is_none());
}

#[test]
fn test_audio_renderer_asks_only_for_video() {
    let mut config = hub_config();
    config.render_mode = RenderMode::AUDIO;
    let (_node, bus) = supported_hub(config, None);

    assert!(bus.inject(&command::request_av_latency(STB, AVR, sdr(4), ac3())));
    let sent = bus.take_sent();
    // the audio dimension is rendered here, only video goes downstream
    let downstream_query =
        find_lip(&sent, LipOpcode::RequestVideoLatency).expect("video-only query");
    assert_eq!(downstream_query.destination, TV);
    assert!(find_lip(&sent, LipOpcode::RequestAvLatency).is_none());

    assert!(bus.inject(&command::report_video_latency(TV, AVR, 30)));
    let sent = bus.take_sent();
    let report = find_lip(&sent, LipOpcode::ReportAvLatency).expect("upstream reply");
    assert_eq!(report.payload[4], 30); // video composed with downstream
    assert_eq!(report.payload[5], 15); // audio is own latency only
}

#[test]
fn test_timeout_aborts_upstream_exactly_once() {
    let (_node, bus) = supported_hub(hub_config(), None);

    // the peer registers first, making this node a hub with the short deadline
    assert!(bus.inject(&command::request_lip_support(STB, AVR)));
    bus.take_sent();

    assert!(bus.inject(&command::request_av_latency(STB, AVR, sdr(4), ac3())));
    let started = Instant::now();
    let abort = wait_for(&bus, Duration::from_secs(3), |msg| {
        abort_reason(msg) == Some(AbortReason::Refused as u8)
    })
    .expect("timeout abort");
    assert_eq!(abort.destination, STB);
    assert_eq!(abort.payload[0], CecOpcode::VENDOR_COMMAND_WITH_ID.0);
    assert!(started.elapsed() >= Duration::from_millis(900));

    thread::sleep(Duration::from_millis(300));
    let extra = bus.take_sent();
    assert!(extra.iter().all(|msg| abort_reason(msg).is_none()));
}

#[test]
fn test_identity_change_clears_audio_keeps_video() {
    let (_node, bus) = supported_hub(hub_config(), None);

    // register an upstream peer and fill both cache dimensions
    assert!(bus.inject(&command::request_lip_support(STB, AVR)));
    bus.take_sent();
    assert!(bus.inject(&command::request_video_latency(STB, AVR, sdr(4))));
    assert!(bus.inject(&command::report_video_latency(TV, AVR, 30)));
    assert!(bus.inject(&command::request_audio_latency(STB, AVR, ac3())));
    assert!(bus.inject(&command::report_audio_latency(TV, AVR, 5)));
    bus.take_sent();

    // the audio-mode octet changes; no persisted blob exists
    let new_uuid = DOWNSTREAM_UUID + 1;
    assert!(bus.inject(&command::report_lip_support(
        TV,
        AVR,
        PROTOCOL_VERSION,
        new_uuid,
        true,
    )));
    let sent = bus.take_sent();
    let update = find_lip(&sent, LipOpcode::UpdateUuid).expect("identity propagated upstream");
    assert_eq!(update.destination, STB);
    assert_eq!(
        command::uuid_from_be(&update.payload[5..9]),
        Some(0x5500_0000 | new_uuid)
    );
    assert_eq!(sent.iter().filter(|m| lip_opcode(m) == Some(LipOpcode::UpdateUuid)).count(), 1);

    // video survived the rotation
    assert!(bus.inject(&command::request_video_latency(STB, AVR, sdr(4))));
    let sent = bus.take_sent();
    assert!(find_lip(&sent, LipOpcode::ReportVideoLatency).is_some());
    assert!(find_lip(&sent, LipOpcode::RequestVideoLatency).is_none());

    // audio did not
    assert!(bus.inject(&command::request_audio_latency(STB, AVR, ac3())));
    let sent = bus.take_sent();
    assert!(find_lip(&sent, LipOpcode::RequestAudioLatency).is_some());
    assert!(find_lip(&sent, LipOpcode::ReportAudioLatency).is_none());
}

#[test]
fn test_set_config_rejects_isolated_render_mode_change() {
    let (node, _bus) = supported_hub(hub_config(), None);

    let mut changed = hub_config();
    changed.render_mode = RenderMode::AUDIO;
    let result = node.set_config(Some(&changed), false, UpstreamRemoval::None);
    assert_eq!(
        result,
        Err(LipError::ConfigRejected("render mode change requires a uuid change"))
    );

    // the same change passes together with a new identity
    changed.uuid = 0x5500_0001;
    assert_eq!(node.set_config(Some(&changed), false, UpstreamRemoval::None), Ok(()));
}

#[test]
fn test_set_config_without_changes_is_an_error() {
    let (node, _bus) = supported_hub(hub_config(), None);
    assert_eq!(
        node.set_config(None, false, UpstreamRemoval::None),
        Err(LipError::NoChange)
    );
}

#[test]
fn test_transcoder_queries_its_output_format() {
    let mut config = hub_config();
    config.audio_transcoding = true;
    config.audio_transcoding_format = AudioFormat::new(AudioCodec::MAT);
    let (_node, bus) = supported_hub(config, None);

    assert!(bus.inject(&command::request_audio_latency(STB, AVR, ac3())));
    let sent = bus.take_sent();
    let downstream_query =
        find_lip(&sent, LipOpcode::RequestAudioLatency).expect("downstream query");
    assert_eq!(downstream_query.destination, TV);
    assert_eq!(downstream_query.payload[4], AudioCodec::MAT.0);

    assert!(bus.inject(&command::report_audio_latency(TV, AVR, 5)));
    let sent = bus.take_sent();
    let report = find_lip(&sent, LipOpcode::ReportAudioLatency).expect("upstream reply");
    assert_eq!(report.destination, STB);
    // own latency indexed by the requester's ac3, downstream by mat
    assert_eq!(report.payload[4], 20);

    // the transcoded entry is cached: a second ac3 query stays local
    assert!(bus.inject(&command::request_audio_latency(STB, AVR, ac3())));
    let sent = bus.take_sent();
    assert_eq!(
        find_lip(&sent, LipOpcode::ReportAudioLatency).expect("cached reply").payload[4],
        20
    );
    assert!(find_lip(&sent, LipOpcode::RequestAudioLatency).is_none());
}

#[test]
fn test_unsupported_state_gates_latency_requests() {
    let mut config = Config::default();
    config.downstream_addr = Some(TV);
    let (node, bus) = open_node(config, None, STB);

    let probe = wait_for(&bus, Duration::from_secs(2), |msg| {
        lip_opcode(msg) == Some(LipOpcode::RequestLipSupport)
    })
    .expect("support probe");
    assert_eq!(probe.destination, TV);

    // the downstream refuses the probe
    assert!(bus.inject(&command::feature_abort(
        TV,
        STB,
        CecOpcode::VENDOR_COMMAND_WITH_ID,
        AbortReason::Refused,
    )));
    node.status(true);

    assert!(bus.inject(&command::request_audio_latency(PLAYER, STB, ac3())));
    let sent = bus.take_sent();
    let abort = sent.iter().find(|m| abort_reason(m).is_some()).expect("gating abort");
    assert_eq!(abort.destination, PLAYER);
    assert_eq!(
        abort_reason(abort),
        Some(AbortReason::NotInCorrectModeToRespond as u8)
    );
}

#[test]
fn test_support_requests_buffered_until_discovery_settles() {
    let mut config = hub_config();
    config.uuid = 0x7700_0000;
    let (_node, bus) = open_node(config, None, AVR);

    // arrives while discovery is still probing: no answer yet
    assert!(bus.inject(&command::request_lip_support(STB, AVR)));
    assert!(find_lip(&bus.take_sent(), LipOpcode::ReportLipSupport).is_none());

    // downstream confirms; the buffered request is answered with the merged
    // identity
    assert!(bus.inject(&command::report_lip_support(
        TV,
        AVR,
        PROTOCOL_VERSION,
        DOWNSTREAM_UUID,
        false,
    )));
    let report = wait_for(&bus, Duration::from_secs(1), |msg| {
        lip_opcode(msg) == Some(LipOpcode::ReportLipSupport) && msg.destination == STB
    })
    .expect("buffered answer");
    assert_eq!(
        command::uuid_from_be(&report.payload[5..9]),
        Some(0x7700_0000 | DOWNSTREAM_UUID)
    );
}

#[test]
fn test_support_requests_refused_when_unsupported() {
    let mut config = Config::default();
    config.downstream_addr = Some(TV);
    let (_node, bus) = open_node(config, None, STB);

    assert!(bus.inject(&command::request_lip_support(LogicalAddress::RECORDING_DEVICE_2, STB)));

    wait_for(&bus, Duration::from_secs(2), |msg| {
        lip_opcode(msg) == Some(LipOpcode::RequestLipSupport)
    })
    .expect("support probe");
    assert!(bus.inject(&command::feature_abort(
        TV,
        STB,
        CecOpcode::VENDOR_COMMAND_WITH_ID,
        AbortReason::Refused,
    )));

    let refusal = wait_for(&bus, Duration::from_secs(1), |msg| {
        abort_reason(msg) == Some(AbortReason::Refused as u8)
            && msg.destination == LogicalAddress::RECORDING_DEVICE_2
    });
    assert!(refusal.is_some());
}

#[test]
fn test_blocking_query_round_trip() {
    let (node, bus) = supported_hub(hub_config(), None);

    let result = thread::scope(|scope| {
        let query = scope.spawn(|| node.av_latency(sdr(4), ac3()));
        let request = wait_for(&bus, Duration::from_secs(2), |msg| {
            lip_opcode(msg) == Some(LipOpcode::RequestAvLatency)
        })
        .expect("downstream query");
        assert_eq!(request.destination, TV);
        assert_eq!(request.initiator, AVR);
        assert!(bus.inject(&command::report_av_latency(TV, AVR, 30, 5)));
        query.join().unwrap()
    });
    // downstream-only values: own latencies are not part of the answer
    assert_eq!(result, Ok((30, 5)));

    // and the values are now cached for an immediate second call
    assert_eq!(node.av_latency(sdr(4), ac3()), Ok((30, 5)));
    assert_eq!(node.audio_latency(ac3()), Ok(5));
    assert_eq!(node.video_latency(sdr(4)), Ok(30));
}

#[test]
fn test_blocking_query_requires_downstream() {
    let mut config = Config::default();
    config.render_mode = RenderMode::VIDEO | RenderMode::AUDIO;
    let (node, _bus) = open_node(config, None, TV);
    node.status(true);
    assert_eq!(node.av_latency(sdr(4), ac3()), Err(LipError::DownstreamUnknown));
}

#[test]
fn test_query_rejects_invalid_formats() {
    let (node, _bus) = supported_hub(hub_config(), None);
    assert_eq!(
        node.video_latency(sdr(219)),
        Err(LipError::InvalidVideoFormat)
    );
    assert_eq!(
        node.audio_latency(AudioFormat::new(AudioCodec(32))),
        Err(LipError::InvalidAudioFormat)
    );
}

#[test]
fn test_cache_persists_across_restart() {
    let store = MemStore::default();

    let (node, bus) = supported_hub(hub_config(), Some(store.clone()));
    assert!(bus.inject(&command::request_audio_latency(STB, AVR, ac3())));
    assert!(bus.inject(&command::report_audio_latency(TV, AVR, 5)));
    bus.take_sent();
    node.close();
    assert!(store.0.lock().contains_key(&DOWNSTREAM_UUID));

    // a new node learns the same downstream identity and restores the blob
    let (_node, bus) = supported_hub(hub_config(), Some(store));
    assert!(bus.inject(&command::request_audio_latency(STB, AVR, ac3())));
    let sent = bus.take_sent();
    let report = find_lip(&sent, LipOpcode::ReportAudioLatency).expect("restored cache hit");
    assert_eq!(report.payload[4], 20);
    assert!(find_lip(&sent, LipOpcode::RequestAudioLatency).is_none());
}

#[test]
fn test_foreign_and_malformed_frames() {
    let (_node, bus) = supported_hub(hub_config(), None);

    // not a lip frame at all: left for other bus users
    let mut foreign = command::request_lip_support(STB, AVR);
    foreign.opcode = CecOpcode(0x36);
    foreign.payload.clear();
    assert!(!bus.inject(&foreign));

    // vendor-tagged but unknown opcode
    let mut unknown = command::request_lip_support(STB, AVR);
    unknown.payload[3] = 0x20;
    assert!(bus.inject(&unknown));
    let sent = bus.take_sent();
    assert_eq!(
        abort_reason(sent.first().expect("abort")),
        Some(AbortReason::UnrecognizedOpcode as u8)
    );

    // too short for its opcode
    let mut short = command::request_av_latency(STB, AVR, sdr(4), ac3());
    short.payload.truncate(5);
    assert!(bus.inject(&short));
    let sent = bus.take_sent();
    assert_eq!(
        abort_reason(sent.first().expect("abort")),
        Some(AbortReason::InvalidOperand as u8)
    );

    // addressed to someone else: consumed silently
    let misdirected = command::request_audio_latency(STB, TV, ac3());
    assert!(bus.inject(&misdirected));
    assert!(bus.take_sent().is_empty());

    // out-of-range format tuple
    let invalid = command::request_audio_latency(STB, AVR, AudioFormat::new(AudioCodec(40)));
    assert!(bus.inject(&invalid));
    let sent = bus.take_sent();
    assert_eq!(
        abort_reason(sent.first().expect("abort")),
        Some(AbortReason::InvalidOperand as u8)
    );
}

#[test]
fn test_remove_upstream_peer() {
    let (node, bus) = supported_hub(hub_config(), None);
    assert!(bus.inject(&command::request_lip_support(STB, AVR)));
    assert!(bus.inject(&command::request_lip_support(PLAYER, AVR)));
    bus.take_sent();
    assert_eq!(node.status(false).upstream.len(), 2);

    assert_eq!(
        node.set_config(None, false, UpstreamRemoval::Peer(STB)),
        Ok(())
    );
    let status = node.status(false);
    assert_eq!(status.upstream.as_slice(), &[PLAYER][..]);

    assert_eq!(node.set_config(None, false, UpstreamRemoval::All), Ok(()));
    let status = node.status(false);
    assert!(status.upstream.is_empty());
    assert!(!status.connections.contains(ConnectionStatus::UPSTREAM_CONNECTED));
}

#[test]
fn test_queued_peer_request_promoted_after_answer() {
    let (_node, bus) = supported_hub(hub_config(), None);

    // first request goes downstream, second queues behind it
    assert!(bus.inject(&command::request_video_latency(STB, AVR, sdr(4))));
    assert!(bus.inject(&command::request_audio_latency(PLAYER, AVR, ac3())));
    let sent = bus.take_sent();
    assert!(find_lip(&sent, LipOpcode::RequestVideoLatency).is_some());
    assert!(find_lip(&sent, LipOpcode::RequestAudioLatency).is_none());

    // answering the first promotes the queued one onto the wire
    assert!(bus.inject(&command::report_video_latency(TV, AVR, 30)));
    let sent = bus.take_sent();
    assert_eq!(
        find_lip(&sent, LipOpcode::ReportVideoLatency).expect("first reply").destination,
        STB
    );
    let promoted = find_lip(&sent, LipOpcode::RequestAudioLatency).expect("promoted query");
    assert_eq!(promoted.destination, TV);

    assert!(bus.inject(&command::report_audio_latency(TV, AVR, 5)));
    let sent = bus.take_sent();
    let report = find_lip(&sent, LipOpcode::ReportAudioLatency).expect("second reply");
    assert_eq!(report.destination, PLAYER);
    assert_eq!(report.payload[4], 20);
}

#[test]
fn test_invalid_latency_values_propagate() {
    let (_node, bus) = supported_hub(hub_config(), None);

    assert!(bus.inject(&command::request_video_latency(STB, AVR, sdr(4))));
    assert!(bus.inject(&command::report_video_latency(TV, AVR, INVALID_LATENCY)));
    let sent = bus.take_sent();
    let report = find_lip(&sent, LipOpcode::ReportVideoLatency).expect("reply");
    assert_eq!(report.payload[4], INVALID_LATENCY);
}
