//! LIP frame construction and field extraction
//!
//! Builders mirror the on-wire layouts from the protocol tables; all
//! multi-byte fields are big-endian.

use heapless::Vec;

use crate::format::{AudioFormat, VideoFormat};
use crate::opcode::LipOpcode;
use crate::{AbortReason, CecMessage, CecOpcode, LogicalAddress, DOLBY_VENDOR_ID};

fn vendor_frame(
    initiator: LogicalAddress,
    destination: LogicalAddress,
    body: &[u8],
) -> CecMessage {
    debug_assert!(body.len() + DOLBY_VENDOR_ID.len() <= crate::MAX_CEC_PAYLOAD);
    let mut payload = Vec::new();
    let _ = payload.extend_from_slice(&DOLBY_VENDOR_ID);
    let _ = payload.extend_from_slice(body);
    CecMessage {
        initiator,
        destination,
        opcode: CecOpcode::VENDOR_COMMAND_WITH_ID,
        payload,
    }
}

/// Feature Abort for a rejected frame; `aborted` names the opcode being
/// refused (for LIP traffic always `VENDOR_COMMAND_WITH_ID`)
pub fn feature_abort(
    initiator: LogicalAddress,
    destination: LogicalAddress,
    aborted: CecOpcode,
    reason: AbortReason,
) -> CecMessage {
    let mut payload = Vec::new();
    let _ = payload.push(aborted.0);
    let _ = payload.push(reason as u8);
    CecMessage {
        initiator,
        destination,
        opcode: CecOpcode::FEATURE_ABORT,
        payload,
    }
}

pub fn request_lip_support(initiator: LogicalAddress, destination: LogicalAddress) -> CecMessage {
    vendor_frame(initiator, destination, &[LipOpcode::RequestLipSupport as u8])
}

/// REPORT_LIP_SUPPORT, or UPDATE_UUID when `update_uuid` is set; both carry
/// the protocol version and the (merged) device identity
pub fn report_lip_support(
    initiator: LogicalAddress,
    destination: LogicalAddress,
    version: u8,
    uuid: u32,
    update_uuid: bool,
) -> CecMessage {
    let opcode = if update_uuid {
        LipOpcode::UpdateUuid
    } else {
        LipOpcode::ReportLipSupport
    };
    let id = uuid.to_be_bytes();
    vendor_frame(
        initiator,
        destination,
        &[opcode as u8, version, id[0], id[1], id[2], id[3]],
    )
}

pub fn request_av_latency(
    initiator: LogicalAddress,
    destination: LogicalAddress,
    video: VideoFormat,
    audio: AudioFormat,
) -> CecMessage {
    let mut msg = vendor_frame(
        initiator,
        destination,
        &[
            LipOpcode::RequestAvLatency as u8,
            video.vic,
            video.hdr.to_wire(),
            audio.codec.0,
        ],
    );
    if let Some(ext) = audio.ext_byte() {
        let _ = msg.payload.push(ext);
    }
    msg
}

pub fn request_audio_latency(
    initiator: LogicalAddress,
    destination: LogicalAddress,
    audio: AudioFormat,
) -> CecMessage {
    let mut msg = vendor_frame(
        initiator,
        destination,
        &[LipOpcode::RequestAudioLatency as u8, audio.codec.0],
    );
    if let Some(ext) = audio.ext_byte() {
        let _ = msg.payload.push(ext);
    }
    msg
}

pub fn request_video_latency(
    initiator: LogicalAddress,
    destination: LogicalAddress,
    video: VideoFormat,
) -> CecMessage {
    vendor_frame(
        initiator,
        destination,
        &[
            LipOpcode::RequestVideoLatency as u8,
            video.vic,
            video.hdr.to_wire(),
        ],
    )
}

pub fn report_av_latency(
    initiator: LogicalAddress,
    destination: LogicalAddress,
    video_latency: u8,
    audio_latency: u8,
) -> CecMessage {
    vendor_frame(
        initiator,
        destination,
        &[LipOpcode::ReportAvLatency as u8, video_latency, audio_latency],
    )
}

pub fn report_audio_latency(
    initiator: LogicalAddress,
    destination: LogicalAddress,
    audio_latency: u8,
) -> CecMessage {
    vendor_frame(
        initiator,
        destination,
        &[LipOpcode::ReportAudioLatency as u8, audio_latency],
    )
}

pub fn report_video_latency(
    initiator: LogicalAddress,
    destination: LogicalAddress,
    video_latency: u8,
) -> CecMessage {
    vendor_frame(
        initiator,
        destination,
        &[LipOpcode::ReportVideoLatency as u8, video_latency],
    )
}

/// True when the payload starts with the Dolby vendor id
pub fn has_vendor_id(msg: &CecMessage) -> bool {
    msg.payload.len() >= DOLBY_VENDOR_ID.len() && msg.payload[..3] == DOLBY_VENDOR_ID
}

/// LIP opcode of a frame, when it is a well-tagged LIP frame with a known
/// opcode byte
pub fn lip_opcode(msg: &CecMessage) -> Option<LipOpcode> {
    if msg.opcode != CecOpcode::VENDOR_COMMAND_WITH_ID {
        return None;
    }
    if !has_vendor_id(msg) || msg.payload.len() < 4 {
        return None;
    }
    LipOpcode::from_byte(msg.payload[3])
}

/// Decode a big-endian device identity from 4 payload bytes
pub fn uuid_from_be(bytes: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = bytes.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}
