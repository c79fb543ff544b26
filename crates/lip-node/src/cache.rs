//! Downstream latency cache
//!
//! Measured latencies of the downstream chain, keyed by format tuple and
//! associated with one downstream device identity. A parallel validity map
//! distinguishes "measured as 255 (invalid)" from "never measured". The
//! whole cache serializes to a fixed-size blob for the persistence
//! collaborator.

use lip_proto::format::{
    AudioFormat, VideoFormat, AUDIO_CODECS, AUDIO_EXTENSIONS, AUDIO_SUBTYPES, COLOR_FORMATS,
    HDR_MODES_PER_FORMAT, MAX_VICS,
};
use lip_proto::INVALID_LATENCY;

use crate::config::{AudioLatencies, VideoLatencies};

const VIDEO_CELLS: usize = MAX_VICS * COLOR_FORMATS * HDR_MODES_PER_FORMAT;
const AUDIO_CELLS: usize = AUDIO_CODECS * AUDIO_SUBTYPES * AUDIO_EXTENSIONS;

/// Size of the persistence blob: enabled flag, then values and validity for
/// both dimensions
pub const SERIALIZED_LEN: usize = 1 + 2 * VIDEO_CELLS + 2 * AUDIO_CELLS;

type VideoValid = [[[bool; HDR_MODES_PER_FORMAT]; COLOR_FORMATS]; MAX_VICS];
type AudioValid = [[[bool; AUDIO_EXTENSIONS]; AUDIO_SUBTYPES]; AUDIO_CODECS];

/// Latency cache for one downstream device identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyCache {
    enabled: bool,
    video: VideoLatencies,
    video_valid: VideoValid,
    audio: AudioLatencies,
    audio_valid: AudioValid,
}

impl LatencyCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            video: [[[INVALID_LATENCY; HDR_MODES_PER_FORMAT]; COLOR_FORMATS]; MAX_VICS],
            video_valid: [[[false; HDR_MODES_PER_FORMAT]; COLOR_FORMATS]; MAX_VICS],
            audio: [[[INVALID_LATENCY; AUDIO_EXTENSIONS]; AUDIO_SUBTYPES]; AUDIO_CODECS],
            audio_valid: [[[false; AUDIO_EXTENSIONS]; AUDIO_SUBTYPES]; AUDIO_CODECS],
        }
    }

    /// Invalidate the selected dimensions
    pub fn clear(&mut self, clear_audio: bool, clear_video: bool) {
        if clear_video {
            self.video = [[[INVALID_LATENCY; HDR_MODES_PER_FORMAT]; COLOR_FORMATS]; MAX_VICS];
            self.video_valid = [[[false; HDR_MODES_PER_FORMAT]; COLOR_FORMATS]; MAX_VICS];
        }
        if clear_audio {
            self.audio = [[[INVALID_LATENCY; AUDIO_EXTENSIONS]; AUDIO_SUBTYPES]; AUDIO_CODECS];
            self.audio_valid = [[[false; AUDIO_EXTENSIONS]; AUDIO_SUBTYPES]; AUDIO_CODECS];
        }
    }

    /// Cached downstream video latency, `None` on miss or out-of-range VIC
    pub fn video_latency(&self, format: VideoFormat) -> Option<u8> {
        if !self.enabled || !format.is_valid() {
            return None;
        }
        let (vic, color, mode) = video_index(format);
        if self.video_valid[vic][color][mode] {
            Some(self.video[vic][color][mode])
        } else {
            None
        }
    }

    /// Record a downstream video latency; out-of-range formats are ignored
    pub fn set_video_latency(&mut self, format: VideoFormat, latency: u8) {
        if !format.is_valid() {
            return;
        }
        let (vic, color, mode) = video_index(format);
        self.video[vic][color][mode] = latency;
        self.video_valid[vic][color][mode] = true;
    }

    /// Cached downstream audio latency, `None` on miss or invalid tuple
    pub fn audio_latency(&self, format: AudioFormat) -> Option<u8> {
        if !self.enabled || !format.is_valid() {
            return None;
        }
        let (codec, subtype, ext) = audio_index(format);
        if self.audio_valid[codec][subtype][ext] {
            Some(self.audio[codec][subtype][ext])
        } else {
            None
        }
    }

    /// Record a downstream audio latency; invalid tuples are ignored
    pub fn set_audio_latency(&mut self, format: AudioFormat, latency: u8) {
        if !format.is_valid() {
            return;
        }
        let (codec, subtype, ext) = audio_index(format);
        self.audio[codec][subtype][ext] = latency;
        self.audio_valid[codec][subtype][ext] = true;
    }

    /// Serialize into the fixed persistence layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SERIALIZED_LEN);
        bytes.push(self.enabled as u8);
        for row in self.video.iter().flatten().flatten() {
            bytes.push(*row);
        }
        for valid in self.video_valid.iter().flatten().flatten() {
            bytes.push(*valid as u8);
        }
        for row in self.audio.iter().flatten().flatten() {
            bytes.push(*row);
        }
        for valid in self.audio_valid.iter().flatten().flatten() {
            bytes.push(*valid as u8);
        }
        bytes
    }

    /// Rebuild from a persistence blob; fails on wrong length or malformed
    /// validity bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SERIALIZED_LEN {
            return None;
        }
        let enabled = match bytes[0] {
            0 => false,
            1 => true,
            _ => return None,
        };
        let mut cache = Self::new(enabled);
        let mut offset = 1;
        for cell in cache.video.iter_mut().flatten().flatten() {
            *cell = bytes[offset];
            offset += 1;
        }
        for valid in cache.video_valid.iter_mut().flatten().flatten() {
            match bytes[offset] {
                0 => *valid = false,
                1 => *valid = true,
                _ => return None,
            }
            offset += 1;
        }
        for cell in cache.audio.iter_mut().flatten().flatten() {
            *cell = bytes[offset];
            offset += 1;
        }
        for valid in cache.audio_valid.iter_mut().flatten().flatten() {
            match bytes[offset] {
                0 => *valid = false,
                1 => *valid = true,
                _ => return None,
            }
            offset += 1;
        }
        Some(cache)
    }
}

fn video_index(format: VideoFormat) -> (usize, usize, usize) {
    (
        format.vic as usize,
        format.hdr.color_index(),
        format.hdr.mode_index(),
    )
}

fn audio_index(format: AudioFormat) -> (usize, usize, usize) {
    (
        format.codec.0 as usize,
        format.subtype as usize,
        format.ext as usize,
    )
}
