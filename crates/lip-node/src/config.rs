//! Engine configuration

use bitflags::bitflags;
use lip_proto::format::{
    AudioFormat, VideoFormat, AUDIO_CODECS, AUDIO_EXTENSIONS, AUDIO_SUBTYPES, COLOR_FORMATS,
    HDR_MODES_PER_FORMAT, MAX_VICS,
};
use lip_proto::{LogicalAddress, INVALID_LATENCY};

/// Own-latency table for video formats, indexed `[vic][color][hdr mode]`
pub type VideoLatencies = [[[u8; HDR_MODES_PER_FORMAT]; COLOR_FORMATS]; MAX_VICS];

/// Own-latency table for audio formats, indexed `[codec][subtype][ext]`
pub type AudioLatencies = [[[u8; AUDIO_EXTENSIONS]; AUDIO_SUBTYPES]; AUDIO_CODECS];

/// Stable device id, upper 16 bits of the identity
pub const UUID_DEVICE_MASK: u32 = 0xFFFF_0000;
/// Video rendering mode, upper octet of the lower identity half
pub const UUID_VIDEO_MODE_MASK: u32 = 0x0000_FF00;
/// Audio rendering mode, lower octet of the identity
pub const UUID_AUDIO_MODE_MASK: u32 = 0x0000_00FF;

bitflags! {
    /// Which dimensions this node renders itself
    ///
    /// A renderer reports its own latency for that dimension; a
    /// non-renderer defers to its downstream device and adds nothing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RenderMode: u32 {
        const VIDEO = 1 << 1;
        const AUDIO = 1 << 2;
    }
}

/// Node configuration
///
/// Latency cells are milliseconds; 255 marks an unsupported format. Source
/// devices that will never serve an upstream peer can leave the tables at
/// their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address of the downstream device, `None` for a sink
    pub downstream_addr: Option<LogicalAddress>,
    /// Device identity: stable id in the top 16 bits, rendering mode below
    pub uuid: u32,
    pub render_mode: RenderMode,
    pub video_latencies: VideoLatencies,
    pub audio_latencies: AudioLatencies,
    /// Set when this device transcodes audio before passing it downstream
    pub audio_transcoding: bool,
    /// Output format of the transcoder, used for downstream queries
    pub audio_transcoding_format: AudioFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            downstream_addr: None,
            uuid: 0,
            render_mode: RenderMode::empty(),
            video_latencies: [[[INVALID_LATENCY; HDR_MODES_PER_FORMAT]; COLOR_FORMATS]; MAX_VICS],
            audio_latencies: [[[INVALID_LATENCY; AUDIO_EXTENSIONS]; AUDIO_SUBTYPES]; AUDIO_CODECS],
            audio_transcoding: false,
            audio_transcoding_format: AudioFormat::from_wire(0, None),
        }
    }
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.audio_transcoding && !self.audio_transcoding_format.is_valid() {
            return Err("audio transcoding is enabled but the transcoding format is invalid");
        }
        Ok(())
    }

    /// Own video latency for a format; the caller guarantees a valid VIC
    pub fn video_latency(&self, format: VideoFormat) -> u8 {
        match self.video_latencies.get(format.vic as usize) {
            Some(row) => row[format.hdr.color_index()][format.hdr.mode_index()],
            None => INVALID_LATENCY,
        }
    }

    /// Own audio latency for a format; out-of-range tuples are invalid
    pub fn audio_latency(&self, format: AudioFormat) -> u8 {
        self.audio_latencies
            .get(format.codec.0 as usize)
            .and_then(|row| row.get(format.subtype as usize))
            .and_then(|row| row.get(format.ext as usize))
            .copied()
            .unwrap_or(INVALID_LATENCY)
    }

    /// Set one cell of the video latency table; out-of-range is a no-op
    pub fn set_video_latency(&mut self, format: VideoFormat, latency: u8) {
        if let Some(row) = self.video_latencies.get_mut(format.vic as usize) {
            row[format.hdr.color_index()][format.hdr.mode_index()] = latency;
        }
    }

    /// Set one cell of the audio latency table; out-of-range is a no-op
    pub fn set_audio_latency(&mut self, format: AudioFormat, latency: u8) {
        if let Some(cell) = self
            .audio_latencies
            .get_mut(format.codec.0 as usize)
            .and_then(|row| row.get_mut(format.subtype as usize))
            .and_then(|row| row.get_mut(format.ext as usize))
        {
            *cell = latency;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lip_proto::format::{AudioCodec, HdrMode, HdrStatic};

    #[test]
    fn test_default_tables_are_invalid() {
        let config = Config::default();
        let video = VideoFormat::new(16, HdrMode::Static(HdrStatic::Sdr));
        let audio = AudioFormat::new(AudioCodec::EAC3);
        assert_eq!(config.video_latency(video), INVALID_LATENCY);
        assert_eq!(config.audio_latency(audio), INVALID_LATENCY);
    }

    #[test]
    fn test_latency_table_round_trip() {
        let mut config = Config::default();
        let video = VideoFormat::new(4, HdrMode::Static(HdrStatic::Hlg));
        let audio = AudioFormat::with_extension(AudioCodec::MAT, 1, 2);
        config.set_video_latency(video, 33);
        config.set_audio_latency(audio, 44);
        assert_eq!(config.video_latency(video), 33);
        assert_eq!(config.audio_latency(audio), 44);
    }

    #[test]
    fn test_out_of_range_access() {
        let mut config = Config::default();
        let audio = AudioFormat::with_extension(AudioCodec(40), 0, 0);
        config.set_audio_latency(audio, 10);
        assert_eq!(config.audio_latency(audio), INVALID_LATENCY);
    }

    #[test]
    fn test_validate_transcoding_format() {
        let mut config = Config::default();
        config.audio_transcoding = true;
        config.audio_transcoding_format = AudioFormat::new(AudioCodec(33));
        assert!(config.validate().is_err());
        config.audio_transcoding_format = AudioFormat::new(AudioCodec::MAT);
        assert!(config.validate().is_ok());
    }
}
