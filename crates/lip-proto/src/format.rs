//! Audio and video format tuples and their wire packing
//!
//! A video format is a VIC plus an HDR mode; the HDR mode is packed into a
//! single wire byte with disjoint ranges per color format. An audio format
//! is an IEC 61937-2 codec with an optional subtype/extension byte.

/// Number of Video Identification Codes (CTA-861)
pub const MAX_VICS: usize = 219;

/// Number of color format families
pub const COLOR_FORMATS: usize = 3;

/// Table extent of HDR modes within one color format family
pub const HDR_MODES_PER_FORMAT: usize = 4;

/// IEC 61937-2 codec code space (bits 0-4 of Pc)
pub const AUDIO_CODECS: usize = 32;

/// Audio format subtypes (bits 5-6 of Pc)
pub const AUDIO_SUBTYPES: usize = 4;

/// Audio format extension code space (bits 7-12 of Pc)
pub const AUDIO_EXTENSIONS: usize = 32;

/// Wire offset of static HDR modes
const HDR_STATIC_OFFSET: u8 = 0;
/// Wire offset of dynamic HDR modes
const HDR_DYNAMIC_OFFSET: u8 = 64;
/// Wire offset of Dolby Vision modes
const DOLBY_VISION_OFFSET: u8 = 128;

/// Static metadata EOTF (CTA-861-G, sec. 7.5.13, table 85)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum HdrStatic {
    Sdr = 0,
    Hdr = 1,
    SmpteSt2084 = 2,
    Hlg = 3,
}

/// Dynamic HDR metadata type (CTA-861-G, table 47)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum HdrDynamic {
    SmpteSt2094_10 = 0,
    EtsiTs103_433 = 1,
    ItuTH265 = 2,
    SmpteSt2094_40 = 3,
}

/// Dolby Vision mode (Vendor-Specific Video Data Block)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DolbyVision {
    SinkLed = 0,
    SourceLed = 1,
}

/// HDR mode, one variant per color format family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HdrMode {
    Static(HdrStatic),
    Dynamic(HdrDynamic),
    DolbyVision(DolbyVision),
}

impl HdrMode {
    /// Pack into the wire byte (disjoint ranges per color format)
    pub const fn to_wire(self) -> u8 {
        match self {
            Self::Static(mode) => HDR_STATIC_OFFSET + mode as u8,
            Self::Dynamic(mode) => HDR_DYNAMIC_OFFSET + mode as u8,
            Self::DolbyVision(mode) => DOLBY_VISION_OFFSET + mode as u8,
        }
    }

    /// Decode the wire byte; values outside the defined ranges are reserved
    pub const fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Static(HdrStatic::Sdr)),
            1 => Some(Self::Static(HdrStatic::Hdr)),
            2 => Some(Self::Static(HdrStatic::SmpteSt2084)),
            3 => Some(Self::Static(HdrStatic::Hlg)),
            64 => Some(Self::Dynamic(HdrDynamic::SmpteSt2094_10)),
            65 => Some(Self::Dynamic(HdrDynamic::EtsiTs103_433)),
            66 => Some(Self::Dynamic(HdrDynamic::ItuTH265)),
            67 => Some(Self::Dynamic(HdrDynamic::SmpteSt2094_40)),
            128 => Some(Self::DolbyVision(DolbyVision::SinkLed)),
            129 => Some(Self::DolbyVision(DolbyVision::SourceLed)),
            _ => None,
        }
    }

    /// Color format family index for table addressing
    pub const fn color_index(self) -> usize {
        match self {
            Self::Static(_) => 0,
            Self::Dynamic(_) => 1,
            Self::DolbyVision(_) => 2,
        }
    }

    /// Mode index within the color format family
    pub const fn mode_index(self) -> usize {
        match self {
            Self::Static(mode) => mode as usize,
            Self::Dynamic(mode) => mode as usize,
            Self::DolbyVision(mode) => mode as usize,
        }
    }
}

/// Video format tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VideoFormat {
    pub vic: u8,
    pub hdr: HdrMode,
}

impl VideoFormat {
    pub const fn new(vic: u8, hdr: HdrMode) -> Self {
        Self { vic, hdr }
    }

    /// True when the VIC is in range; the HDR mode is valid by construction
    pub const fn is_valid(&self) -> bool {
        (self.vic as usize) < MAX_VICS
    }
}

/// IEC 61937-2 audio codec code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AudioCodec(pub u8);

impl AudioCodec {
    pub const PCM: Self = Self(0);
    pub const AC3: Self = Self(1);
    pub const SMPTE_ST_338: Self = Self(2);
    pub const PAUSE_BURST: Self = Self(3);
    pub const MPEG1_L1: Self = Self(4);
    pub const MPEG1_L2_L3: Self = Self(5);
    pub const MPEG2: Self = Self(6);
    pub const MPEG2_AAC: Self = Self(7);
    pub const MPEG2_L1: Self = Self(8);
    pub const MPEG2_L2: Self = Self(9);
    pub const MPEG2_L3: Self = Self(10);
    pub const DTS_TYPE_I: Self = Self(11);
    pub const DTS_TYPE_II: Self = Self(12);
    pub const DTS_TYPE_III: Self = Self(13);
    pub const ATRAC: Self = Self(14);
    pub const ATRAC_2_3: Self = Self(15);
    pub const ATRAC_X: Self = Self(16);
    pub const DTS_TYPE_IV: Self = Self(17);
    pub const WMA_PRO: Self = Self(18);
    pub const MPEG2_AAC_LSF: Self = Self(19);
    pub const MPEG4_AAC: Self = Self(20);
    pub const EAC3: Self = Self(21);
    pub const MAT: Self = Self(22);
    pub const MPEG4: Self = Self(23);

    /// True when the code is inside the 5-bit IEC 61937-2 space
    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < AUDIO_CODECS
    }
}

/// Audio format tuple
///
/// `subtype` and `ext` are optional refinements; both zero means the plain
/// codec and suppresses the extension byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AudioFormat {
    pub codec: AudioCodec,
    pub subtype: u8,
    pub ext: u8,
}

impl AudioFormat {
    /// Plain codec, no subtype or extension
    pub const fn new(codec: AudioCodec) -> Self {
        Self {
            codec,
            subtype: 0,
            ext: 0,
        }
    }

    pub const fn with_extension(codec: AudioCodec, subtype: u8, ext: u8) -> Self {
        Self { codec, subtype, ext }
    }

    pub const fn is_valid(&self) -> bool {
        self.codec.is_valid()
            && (self.subtype as usize) < AUDIO_SUBTYPES
            && (self.ext as usize) < AUDIO_EXTENSIONS
    }

    /// Wire extension byte, present only when subtype or ext is set
    pub const fn ext_byte(&self) -> Option<u8> {
        if self.subtype != 0 || self.ext != 0 {
            Some((self.ext << 2) | self.subtype)
        } else {
            None
        }
    }

    /// Decode from the codec byte and the optional extension byte
    pub const fn from_wire(codec: u8, ext_byte: Option<u8>) -> Self {
        match ext_byte {
            Some(byte) => Self {
                codec: AudioCodec(codec),
                subtype: byte & 0x3,
                ext: byte >> 2,
            },
            None => Self {
                codec: AudioCodec(codec),
                subtype: 0,
                ext: 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hdr_wire_offsets() {
        assert_eq!(HdrMode::Static(HdrStatic::Sdr).to_wire(), 0);
        assert_eq!(HdrMode::Static(HdrStatic::Hlg).to_wire(), 3);
        assert_eq!(HdrMode::Dynamic(HdrDynamic::SmpteSt2094_10).to_wire(), 64);
        assert_eq!(HdrMode::Dynamic(HdrDynamic::SmpteSt2094_40).to_wire(), 67);
        assert_eq!(HdrMode::DolbyVision(DolbyVision::SinkLed).to_wire(), 128);
        assert_eq!(HdrMode::DolbyVision(DolbyVision::SourceLed).to_wire(), 129);
    }

    #[test]
    fn test_hdr_reserved_values_rejected() {
        for value in [4u8, 63, 68, 127, 130, 255] {
            assert_eq!(HdrMode::from_wire(value), None, "value {value}");
        }
    }

    #[test]
    fn test_hdr_table_indices() {
        let mode = HdrMode::Dynamic(HdrDynamic::ItuTH265);
        assert_eq!(mode.color_index(), 1);
        assert_eq!(mode.mode_index(), 2);
        assert!(HdrMode::DolbyVision(DolbyVision::SourceLed).mode_index() < HDR_MODES_PER_FORMAT);
    }

    #[test]
    fn test_video_format_vic_range() {
        let hdr = HdrMode::Static(HdrStatic::Sdr);
        assert!(VideoFormat::new(0, hdr).is_valid());
        assert!(VideoFormat::new(218, hdr).is_valid());
        assert!(!VideoFormat::new(219, hdr).is_valid());
    }

    #[test]
    fn test_audio_ext_byte_optional() {
        assert_eq!(AudioFormat::new(AudioCodec::AC3).ext_byte(), None);
        assert_eq!(
            AudioFormat::with_extension(AudioCodec::MAT, 1, 0).ext_byte(),
            Some(0x01)
        );
        assert_eq!(
            AudioFormat::with_extension(AudioCodec::MAT, 0, 3).ext_byte(),
            Some(0x0C)
        );
    }

    #[test]
    fn test_audio_format_validation() {
        assert!(AudioFormat::new(AudioCodec::EAC3).is_valid());
        assert!(AudioFormat::with_extension(AudioCodec(31), 3, 31).is_valid());
        assert!(!AudioFormat::new(AudioCodec(32)).is_valid());
        assert!(!AudioFormat::with_extension(AudioCodec::AC3, 4, 0).is_valid());
        assert!(!AudioFormat::with_extension(AudioCodec::AC3, 0, 32).is_valid());
    }

    proptest! {
        #[test]
        fn prop_hdr_mode_round_trips(value in 0u8..=255) {
            if let Some(mode) = HdrMode::from_wire(value) {
                prop_assert_eq!(mode.to_wire(), value);
            }
        }

        #[test]
        fn prop_audio_format_round_trips(codec in 0u8..32, subtype in 0u8..4, ext in 0u8..32) {
            let format = AudioFormat::with_extension(AudioCodec(codec), subtype, ext);
            let decoded = AudioFormat::from_wire(codec, format.ext_byte());
            prop_assert_eq!(decoded, format);
        }
    }
}
