//! LIP opcode set
//!
//! LIP frames carry the opcode in payload byte 3, after the vendor id.

/// LIP opcode byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum LipOpcode {
    RequestLipSupport = 0x10,
    ReportLipSupport = 0x11,
    RequestAvLatency = 0x12,
    ReportAvLatency = 0x13,
    RequestAudioLatency = 0x14,
    ReportAudioLatency = 0x15,
    RequestVideoLatency = 0x16,
    ReportVideoLatency = 0x17,
    UpdateUuid = 0x18,
}

impl LipOpcode {
    /// Decode an opcode byte
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x10 => Some(Self::RequestLipSupport),
            0x11 => Some(Self::ReportLipSupport),
            0x12 => Some(Self::RequestAvLatency),
            0x13 => Some(Self::ReportAvLatency),
            0x14 => Some(Self::RequestAudioLatency),
            0x15 => Some(Self::ReportAudioLatency),
            0x16 => Some(Self::RequestVideoLatency),
            0x17 => Some(Self::ReportVideoLatency),
            0x18 => Some(Self::UpdateUuid),
            _ => None,
        }
    }

    /// Minimum payload length for a frame carrying this opcode, counting the
    /// 3-byte vendor id and the opcode byte itself. The audio latency
    /// requests may carry one extra optional extension byte on top of this.
    pub const fn min_length(self) -> usize {
        match self {
            Self::RequestLipSupport => 4,
            Self::ReportLipSupport | Self::UpdateUuid => 9,
            Self::RequestAvLatency => 7,
            Self::ReportAvLatency => 6,
            Self::RequestAudioLatency => 5,
            Self::ReportAudioLatency => 5,
            Self::RequestVideoLatency => 6,
            Self::ReportVideoLatency => 5,
        }
    }

    /// True for the three latency query opcodes
    pub const fn is_latency_request(self) -> bool {
        matches!(
            self,
            Self::RequestAvLatency | Self::RequestAudioLatency | Self::RequestVideoLatency
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_round_trip() {
        for byte in 0x10..=0x18u8 {
            let opcode = LipOpcode::from_byte(byte).unwrap();
            assert_eq!(opcode as u8, byte);
        }
    }

    #[test]
    fn test_unknown_bytes_rejected() {
        assert_eq!(LipOpcode::from_byte(0x0F), None);
        assert_eq!(LipOpcode::from_byte(0x19), None);
        assert_eq!(LipOpcode::from_byte(0xA0), None);
    }

    #[test]
    fn test_min_lengths() {
        assert_eq!(LipOpcode::RequestLipSupport.min_length(), 4);
        assert_eq!(LipOpcode::ReportLipSupport.min_length(), 9);
        assert_eq!(LipOpcode::UpdateUuid.min_length(), 9);
        assert_eq!(LipOpcode::RequestAvLatency.min_length(), 7);
        assert_eq!(LipOpcode::ReportAvLatency.min_length(), 6);
        assert_eq!(LipOpcode::RequestAudioLatency.min_length(), 5);
        assert_eq!(LipOpcode::ReportAudioLatency.min_length(), 5);
        assert_eq!(LipOpcode::RequestVideoLatency.min_length(), 6);
        assert_eq!(LipOpcode::ReportVideoLatency.min_length(), 5);
    }

    #[test]
    fn test_latency_request_classification() {
        assert!(LipOpcode::RequestAvLatency.is_latency_request());
        assert!(LipOpcode::RequestAudioLatency.is_latency_request());
        assert!(LipOpcode::RequestVideoLatency.is_latency_request());
        assert!(!LipOpcode::RequestLipSupport.is_latency_request());
        assert!(!LipOpcode::ReportAvLatency.is_latency_request());
    }
}
