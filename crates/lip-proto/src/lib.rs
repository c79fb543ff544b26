//! Wire-level types for the Latency Information Protocol (LIP)
//!
//! LIP lets adjacent HDMI devices exchange audio/video rendering latencies.
//! It rides on CEC as `VENDOR_COMMAND_WITH_ID` frames tagged with the Dolby
//! vendor id. This crate implements the frame layer only:
//! - logical addressing and the raw CEC frame type,
//! - the LIP opcode set with its length table,
//! - audio/video format tuples and their wire packing,
//! - frame builders and field parsers.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

pub mod command;
pub mod format;
pub mod opcode;

use heapless::Vec;

/// Maximum CEC frame payload handled by this stack
pub const MAX_CEC_PAYLOAD: usize = 64;

/// Vendor id carried in the first three payload bytes of every LIP frame
pub const DOLBY_VENDOR_ID: [u8; 3] = [0x00, 0xD0, 0x46];

/// LIP protocol version transmitted in REPORT_LIP_SUPPORT / UPDATE_UUID
pub const PROTOCOL_VERSION: u8 = 0x00;

/// Latency value meaning "not available"
pub const INVALID_LATENCY: u8 = 255;

/// Upper bound on upstream peers a node tracks (one per logical address)
pub const MAX_UPSTREAM_DEVICES: usize = 16;

/// CEC logical address (4 bits)
///
/// The value is guaranteed to be in `0..=15`; use [`LogicalAddress::new`]
/// to construct from untrusted input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LogicalAddress(u8);

impl LogicalAddress {
    pub const TV: Self = Self(0);
    pub const RECORDING_DEVICE_1: Self = Self(1);
    pub const RECORDING_DEVICE_2: Self = Self(2);
    pub const TUNER_1: Self = Self(3);
    pub const PLAYBACK_DEVICE_1: Self = Self(4);
    pub const AUDIO_SYSTEM: Self = Self(5);
    pub const TUNER_2: Self = Self(6);
    pub const TUNER_3: Self = Self(7);
    pub const PLAYBACK_DEVICE_2: Self = Self(8);
    pub const RECORDING_DEVICE_3: Self = Self(9);
    pub const TUNER_4: Self = Self(10);
    pub const PLAYBACK_DEVICE_3: Self = Self(11);
    pub const RESERVED_1: Self = Self(12);
    pub const RESERVED_2: Self = Self(13);
    pub const FREE_USE: Self = Self(14);
    pub const UNREGISTERED: Self = Self(15);
    /// Address 15 doubles as the broadcast destination
    pub const BROADCAST: Self = Self(15);

    /// Create an address from a raw nibble
    pub const fn new(value: u8) -> Option<Self> {
        if value <= 15 {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Raw address value
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Address as an index into per-peer tables
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// True for address 15 used as a destination
    pub const fn is_broadcast(self) -> bool {
        self.0 == 15
    }
}

/// CEC opcode byte
///
/// Kept as an open set: the bus hands the receive callback every frame on
/// the wire, most of which are not LIP traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CecOpcode(pub u8);

impl CecOpcode {
    pub const FEATURE_ABORT: Self = Self(0x00);
    pub const VENDOR_COMMAND_WITH_ID: Self = Self(0xA0);
}

/// Reason code carried in a Feature Abort frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum AbortReason {
    UnrecognizedOpcode = 0,
    NotInCorrectModeToRespond = 1,
    CannotProvideSource = 2,
    InvalidOperand = 3,
    Refused = 4,
}

/// A single CEC frame with directed addressing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CecMessage {
    pub initiator: LogicalAddress,
    pub destination: LogicalAddress,
    pub opcode: CecOpcode,
    pub payload: Vec<u8, MAX_CEC_PAYLOAD>,
}
