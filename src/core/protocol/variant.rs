//! Wire-format variants for the SP105E controller family
//! Each variant is described by a `FrameLayout` table; the encoders in the
//! parent module only read these tables.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ValidationError;

/// Candidate wire formats observed across cup batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// `[0x38, d1, d2, d3, cmd, 0x83]`, the format confirmed on most cups
    #[default]
    Classic6,
    /// Bare `[cmd, d1, d2, d3]` without start or end markers
    Compact4,
    /// Classic markers around a four byte payload
    Extended7,
    /// `0x7E` header, command first, additive checksum instead of an end marker
    Checksum8,
    /// `7E 00 .. EF` framing used by the later firmware
    Framed9,
}

/// Every variant, in the order a fallback probe should try them.
pub const ALL_VARIANTS: [Variant; 5] = [
    Variant::Classic6,
    Variant::Extended7,
    Variant::Framed9,
    Variant::Checksum8,
    Variant::Compact4,
];

/// How a frame is closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trailer {
    None,
    Fixed(u8),
    /// Wrapping sum of every preceding byte
    Checksum,
}

impl Trailer {
    fn len(self) -> usize {
        match self {
            Trailer::None => 0,
            Trailer::Fixed(_) | Trailer::Checksum => 1,
        }
    }
}

/// Command-type byte for each logical command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcodes {
    pub color: u8,
    pub brightness: u8,
    pub mode: u8,
    pub speed: u8,
    pub power_on: u8,
    pub power_off: u8,
}

/// Pattern codes for the animated modes. `Static` has no code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeCodes {
    pub rainbow: u8,
    pub pulse: u8,
    pub strobe: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub header: &'static [u8],
    /// Command byte precedes the payload instead of following it
    pub command_first: bool,
    pub payload_len: usize,
    pub trailer: Trailer,
    pub opcodes: Opcodes,
    pub mode_codes: ModeCodes,
    /// Byte placed ahead of R, G, B in color payloads
    pub color_tag: Option<u8>,
    /// How many times the rescaled brightness is written into the payload
    pub brightness_repeat: usize,
    pub brightness_max: u8,
    pub speed_max: u8,
    pub power_on_payload: &'static [u8],
    pub power_off_payload: &'static [u8],
    /// Power-on frame must be sent before the controller accepts commands
    pub handshake: bool,
}

const CLASSIC6: FrameLayout = FrameLayout {
    header: &[0x38],
    command_first: false,
    payload_len: 3,
    trailer: Trailer::Fixed(0x83),
    opcodes: Opcodes {
        color: 0x22,
        brightness: 0x2A,
        mode: 0x2C,
        speed: 0x03,
        power_on: 0xAA,
        power_off: 0xAB,
    },
    mode_codes: ModeCodes {
        rainbow: 0x01,
        pulse: 0x03,
        strobe: 0x06,
    },
    color_tag: None,
    brightness_repeat: 3,
    brightness_max: 255,
    speed_max: 255,
    power_on_payload: &[],
    power_off_payload: &[],
    handshake: false,
};

const COMPACT4: FrameLayout = FrameLayout {
    header: &[],
    command_first: true,
    payload_len: 3,
    trailer: Trailer::None,
    opcodes: Opcodes {
        color: 0x56,
        brightness: 0x20,
        mode: 0xBB,
        speed: 0x21,
        power_on: 0xCC,
        power_off: 0xCC,
    },
    mode_codes: ModeCodes {
        rainbow: 0x25,
        pulse: 0x26,
        strobe: 0x30,
    },
    color_tag: None,
    brightness_repeat: 1,
    brightness_max: 255,
    speed_max: 31,
    power_on_payload: &[0x23, 0x33],
    power_off_payload: &[0x24, 0x33],
    handshake: false,
};

const EXTENDED7: FrameLayout = FrameLayout {
    header: &[0x38],
    command_first: false,
    payload_len: 4,
    trailer: Trailer::Fixed(0x83),
    opcodes: CLASSIC6.opcodes,
    mode_codes: CLASSIC6.mode_codes,
    color_tag: None,
    brightness_repeat: 1,
    brightness_max: 255,
    speed_max: 255,
    power_on_payload: &[],
    power_off_payload: &[],
    handshake: true,
};

const CHECKSUM8: FrameLayout = FrameLayout {
    header: &[0x7E],
    command_first: true,
    payload_len: 5,
    trailer: Trailer::Checksum,
    opcodes: Opcodes {
        color: 0x05,
        brightness: 0x01,
        mode: 0x03,
        speed: 0x02,
        power_on: 0x04,
        power_off: 0x04,
    },
    mode_codes: ModeCodes {
        rainbow: 0x88,
        pulse: 0x8A,
        strobe: 0x96,
    },
    color_tag: None,
    brightness_repeat: 1,
    brightness_max: 255,
    speed_max: 100,
    power_on_payload: &[0x01],
    power_off_payload: &[0x00],
    handshake: true,
};

const FRAMED9: FrameLayout = FrameLayout {
    header: &[0x7E, 0x00],
    command_first: true,
    payload_len: 5,
    trailer: Trailer::Fixed(0xEF),
    opcodes: CHECKSUM8.opcodes,
    mode_codes: CHECKSUM8.mode_codes,
    color_tag: Some(0x03),
    brightness_repeat: 1,
    brightness_max: 100,
    speed_max: 100,
    power_on_payload: &[0xF0, 0x00, 0x01, 0xFF],
    power_off_payload: &[0x00, 0x00, 0x00, 0xFF],
    handshake: true,
};

impl Variant {
    /// The byte layout table for this variant
    pub fn layout(self) -> &'static FrameLayout {
        match self {
            Variant::Classic6 => &CLASSIC6,
            Variant::Compact4 => &COMPACT4,
            Variant::Extended7 => &EXTENDED7,
            Variant::Checksum8 => &CHECKSUM8,
            Variant::Framed9 => &FRAMED9,
        }
    }

    pub fn frame_len(self) -> usize {
        self.layout().frame_len()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Variant::Classic6 => "classic6",
            Variant::Compact4 => "compact4",
            Variant::Extended7 => "extended7",
            Variant::Checksum8 => "checksum8",
            Variant::Framed9 => "framed9",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_VARIANTS
            .iter()
            .copied()
            .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ValidationError::UnknownVariant(s.to_string()))
    }
}

impl FrameLayout {
    pub fn frame_len(&self) -> usize {
        self.header.len() + 1 + self.payload_len + self.trailer.len()
    }

    /// Assembles a frame. Payloads shorter than the layout are zero padded.
    pub fn build(&self, opcode: u8, payload: &[u8]) -> Vec<u8> {
        debug_assert!(payload.len() <= self.payload_len);

        let mut bytes = Vec::with_capacity(self.frame_len());
        bytes.extend_from_slice(self.header);
        if self.command_first {
            bytes.push(opcode);
        }
        bytes.extend(
            payload
                .iter()
                .copied()
                .chain(std::iter::repeat(0))
                .take(self.payload_len),
        );
        if !self.command_first {
            bytes.push(opcode);
        }
        match self.trailer {
            Trailer::None => {}
            Trailer::Fixed(end) => bytes.push(end),
            Trailer::Checksum => {
                let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
                bytes.push(sum);
            }
        }
        bytes
    }

    /// Splits a frame back into its command byte and payload, checking the
    /// markers (or checksum) on the way.
    pub fn parse<'a>(&self, frame: &'a [u8]) -> Option<(u8, &'a [u8])> {
        if frame.len() != self.frame_len() || !frame.starts_with(self.header) {
            return None;
        }
        let body_end = frame.len() - self.trailer.len();
        match self.trailer {
            Trailer::None => {}
            Trailer::Fixed(end) => {
                if frame[body_end] != end {
                    return None;
                }
            }
            Trailer::Checksum => {
                let sum = frame[..body_end]
                    .iter()
                    .fold(0u8, |acc, b| acc.wrapping_add(*b));
                if frame[body_end] != sum {
                    return None;
                }
            }
        }

        let body = &frame[self.header.len()..body_end];
        if self.command_first {
            Some((body[0], &body[1..]))
        } else {
            let (payload, opcode) = body.split_at(body.len() - 1);
            Some((opcode[0], payload))
        }
    }
}
