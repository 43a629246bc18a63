//! SP105E protocol codec
//! Pure functions mapping logical commands to fixed-length frames for a
//! selected wire-format variant. Nothing in here touches Bluetooth.

mod color;
mod variant;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use color::{hex_to_rgb, rgb_to_hex, Rgb};
pub use variant::{FrameLayout, ModeCodes, Opcodes, Trailer, Variant, ALL_VARIANTS};

/// Rejected command input. Raised before any Bluetooth call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("malformed hex color: {0:?}")]
    MalformedHex(String),
    #[error("unknown lighting mode: {0:?}")]
    UnknownMode(String),
    #[error("unknown protocol variant: {0:?}")]
    UnknownVariant(String),
    #[error("raw command must not be empty")]
    EmptyFrame,
}

/// Lighting modes the cups support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Static,
    Pulse,
    Strobe,
    Rainbow,
}

impl Mode {
    /// Pattern code for this mode, `None` for `Static`.
    pub fn pattern_code(self, variant: Variant) -> Option<u8> {
        let codes = variant.layout().mode_codes;
        match self {
            Mode::Static => None,
            Mode::Pulse => Some(codes.pulse),
            Mode::Strobe => Some(codes.strobe),
            Mode::Rainbow => Some(codes.rainbow),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Static => "static",
            Mode::Pulse => "pulse",
            Mode::Strobe => "strobe",
            Mode::Rainbow => "rainbow",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(Mode::Static),
            "pulse" => Ok(Mode::Pulse),
            "strobe" => Ok(Mode::Strobe),
            "rainbow" => Ok(Mode::Rainbow),
            _ => Err(ValidationError::UnknownMode(s.to_string())),
        }
    }
}

/// An encoded frame, ready to be written to the controller
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame(Vec<u8>);

impl Frame {
    /// Wraps caller-supplied bytes. Used for raw commands, which bypass the
    /// variant tables.
    pub fn raw(bytes: Vec<u8>) -> Result<Self, ValidationError> {
        if bytes.is_empty() {
            return Err(ValidationError::EmptyFrame);
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// A logical intent addressed to one cup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Color(Rgb),
    /// Percent, 0..=100
    Brightness(u8),
    Mode(Mode),
    /// Percent, 0..=100
    Speed(u8),
    Power(bool),
}

impl Command {
    pub fn color(r: i32, g: i32, b: i32) -> Result<Self, ValidationError> {
        Ok(Command::Color(Rgb::checked(r, g, b)?))
    }

    pub fn brightness(value: i32) -> Result<Self, ValidationError> {
        Ok(Command::Brightness(percent("brightness", value)?))
    }

    pub fn speed(value: i32) -> Result<Self, ValidationError> {
        Ok(Command::Speed(percent("speed", value)?))
    }

    /// Encodes the command. `Mode(Static)` yields no frame since the color
    /// alone determines what the cup shows.
    pub fn encode(&self, variant: Variant) -> Result<Option<Frame>, ValidationError> {
        Ok(match *self {
            Command::Color(rgb) => Some(encode_rgb(rgb, variant)),
            Command::Brightness(percent) => Some(encode_brightness(i32::from(percent), variant)?),
            Command::Mode(mode) => encode_mode(mode, variant),
            Command::Speed(percent) => Some(encode_speed(i32::from(percent), variant)?),
            Command::Power(on) => Some(encode_power(on, variant)),
        })
    }
}

fn percent(field: &'static str, value: i32) -> Result<u8, ValidationError> {
    if (0..=100).contains(&value) {
        Ok(value as u8)
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value: i64::from(value),
            min: 0,
            max: 100,
        })
    }
}

/// Rescales a 0..=100 percentage to `0..=max`, rounding half up.
pub fn rescale_percent(percent: u8, max: u8) -> u8 {
    let percent = u32::from(percent.min(100));
    ((percent * u32::from(max) + 50) / 100) as u8
}

/// Clamps a brightness percentage to a 10% floor so test flashes stay visible.
pub fn visible_brightness(percent: i32) -> u8 {
    percent.clamp(10, 100) as u8
}

pub fn encode_color(r: i32, g: i32, b: i32, variant: Variant) -> Result<Frame, ValidationError> {
    Ok(encode_rgb(Rgb::checked(r, g, b)?, variant))
}

pub fn encode_rgb(rgb: Rgb, variant: Variant) -> Frame {
    let layout = variant.layout();
    let mut payload = Vec::with_capacity(4);
    payload.extend(layout.color_tag);
    payload.extend_from_slice(&[rgb.r, rgb.g, rgb.b]);
    Frame(layout.build(layout.opcodes.color, &payload))
}

pub fn encode_brightness(percent_value: i32, variant: Variant) -> Result<Frame, ValidationError> {
    let layout = variant.layout();
    let level = rescale_percent(percent("brightness", percent_value)?, layout.brightness_max);
    let payload = vec![level; layout.brightness_repeat];
    Ok(Frame(layout.build(layout.opcodes.brightness, &payload)))
}

pub fn encode_mode(mode: Mode, variant: Variant) -> Option<Frame> {
    mode.pattern_code(variant)
        .map(|code| encode_pattern_code(code, variant))
}

/// Mode frame for an arbitrary pattern code, bypassing the mode table.
pub fn encode_pattern_code(code: u8, variant: Variant) -> Frame {
    let layout = variant.layout();
    Frame(layout.build(layout.opcodes.mode, &[code]))
}

pub fn encode_speed(percent_value: i32, variant: Variant) -> Result<Frame, ValidationError> {
    let layout = variant.layout();
    let level = rescale_percent(percent("speed", percent_value)?, layout.speed_max);
    Ok(Frame(layout.build(layout.opcodes.speed, &[level])))
}

pub fn encode_power(on: bool, variant: Variant) -> Frame {
    let layout = variant.layout();
    let (opcode, payload) = if on {
        (layout.opcodes.power_on, layout.power_on_payload)
    } else {
        (layout.opcodes.power_off, layout.power_off_payload)
    };
    Frame(layout.build(opcode, payload))
}

/// Frames a variant needs before it accepts normal commands.
pub fn handshake_frames(variant: Variant) -> Vec<Frame> {
    if variant.layout().handshake {
        vec![encode_power(true, variant)]
    } else {
        Vec::new()
    }
}
