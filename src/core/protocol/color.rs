//! RGB color value and hex conversions

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::ValidationError;

static HEX_COLOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#?([0-9A-Fa-f]{2})([0-9A-Fa-f]{2})([0-9A-Fa-f]{2})$")
        .expect("hex color pattern is valid")
});

/// A validated RGB triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Builds a color from unchecked integers, rejecting anything outside 0..=255.
    pub fn checked(r: i32, g: i32, b: i32) -> Result<Self, ValidationError> {
        Ok(Self {
            r: channel("r", r)?,
            g: channel("g", g)?,
            b: channel("b", b)?,
        })
    }
}

fn channel(field: &'static str, value: i32) -> Result<u8, ValidationError> {
    u8::try_from(value).map_err(|_| ValidationError::OutOfRange {
        field,
        value: i64::from(value),
        min: 0,
        max: 255,
    })
}

/// Parses `#rrggbb` (the `#` is optional, case-insensitive).
pub fn hex_to_rgb(hex: &str) -> Result<Rgb, ValidationError> {
    let captures = HEX_COLOR
        .captures(hex.trim())
        .ok_or_else(|| ValidationError::MalformedHex(hex.to_string()))?;

    let component = |i: usize| {
        u8::from_str_radix(&captures[i], 16)
            .map_err(|_| ValidationError::MalformedHex(hex.to_string()))
    };
    Ok(Rgb::new(component(1)?, component(2)?, component(3)?))
}

/// Formats as lowercase `#rrggbb`.
pub fn rgb_to_hex(color: Rgb) -> String {
    format!("#{:02x}{:02x}{:02x}", color.r, color.g, color.b)
}

impl FromStr for Rgb {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        hex_to_rgb(s)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&rgb_to_hex(*self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_with_and_without_hash() {
        assert_eq!(hex_to_rgb("#FF8000"), Ok(Rgb::new(255, 128, 0)));
        assert_eq!(hex_to_rgb("00ff7f"), Ok(Rgb::new(0, 255, 127)));
    }

    #[test]
    fn rejects_malformed_hex() {
        for bad in ["not-a-color", "#fff", "#12345", "#1234567", "#gg0000", ""] {
            assert!(
                matches!(hex_to_rgb(bad), Err(ValidationError::MalformedHex(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn checked_rejects_out_of_range_channels() {
        assert!(Rgb::checked(256, 0, 0).is_err());
        assert!(Rgb::checked(0, -1, 0).is_err());
        assert_eq!(Rgb::checked(255, 0, 10), Ok(Rgb::new(255, 0, 10)));
    }

    proptest! {
        #[test]
        fn hex_round_trip(r in any::<u8>(), g in any::<u8>(), b in any::<u8>()) {
            let color = Rgb::new(r, g, b);
            prop_assert_eq!(hex_to_rgb(&rgb_to_hex(color)), Ok(color));
        }
    }
}
