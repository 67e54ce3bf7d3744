//! # Color/Channel Codec
//!
//! Pure conversions between the packed hex color strings Tasmota light
//! modules report (`rrggbb`, `rrggbbww`, `rrggbbcwww`) and the individual
//! channels the state tree exposes.
//!
//! Nothing in here touches the store or the transport. All functions clamp
//! their inputs instead of failing.

/// Role of a packed color entry, derived from the digit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorRole {
    /// 6 digits: red, green, blue
    Rgb,
    /// 8 digits: rgb + one white channel
    Rgbww,
    /// 10 digits: rgb + cold white + warm white
    Rgbcwww,
}

impl ColorRole {
    /// Infers the role from the length of a packed color (without `#`).
    ///
    /// Anything that is not 8 or 10 digits long is treated as plain rgb.
    pub fn from_len(len: usize) -> Self {
        match len {
            10 => ColorRole::Rgbcwww,
            8 => ColorRole::Rgbww,
            _ => ColorRole::Rgb,
        }
    }

    /// Parses the role name stored on the Color object.
    pub fn from_role_name(role: &str) -> Self {
        match role {
            "level.color.rgbww" => ColorRole::Rgbww,
            "level.color.rgbcwww" => ColorRole::Rgbcwww,
            _ => ColorRole::Rgb,
        }
    }

    pub fn role_name(&self) -> &'static str {
        match self {
            ColorRole::Rgb => "level.color.rgb",
            ColorRole::Rgbww => "level.color.rgbww",
            ColorRole::Rgbcwww => "level.color.rgbcwww",
        }
    }

    /// Digit offset of the warm white channel.
    pub fn ww_offset(&self) -> usize {
        match self {
            ColorRole::Rgbww => 6,
            _ => 8,
        }
    }

    /// Digit offset of the cold white channel.
    pub fn cw_offset(&self) -> usize {
        6
    }

    /// Number of white digits following the rgb triplet.
    pub fn white_digits(&self) -> usize {
        match self {
            ColorRole::Rgb => 0,
            ColorRole::Rgbww => 2,
            ColorRole::Rgbcwww => 4,
        }
    }

    pub fn has_ww(&self) -> bool {
        !matches!(self, ColorRole::Rgb)
    }

    pub fn has_cw(&self) -> bool {
        matches!(self, ColorRole::Rgbcwww)
    }
}

/// Converts HSV to RGB.
///
/// `h` runs from 0 to 360 degrees, `s` and `v` from 0 to 100. Out of range
/// inputs are clamped. `h == 360` lands in sector 6 which is handled like
/// sector 5.
pub fn hsv_to_rgb(h: f64, s: f64, v: f64) -> (u8, u8, u8) {
    let h = h.clamp(0.0, 360.0);
    let s = s.clamp(0.0, 100.0) / 100.0;
    let v = v.clamp(0.0, 100.0) / 100.0;

    if s == 0.0 {
        let gray = to_channel(v);
        return (gray, gray, gray);
    }

    let h = h / 60.0;
    let sector = h.floor();
    let f = h - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));

    let (r, g, b) = match sector as u8 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };

    (to_channel(r), to_channel(g), to_channel(b))
}

fn to_channel(fraction: f64) -> u8 {
    (fraction * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Two lowercase hex digits, zero padded.
pub fn byte_to_hex(byte: u8) -> String {
    format!("{:02x}", byte)
}

/// Lowercase hex of `n` padded to `width` digits.
///
/// With `width == 2` the value is clamped to a byte first.
pub fn clamp_and_pad(n: i64, width: usize) -> String {
    let n = if width == 2 { n.clamp(0, 255) } else { n.max(0) };
    format!("{:0width$x}", n, width = width)
}

/// Replaces the digits `[offset, offset + width)` of a packed color.
///
/// A color shorter than `offset` is padded with `0` first so the channel is
/// appended. `digits` is truncated or zero padded to exactly `width`.
pub fn replace_channel(color: &str, offset: usize, width: usize, digits: &str) -> String {
    let mut chars: Vec<char> = color.chars().collect();
    while chars.len() < offset {
        chars.push('0');
    }

    let mut replacement: Vec<char> = digits.chars().take(width).collect();
    while replacement.len() < width {
        replacement.insert(0, '0');
    }

    let end = (offset + width).min(chars.len());
    chars.splice(offset..end, replacement);
    chars.into_iter().collect()
}

/// Reads the byte stored at `offset` of a packed color. Missing or invalid
/// digits read as zero.
pub fn channel_byte(color: &str, offset: usize) -> u8 {
    color
        .get(offset..offset + 2)
        .and_then(|digits| u8::from_str_radix(digits, 16).ok())
        .unwrap_or(0)
}

/// 0..=100 percent to a channel byte, `floor(255 * v / 100)`.
pub fn percent_to_byte(percent: f64) -> u8 {
    (255.0 * percent.clamp(0.0, 100.0) / 100.0).floor() as u8
}

/// Channel byte to 0..=100 percent.
pub fn byte_to_percent(byte: u8) -> f64 {
    100.0 * byte as f64 / 255.0
}

/// Strips the `#` delimiter and lower-cases a packed color.
pub fn strip_delimiter(value: &str) -> String {
    value.trim_start_matches('#').to_ascii_lowercase()
}

/// Packs an rgb triplet as six lowercase digits.
pub fn rgb_to_hex((r, g, b): (u8, u8, u8)) -> String {
    format!("{}{}{}", byte_to_hex(r), byte_to_hex(g), byte_to_hex(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hsv_primary_boundaries() {
        assert_eq!(hsv_to_rgb(0.0, 0.0, 100.0), (255, 255, 255));
        assert_eq!(hsv_to_rgb(0.0, 100.0, 100.0), (255, 0, 0));
        assert_eq!(hsv_to_rgb(120.0, 100.0, 100.0), (0, 255, 0));
        assert_eq!(hsv_to_rgb(240.0, 100.0, 100.0), (0, 0, 255));
    }

    #[test]
    fn hsv_sector_six_behaves_like_sector_five() {
        // h = 360 -> sector 6, f = 0 -> (v, p, q) with q = v
        assert_eq!(hsv_to_rgb(360.0, 100.0, 100.0), (255, 0, 255));
        assert_eq!(hsv_to_rgb(720.0, 100.0, 100.0), (255, 0, 255));
    }

    #[test]
    fn hsv_clamps_inputs() {
        assert_eq!(hsv_to_rgb(-20.0, 0.0, 250.0), (255, 255, 255));
        assert_eq!(hsv_to_rgb(0.0, 0.0, 50.0), (128, 128, 128));
        assert_eq!(hsv_to_rgb(0.0, 0.0, -5.0), (0, 0, 0));
    }

    #[test]
    fn hsv_channels_stay_in_range() {
        let mut h = 0.0;
        while h <= 360.0 {
            for s in [0.0, 12.5, 50.0, 99.0, 100.0] {
                for v in [0.0, 1.0, 33.3, 100.0] {
                    // u8 already bounds the range; make sure nothing panics and
                    // the value channel never exceeds v scaled
                    let (r, g, b) = hsv_to_rgb(h, s, v);
                    let max = to_channel(v / 100.0);
                    assert!(r <= max && g <= max && b <= max, "h={h} s={s} v={v}");
                }
            }
            h += 7.5;
        }
    }

    #[test]
    fn hex_helpers() {
        assert_eq!(byte_to_hex(0), "00");
        assert_eq!(byte_to_hex(10), "0a");
        assert_eq!(byte_to_hex(255), "ff");
        assert_eq!(clamp_and_pad(300, 2), "ff");
        assert_eq!(clamp_and_pad(-3, 2), "00");
        assert_eq!(clamp_and_pad(255, 4), "00ff");
        assert_eq!(rgb_to_hex((255, 0, 16)), "ff0010");
    }

    #[test]
    fn replace_channel_only_touches_its_digits() {
        let color = "a1b2c3";
        for offset in [0, 2, 4] {
            let out = replace_channel(color, offset, 2, "ff");
            assert_eq!(out.len(), 6);
            for (i, (before, after)) in color.chars().zip(out.chars()).enumerate() {
                if i >= offset && i < offset + 2 {
                    assert_eq!(after, 'f');
                } else {
                    assert_eq!(before, after, "digit {i} changed for offset {offset}");
                }
            }
        }
        assert_eq!(replace_channel("a1b2c3", 1, 3, "000"), "a000c3");
    }

    #[test]
    fn replace_channel_appends_white() {
        assert_eq!(replace_channel("ff0000", 6, 2, "80"), "ff000080");
        assert_eq!(replace_channel("ff00", 6, 2, "80"), "ff000080");
        assert_eq!(replace_channel("ff0000aabb", 8, 2, "00"), "ff0000aa00");
    }

    #[test]
    fn role_inference_and_offsets() {
        assert_eq!(ColorRole::from_len(6), ColorRole::Rgb);
        assert_eq!(ColorRole::from_len(8), ColorRole::Rgbww);
        assert_eq!(ColorRole::from_len(10), ColorRole::Rgbcwww);
        assert_eq!(ColorRole::Rgbww.ww_offset(), 6);
        assert_eq!(ColorRole::Rgbcwww.ww_offset(), 8);
        assert_eq!(
            ColorRole::from_role_name(ColorRole::Rgbcwww.role_name()),
            ColorRole::Rgbcwww
        );
    }

    #[test]
    fn percent_scaling() {
        assert_eq!(percent_to_byte(100.0), 255);
        assert_eq!(percent_to_byte(150.0), 255);
        assert_eq!(percent_to_byte(50.0), 127);
        assert_eq!(channel_byte("00ff80", 2), 255);
        assert_eq!(channel_byte("00ff80", 6), 0);
        assert!((byte_to_percent(255) - 100.0).abs() < f64::EPSILON);
    }
}
