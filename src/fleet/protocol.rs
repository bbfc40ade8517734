//! Binary control protocol for the LED peripherals.
//!
//! Frames are 9 bytes, `7e .. ef` delimited, written unacknowledged to the
//! control characteristic. The firmware has no distinct off-frame: off is
//! color (0, 0, 0).

/// Power-on frame: `7e 07 04 ff 00 01 02 01 ef`.
pub const POWER_ON_FRAME: [u8; 9] = [0x7e, 0x07, 0x04, 0xff, 0x00, 0x01, 0x02, 0x01, 0xef];

/// Set-color frame: `7e 07 05 03 RR GG BB 10 ef`.
pub fn color_frame(r: u8, g: u8, b: u8) -> [u8; 9] {
    [0x7e, 0x07, 0x05, 0x03, r, g, b, 0x10, 0xef]
}

/// Lowercase hex rendering of a frame, as it appears in peripheral logs.
pub fn frame_hex(frame: &[u8]) -> String {
    frame.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_on_frame_is_bit_exact() {
        assert_eq!(frame_hex(&POWER_ON_FRAME), "7e0704ff00010201ef");
    }

    #[test]
    fn color_frame_embeds_channels_in_order() {
        assert_eq!(
            color_frame(0x12, 0x34, 0x56),
            [0x7e, 0x07, 0x05, 0x03, 0x12, 0x34, 0x56, 0x10, 0xef]
        );
        assert_eq!(frame_hex(&color_frame(255, 0, 16)), "7e070503ff001010ef");
    }

    #[test]
    fn off_is_black_color_frame() {
        assert_eq!(frame_hex(&color_frame(0, 0, 0)), "7e07050300000010ef");
    }
}
