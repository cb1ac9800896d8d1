//! Hex helpers for frame logging

use std::fmt::Write;

/// Space-separated uppercase hex, as printed in TX/RX frame logs
/// Example: [0x01, 0x03, 0x00] -> "01 03 00"
pub fn format_frame(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}
