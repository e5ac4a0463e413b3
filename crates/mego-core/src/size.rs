//! Byte size units.

/// One kilobyte (1024 bytes).
pub const KB: u64 = 1024;
/// One megabyte.
pub const MB: u64 = 1024 * KB;
/// One gigabyte.
pub const GB: u64 = 1024 * MB;
/// One terabyte.
pub const TB: u64 = 1024 * GB;

/// Formats a byte count with the largest unit that keeps the value >= 1.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [(u64, &str); 4] = [(TB, "TB"), (GB, "GB"), (MB, "MB"), (KB, "KB")];

    for (unit, suffix) in UNITS {
        if bytes >= unit {
            let whole = bytes / unit;
            let tenths = (bytes % unit) * 10 / unit;
            return if tenths == 0 {
                format!("{whole} {suffix}")
            } else {
                format!("{whole}.{tenths} {suffix}")
            };
        }
    }
    format!("{bytes} B")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_scale_by_1024() {
        assert_eq!(KB, 1024);
        assert_eq!(MB, 1024 * 1024);
        assert_eq!(GB / MB, 1024);
    }

    #[test]
    fn human_bytes_picks_unit() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2 * KB), "2 KB");
        assert_eq!(human_bytes(MB + MB / 2), "1.5 MB");
        assert_eq!(human_bytes(3 * GB), "3 GB");
    }
}
