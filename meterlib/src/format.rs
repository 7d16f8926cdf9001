use std::{
    fmt,
    time::Duration,
};

/// Byte count formatted with binary prefixes (eg. `3.14 MiB`).
#[derive(Clone, Copy, Debug)]
pub struct BinarySize(pub u64);

const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];

impl fmt::Display for BinarySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut value = self.0 as f64;
        let mut unit = 0;

        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }

        if unit == 0 {
            write!(f, "{} {}", self.0, UNITS[unit])
        } else {
            write!(f, "{:.2} {}", value, UNITS[unit])
        }
    }
}

/// Duration formatted as `H:MM:SS`.
#[derive(Clone, Copy, Debug)]
pub struct ClockDuration(pub Duration);

impl fmt::Display for ClockDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.0.as_secs();
        write!(f, "{}:{:02}:{:02}", total / 3600, total / 60 % 60, total % 60)
    }
}
