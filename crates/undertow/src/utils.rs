//! Small formatting helpers for log output.

/// Format a byte count with binary units, as download sizes are usually
/// reported.
pub fn to_human_readable(n: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    const STEP: f64 = 1024.0;

    if n < 1024 {
        return format!("{n} B");
    }

    let mut n = n as f64;
    let mut u = 0;
    while n >= STEP && u < UNITS.len() - 1 {
        n /= STEP;
        u += 1;
    }

    format!("{:.2} {}", n, UNITS[u])
}
