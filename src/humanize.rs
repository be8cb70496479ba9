pub const ETA_PLACEHOLDER: &str = "ETA --:--";

const RATE_UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
const SIZE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

fn scale(value: f64, units: &[&str]) -> String {
    let mut x = value;
    let mut i = 0;
    while x >= 1024.0 && i < units.len() - 1 {
        x /= 1024.0;
        i += 1;
    }
    if i == 0 {
        format!("{:.0} {}", x, units[i])
    } else {
        format!("{:.1} {}", x, units[i])
    }
}

/// Formats a byte/s rate, e.g. `1.5 MB/s`. Caps at GB/s.
pub fn human_rate(bytes_per_sec: f64) -> String {
    scale(bytes_per_sec, &RATE_UNITS)
}

/// Formats a byte count, e.g. `700.0 MB`. Caps at TB.
pub fn human_size(bytes: u64) -> String {
    scale(bytes as f64, &SIZE_UNITS)
}

/// Renders `ETA 1h 1m 1s` / `ETA 1m 30s`, or the placeholder when there is
/// nothing sensible to show.
pub fn format_eta(seconds: f64) -> String {
    if !(seconds > 0.0) || !seconds.is_finite() {
        return ETA_PLACEHOLDER.to_string();
    }
    // Round half up.
    let mut s = (seconds + 0.5).floor() as u64;
    let h = s / 3600;
    s %= 3600;
    let m = s / 60;
    s %= 60;
    if h > 0 {
        format!("ETA {}h {}m {}s", h, m, s)
    } else {
        format!("ETA {}m {}s", m, s)
    }
}
