//! Byte size units

/// One kibibyte
pub const KB: u64 = 1024;

/// One mebibyte
pub const MB: u64 = 1024 * KB;

/// Human-readable byte count, e.g. `1.5 KB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let size = bytes as f64;
    let base = 1024.0_f64;
    let i = (size.ln() / base.ln()).floor() as usize;
    let i = i.min(UNITS.len() - 1);

    let value = size / base.powi(i as i32);
    format!("{:.1} {}", value, UNITS[i])
}
