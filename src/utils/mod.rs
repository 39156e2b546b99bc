pub mod sensitive;
pub mod url;

/// Seconds since the Unix epoch, as used in step metadata
pub fn now_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
