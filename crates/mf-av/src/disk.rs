//! Output size estimation and free-space checks.

use std::path::Path;
use std::time::Duration;

/// Headroom multiplier applied to the estimated output size.
const SPACE_MARGIN: f64 = 1.1;

/// Estimated MP3 size in bytes for `duration` at `bitrate_kbps`.
pub fn estimate_output_bytes(bitrate_kbps: u32, duration: Duration) -> u64 {
    (bitrate_kbps as f64 * 1000.0 * duration.as_secs_f64() / 8.0) as u64
}

/// Bytes that must be free before encoding starts.
pub fn required_bytes(estimated: u64) -> u64 {
    (estimated as f64 * SPACE_MARGIN).ceil() as u64
}

/// Free bytes available to unprivileged users on the filesystem holding
/// `dir`, or `None` if that cannot be determined.
#[cfg(unix)]
pub fn available_bytes(dir: &Path) -> Option<u64> {
    match nix::sys::statvfs::statvfs(dir) {
        Ok(stat) => Some(stat.blocks_available() as u64 * stat.fragment_size() as u64),
        Err(e) => {
            tracing::warn!("Could not check disk space at {}: {e}", dir.display());
            None
        }
    }
}

#[cfg(not(unix))]
pub fn available_bytes(_dir: &Path) -> Option<u64> {
    None
}

/// Whether `dir` has room for `required` bytes. An unknown amount of free
/// space counts as enough.
pub fn has_space_for(dir: &Path, required: u64) -> bool {
    match available_bytes(dir) {
        Some(free) => free >= required,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_matches_bitrate_times_duration() {
        // 320 kbps for 60 s = 2.4 MB
        assert_eq!(estimate_output_bytes(320, Duration::from_secs(60)), 2_400_000);
    }

    #[test]
    fn required_adds_ten_percent() {
        assert_eq!(required_bytes(1_000_000), 1_100_000);
        assert_eq!(required_bytes(0), 0);
    }

    #[test]
    fn temp_dir_has_room_for_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(has_space_for(dir.path(), 0));
    }

    #[cfg(unix)]
    #[test]
    fn impossible_requirement_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_space_for(dir.path(), u64::MAX));
    }
}
