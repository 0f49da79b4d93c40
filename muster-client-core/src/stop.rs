use std::path::PathBuf;

use crate::defaults;

/// Stop requests arrive as a flag file at a well-known path and are honored
/// at item boundaries: between manifests, between catalog items, and between
/// installer items.
pub fn stop_requested() -> bool {
    stop_requested_at(&defaults::stop_request_path())
}

pub(crate) fn stop_requested_at(path: &PathBuf) -> bool {
    if path.exists() {
        log::info!("Stop requested");
        true
    } else {
        false
    }
}

pub fn clear_stop_request() {
    let _ = std::fs::remove_file(defaults::stop_request_path());
}

/// Creates the flag; the running engine notices at its next boundary.
pub fn request_stop() -> std::io::Result<()> {
    std::fs::write(defaults::stop_request_path(), b"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_file_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let flag = tmp.path().join("stop_requested");
        assert!(!stop_requested_at(&flag));
        std::fs::write(&flag, b"").unwrap();
        assert!(stop_requested_at(&flag));
    }
}
