//! File writer (§4.C).
//!
//! Publishes one encoded frame atomically into a peer's inbox. The file is
//! written out-of-band with an `.ispeed` suffix, then renamed to `.ospeed`
//! so a watcher filtering on that suffix never observes a partially written
//! file. The writer never advances a sequence number — the caller does,
//! only after a successful write.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::error::SpeedError;
use crate::frame::Frame;

/// Write `frame` into `bus_dir/<receiver>/`, returning the final `.ospeed` path.
///
/// Creates the receiver's inbox directory on demand. On any I/O failure,
/// returns [`SpeedError::WriteFailed`] and leaves no `.ospeed` file behind
/// (a partially written `.ispeed` file may remain, which is harmless: the
/// watcher never looks at that suffix).
pub fn write_frame(bus_dir: &Path, receiver: &str, frame: &Frame) -> Result<PathBuf, SpeedError> {
    let inbox = bus_dir.join(receiver);
    fs::create_dir_all(&inbox).map_err(|source| SpeedError::WriteFailed {
        path: inbox.clone(),
        source,
    })?;

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let uuid = Uuid::new_v4();
    let filename = format!(
        "{}_{}_{}_{}.ospeed",
        timestamp, receiver, frame.seq_num, uuid
    );
    let final_path = inbox.join(&filename);
    let staging_path = inbox.join(format!("{filename}.ispeed"));

    write_staging(&staging_path, frame).map_err(|source| SpeedError::WriteFailed {
        path: staging_path.clone(),
        source,
    })?;

    fs::rename(&staging_path, &final_path).map_err(|source| SpeedError::WriteFailed {
        path: final_path.clone(),
        source,
    })?;

    Ok(final_path)
}

fn write_staging(staging_path: &Path, frame: &Frame) -> std::io::Result<()> {
    let mut file = fs::File::create(staging_path)?;
    file.write_all(&frame.encode())?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{new_frame, MessageType};
    use tempfile::tempdir;

    fn sample_frame(seq: u64) -> Frame {
        new_frame(
            MessageType::Msg,
            42,
            100,
            seq,
            b"sender-ct".to_vec(),
            b"receiver-ct".to_vec(),
            [1u8; 24],
            b"payload-ct".to_vec(),
        )
    }

    #[test]
    fn test_write_frame_creates_inbox_and_ospeed_file() {
        let dir = tempdir().unwrap();
        let path = write_frame(dir.path(), "bob", &sample_frame(3)).unwrap();

        assert!(path.exists());
        assert!(path.to_string_lossy().ends_with(".ospeed"));
        assert!(dir.path().join("bob").is_dir());
    }

    #[test]
    fn test_filename_matches_grammar() {
        let dir = tempdir().unwrap();
        let path = write_frame(dir.path(), "bob", &sample_frame(9)).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();

        let re_parts: Vec<&str> = name.trim_end_matches(".ospeed").split('_').collect();
        assert_eq!(re_parts.len(), 4);
        assert!(re_parts[0].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(re_parts[1], "bob");
        assert_eq!(re_parts[2], "9");
    }

    #[test]
    fn test_no_staging_file_left_behind_on_success() {
        let dir = tempdir().unwrap();
        write_frame(dir.path(), "bob", &sample_frame(1)).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path().join("bob"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".ispeed"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_written_bytes_decode_back_to_original_frame() {
        let dir = tempdir().unwrap();
        let frame = sample_frame(5);
        let path = write_frame(dir.path(), "bob", &frame).unwrap();

        let bytes = fs::read(&path).unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded.seq_num, frame.seq_num);
        assert_eq!(decoded.sender, frame.sender);
    }
}
