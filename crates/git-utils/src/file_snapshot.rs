//! Detects whether a file on disk has changed since it was last observed,
//! resisting "racy clean" filesystem timestamps.
//!
//! A directory listing or `stat` call only has as much resolution as the
//! filesystem's mtime clock (commonly 1 second on older filesystems). A file
//! rewritten within the same tick as a previous observation can appear
//! unchanged even though its content differs. [`FileSnapshot`] tracks a
//! racy window after every observation with a matching timestamp and forces
//! one extra re-check rather than trusting the timestamp blindly.

use std::path::Path;
use std::time::{Duration, SystemTime};

/// Sentinel for a size that was not observed.
pub const UNKNOWN_SIZE: i64 = -1;

/// Default assumed filesystem mtime resolution when none is configured.
/// Matches common ext4/APFS/NTFS granularity.
pub const DEFAULT_FS_TIMER_RESOLUTION: Duration = Duration::from_secs(1);

/// Opaque on-disk file identity (inode + device on POSIX). `None` when the
/// platform exposes no stable identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileKey {
    dev: u64,
    ino: u64,
}

impl FileKey {
    /// Sentinel meaning "no file key available" (acts as a wildcard in comparisons).
    pub const MISSING: Option<FileKey> = None;
}

/// A point-in-time observation of a file's identity and size, used to detect
/// later modification without re-reading the file's content.
#[derive(Debug, Clone, Copy)]
pub struct FileSnapshot {
    last_modified: Option<SystemTime>,
    observed_size: i64,
    file_key: Option<FileKey>,
    last_read: SystemTime,
    fs_timer_resolution: Duration,
    /// Latched once a non-racy observation has confirmed the timestamp is stable.
    cannot_be_racily_clean: bool,
}

impl FileSnapshot {
    /// Take a snapshot of `path` right now. Stat errors fall back to a
    /// "missing" snapshot (no modification time, unknown size, no file key)
    /// rather than failing — this function is total.
    pub fn save(path: impl AsRef<Path>) -> Self {
        Self::save_with_resolution(path, DEFAULT_FS_TIMER_RESOLUTION)
    }

    /// Like [`save`](Self::save) with an explicit filesystem timer resolution.
    pub fn save_with_resolution(path: impl AsRef<Path>, fs_timer_resolution: Duration) -> Self {
        let now = SystemTime::now();
        match std::fs::metadata(path.as_ref()) {
            Ok(meta) => Self {
                last_modified: meta.modified().ok(),
                observed_size: meta.len() as i64,
                file_key: file_key_of(&meta),
                last_read: now,
                fs_timer_resolution,
                cannot_be_racily_clean: false,
            },
            Err(_) => Self {
                last_modified: None,
                observed_size: UNKNOWN_SIZE,
                file_key: None,
                last_read: now,
                fs_timer_resolution,
                cannot_be_racily_clean: false,
            },
        }
    }

    /// Re-stat `path` and decide whether it has changed since this snapshot
    /// was taken. May latch internal state to suppress a future racy-clean
    /// re-check, so this method takes `&mut self`.
    pub fn is_modified(&mut self, path: impl AsRef<Path>) -> bool {
        let now = SystemTime::now();
        let (modified, size, key) = match std::fs::metadata(path.as_ref()) {
            Ok(meta) => (meta.modified().ok(), meta.len() as i64, file_key_of(&meta)),
            Err(_) => (None, UNKNOWN_SIZE, None),
        };

        if sizes_differ(self.observed_size, size) {
            return true;
        }
        if keys_differ(self.file_key, key) {
            return true;
        }
        if modified != self.last_modified {
            return true;
        }

        self.last_read = now;

        // Timestamps match. Decide whether the match could be a racy-clean false
        // negative: the file could have been rewritten within the same tick as
        // our last observation.
        if self.cannot_be_racily_clean {
            return false;
        }

        let racy_window = self.fs_timer_resolution.mul_f64(1.1);
        let elapsed_since_modified = match self.last_modified {
            Some(mtime) => now.duration_since(mtime).unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        };

        if elapsed_since_modified <= racy_window {
            // Still inside the racy window: force a re-check on the next call
            // without latching, but report "modified" now so callers rescan.
            return true;
        }

        self.cannot_be_racily_clean = true;
        false
    }

    /// Reset this snapshot to mark `other` as the now-current clean state,
    /// without re-stating the filesystem.
    pub fn set_clean(&mut self, other: &FileSnapshot) {
        *self = *other;
    }

    /// Value equality: same size, same last-modified time, same file key.
    /// `UNKNOWN_SIZE` acts as a wildcard (compares equal to anything).
    pub fn equals(&self, other: &FileSnapshot) -> bool {
        !sizes_differ(self.observed_size, other.observed_size)
            && !keys_differ(self.file_key, other.file_key)
            && self.last_modified == other.last_modified
    }

    /// True while this snapshot is still inside its racy-clean window:
    /// `last_read - last_modified < 1.1 * fs_timer_resolution`.
    pub fn is_racily_clean(&self) -> bool {
        if self.cannot_be_racily_clean {
            return false;
        }
        let Some(mtime) = self.last_modified else {
            return false;
        };
        let racy_window = self.fs_timer_resolution.mul_f64(1.1);
        self.last_read
            .duration_since(mtime)
            .unwrap_or(Duration::ZERO)
            <= racy_window
    }

    /// Block (with a fixed ceiling) until this snapshot is outside its racy
    /// window. This is the only place in the core that sleeps; it exists so
    /// a writer can be certain a subsequent reader's `is_modified` won't be
    /// fooled by coarse mtime resolution.
    pub fn wait_until_not_racy(&self) {
        if !self.is_racily_clean() {
            return;
        }
        // 10% safety margin beyond the nominal resolution, same guard used
        // when evaluating the racy window itself.
        std::thread::sleep(self.fs_timer_resolution.mul_f64(1.1));
    }

    /// The size observed at snapshot time, or `UNKNOWN_SIZE`.
    pub fn size(&self) -> i64 {
        self.observed_size
    }

    /// The last-modified time observed at snapshot time, if any.
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }
}

fn sizes_differ(a: i64, b: i64) -> bool {
    a != UNKNOWN_SIZE && b != UNKNOWN_SIZE && a != b
}

fn keys_differ(a: Option<FileKey>, b: Option<FileKey>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a != b,
        _ => false, // missing key on either side acts as a wildcard
    }
}

#[cfg(unix)]
fn file_key_of(meta: &std::fs::Metadata) -> Option<FileKey> {
    use std::os::unix::fs::MetadataExt;
    Some(FileKey {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

#[cfg(not(unix))]
fn file_key_of(_meta: &std::fs::Metadata) -> Option<FileKey> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::thread;

    #[test]
    fn unmodified_file_reports_not_modified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();

        // Use a tiny resolution and sleep past the racy window so the test
        // doesn't depend on real filesystem mtime granularity.
        let mut snap = FileSnapshot::save_with_resolution(&path, Duration::from_millis(1));
        thread::sleep(Duration::from_millis(5));
        assert!(!snap.is_modified(&path));
    }

    #[test]
    fn size_change_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();

        let mut snap = FileSnapshot::save_with_resolution(&path, Duration::from_millis(1));
        thread::sleep(Duration::from_millis(5));

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b" world").unwrap();
        drop(f);

        assert!(snap.is_modified(&path));
    }

    #[test]
    fn racy_window_forces_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();

        // A generous resolution means we're still "racy" immediately after saving.
        let mut snap = FileSnapshot::save_with_resolution(&path, Duration::from_secs(10));
        assert!(snap.is_racily_clean());
        assert!(snap.is_modified(&path));
    }

    #[test]
    fn missing_file_snapshot_is_total() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist");
        let snap = FileSnapshot::save(&path);
        assert_eq!(snap.size(), UNKNOWN_SIZE);
        assert!(snap.last_modified().is_none());
    }

    #[test]
    fn equals_treats_unknown_size_as_wildcard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();

        let a = FileSnapshot::save(&path);
        let mut b = a;
        b.observed_size = UNKNOWN_SIZE;
        assert!(a.equals(&b));
    }
}
