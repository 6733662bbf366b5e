//! Policy deciding when a miss should trigger a pack-directory rescan.
//!
//! A long-running reader can race a concurrent `git gc`: packs appear,
//! vanish, or get replaced while this process only has the listing from its
//! last scan. [`FreshnessCoordinator`] tracks a [`FileSnapshot`] of the pack
//! directory and decides, on a miss, whether it's worth re-listing before
//! reporting "not found".

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use git_utils::file_snapshot::FileSnapshot;

/// `core.trustFolderStat` — when false, every miss forces a rescan instead of
/// trusting the pack directory's snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessConfig {
    pub trust_folder_stat: bool,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self { trust_folder_stat: true }
    }
}

struct State {
    pack_dir_snapshot: FileSnapshot,
}

/// Coordinates pack-directory rescans for one `ObjectDirectory`.
pub struct FreshnessCoordinator {
    pack_dir: PathBuf,
    config: FreshnessConfig,
    state: Mutex<State>,
}

impl FreshnessCoordinator {
    pub fn new(pack_dir: impl AsRef<Path>, config: FreshnessConfig) -> Self {
        let pack_dir = pack_dir.as_ref().to_path_buf();
        let snapshot = FileSnapshot::save(&pack_dir);
        Self {
            pack_dir,
            config,
            state: Mutex::new(State {
                pack_dir_snapshot: snapshot,
            }),
        }
    }

    /// Called before a miss is reported to the caller. Returns true if the
    /// caller should rescan the pack directory and retry the lookup once.
    ///
    /// `core.trustFolderStat = false` always returns true. Otherwise this
    /// re-stats the pack directory and returns true if it looks modified,
    /// including the racy-clean case (still inside the FS timer's
    /// resolution window since the last observation).
    pub fn should_rescan_before_miss(&self) -> bool {
        if !self.config.trust_folder_stat {
            return true;
        }
        let mut state = self.state.lock().unwrap();
        state.pack_dir_snapshot.is_modified(&self.pack_dir) || state.pack_dir_snapshot.is_racily_clean()
    }

    /// Record that a rescan just happened, resetting the directory snapshot
    /// to the post-rescan state.
    pub fn note_rescanned(&self) {
        let mut state = self.state.lock().unwrap();
        state.pack_dir_snapshot = FileSnapshot::save(&self.pack_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn trust_folder_stat_false_always_rescans() {
        let dir = tempfile::tempdir().unwrap();
        let coord = FreshnessCoordinator::new(
            dir.path(),
            FreshnessConfig { trust_folder_stat: false },
        );
        assert!(coord.should_rescan_before_miss());
        assert!(coord.should_rescan_before_miss());
    }

    #[test]
    fn unchanged_directory_after_settling_does_not_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let coord = FreshnessCoordinator::new(dir.path(), FreshnessConfig::default());
        // Let the racy-clean window pass before asserting steady state.
        std::thread::sleep(Duration::from_millis(1300));
        assert!(!coord.should_rescan_before_miss());
    }

    #[test]
    fn new_pack_file_triggers_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let coord = FreshnessCoordinator::new(dir.path(), FreshnessConfig::default());
        std::thread::sleep(Duration::from_millis(1300));
        assert!(!coord.should_rescan_before_miss());

        std::fs::write(dir.path().join("pack-new.pack"), b"x").unwrap();
        assert!(coord.should_rescan_before_miss());

        coord.note_rescanned();
        std::thread::sleep(Duration::from_millis(1300));
        assert!(!coord.should_rescan_before_miss());
    }
}
