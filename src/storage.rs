// SPDX-License-Identifier: MIT OR Apache-2.0

//! On-disk layout for downloaded snapshots: one directory per camera,
//! filenames derived from the wall clock at download completion.

use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use chrono::{DateTime, Local};

/// Timestamp format used in snapshot filenames. Lexicographic order equals
/// chronological order, which is what `mp4` range selection relies on.
pub const TIMESTAMP_FORMAT: &str = "%Y_%m_%d_%H_%M_%S";

/// Returns the directory for `camera`'s snapshots, creating it if absent.
/// Repeated calls for the same camera are no-ops after the first.
pub async fn camera_dir(base: &Path, camera: &str) -> Result<PathBuf, Error> {
    let dir = base.join(camera);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("unable to create camera directory {}", dir.display()))?;
    Ok(dir)
}

/// Filename for a snapshot completed at `when`, with one-second resolution.
///
/// Two snapshots of the *same* camera completing within the same second map
/// to the same name, and the later write wins; completions more than one
/// second apart never collide.
pub fn snapshot_name(when: DateTime<Local>) -> String {
    format!("{}.jpg", when.format(TIMESTAMP_FORMAT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn snapshot_names_are_zero_padded_and_sortable() {
        let early = snapshot_name(at(2024, 1, 2, 3, 4, 5));
        assert_eq!(early, "2024_01_02_03_04_05.jpg");
        let late = snapshot_name(at(2024, 1, 2, 3, 4, 6));
        let much_later = snapshot_name(at(2024, 11, 30, 23, 59, 59));
        assert!(early < late);
        assert!(late < much_later);
    }

    #[test]
    fn same_second_completions_collide_within_one_camera() {
        // Documented behavior, not a bug: one-second filename resolution
        // means the later write wins.
        let a = snapshot_name(at(2024, 5, 5, 12, 0, 0));
        let b = snapshot_name(at(2024, 5, 5, 12, 0, 0));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn camera_dir_creation_is_idempotent() {
        let base = tempfile::tempdir().unwrap();
        let first = camera_dir(base.path(), "north gate").await.unwrap();
        let second = camera_dir(base.path(), "north gate").await.unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
        assert_eq!(first, base.path().join("north gate"));
    }

    #[tokio::test]
    async fn same_second_completions_for_different_cameras_never_collide() {
        let base = tempfile::tempdir().unwrap();
        let now = at(2024, 5, 5, 12, 0, 0);
        let a = camera_dir(base.path(), "cam-a").await.unwrap().join(snapshot_name(now));
        let b = camera_dir(base.path(), "cam-b").await.unwrap().join(snapshot_name(now));
        assert_ne!(a, b);
    }
}
