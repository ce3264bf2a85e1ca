// Clip storage: output file naming and scanning the storage folder

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};

/// Timestamp part of clip file names, e.g. "2026-02-21_14-32-45"
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

const TIMESTAMP_LEN: usize = 19;

/// A saved clip found in the storage folder
#[derive(Debug, Clone, PartialEq)]
pub struct ClipInfo {
    pub path: PathBuf,
    /// Kind of save that produced it ("snapshot", "continuous", ...)
    pub prefix: String,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Build `<dir>/<prefix>_<timestamp>.<extension>` for a clip saved at `at`,
/// creating `dir` if needed. A numeric suffix is added when a clip with the
/// same name already exists.
pub fn clip_path_at(dir: &Path, prefix: &str, extension: &str, at: DateTime<Utc>) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let stem = format!("{}_{}", prefix, at.format(TIMESTAMP_FORMAT));
    let mut path = dir.join(format!("{}.{}", stem, extension));
    let mut n = 2;
    while path.exists() {
        path = dir.join(format!("{}_{}.{}", stem, n, extension));
        n += 1;
    }
    Ok(path)
}

/// `clip_path_at()` for the current time
pub fn clip_path(dir: &Path, prefix: &str, extension: &str) -> std::io::Result<PathBuf> {
    clip_path_at(dir, prefix, extension, Utc::now())
}

/// Split a clip file stem into its prefix and timestamp.
/// Accepts the collision suffix added by `clip_path_at()`.
pub fn parse_clip_name(stem: &str) -> Option<(String, DateTime<Utc>)> {
    let without_suffix = stem
        .rsplit_once('_')
        .filter(|(_, n)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) && n.len() < 4)
        .map(|(rest, _)| rest);

    [Some(stem), without_suffix].into_iter().flatten().find_map(|candidate| {
        if candidate.len() < TIMESTAMP_LEN + 2 || !candidate.is_char_boundary(candidate.len() - TIMESTAMP_LEN) {
            return None;
        }
        let (head, timestamp) = candidate.split_at(candidate.len() - TIMESTAMP_LEN);
        let prefix = head.strip_suffix('_')?;
        let parsed = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;
        Some((prefix.to_string(), Utc.from_utc_datetime(&parsed)))
    })
}

/// List saved clips in `dir`, oldest first. Files that do not follow the
/// naming scheme are skipped.
pub fn list_clips(dir: &Path) -> anyhow::Result<Vec<ClipInfo>> {
    let mut clips = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some((prefix, timestamp)) = parse_clip_name(stem) else {
            log::debug!("Skipping {} in clip folder", path.display());
            continue;
        };
        let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        clips.push(ClipInfo {
            path,
            prefix,
            timestamp,
            size_bytes,
        });
    }

    clips.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.path.cmp(&b.path)));
    Ok(clips)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 21, 14, 32, 45).unwrap()
    }

    #[test]
    fn names_clips_by_prefix_and_time() {
        let dir = tempfile::tempdir().unwrap();
        let clips = dir.path().join("clips");
        let path = clip_path_at(&clips, "snapshot", "mp4", at()).unwrap();
        assert_eq!(path, clips.join("snapshot_2026-02-21_14-32-45.mp4"));
        assert!(clips.is_dir());
    }

    #[test]
    fn colliding_names_get_a_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let first = clip_path_at(dir.path(), "event", "mkv", at()).unwrap();
        std::fs::write(&first, b"x").unwrap();
        let second = clip_path_at(dir.path(), "event", "mkv", at()).unwrap();
        assert_eq!(second, dir.path().join("event_2026-02-21_14-32-45_2.mkv"));
    }

    #[test]
    fn parses_names_back() {
        assert_eq!(
            parse_clip_name("snapshot_2026-02-21_14-32-45"),
            Some(("snapshot".to_string(), at()))
        );
        assert_eq!(
            parse_clip_name("my_clip_2026-02-21_14-32-45_3"),
            Some(("my_clip".to_string(), at()))
        );
        assert_eq!(parse_clip_name("2026-02-21_14-32-45"), None);
        assert_eq!(parse_clip_name("notes"), None);
    }

    #[test]
    fn lists_clips_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let later = clip_path_at(dir.path(), "continuous", "mp4", at() + chrono::Duration::seconds(5)).unwrap();
        std::fs::write(&later, b"later").unwrap();
        let earlier = clip_path_at(dir.path(), "snapshot", "mp4", at()).unwrap();
        std::fs::write(&earlier, b"e").unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"ignored").unwrap();

        let clips = list_clips(dir.path()).unwrap();
        assert_eq!(clips.len(), 2);
        assert_eq!(clips[0].path, earlier);
        assert_eq!(clips[0].prefix, "snapshot");
        assert_eq!(clips[1].size_bytes, 5);
    }
}
