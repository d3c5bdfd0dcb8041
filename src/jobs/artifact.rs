//! Artifact naming and cleanup.
//!
//! The downloader writes `<downloads>/<stem>.<ext>` and merges into
//! `<stem>.mp4`. Intermediate fragments share the stem.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use super::registry::JobId;

/// Container the downloader is told to merge into.
pub const ARTIFACT_EXTENSION: &str = "mp4";

/// What the downloader leaves behind for a stem: per-format intermediates
/// (`.f137.mp4`), partial downloads (`.part`, `.ytdl`, `.part-Frag<N>`) and
/// the merger's `.temp.<ext>`. Matched against the name with `<stem>` removed.
static PARTIAL_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?:\.f\d+)?\.[A-Za-z0-9]+(?:\.part|\.ytdl|\.part-Frag\d+)|\.f\d+\.[A-Za-z0-9]+|\.temp\.[A-Za-z0-9]+)$",
    )
    .expect("valid partial suffix regex")
});

/// Replace everything outside `[A-Za-z0-9_.-]` with `_`.
///
/// Falls back to `video_<job id>` when no usable name was supplied.
pub fn sanitize_stem(filename: Option<&str>, id: JobId) -> String {
    match filename.map(str::trim).filter(|f| !f.is_empty()) {
        Some(name) => name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect(),
        None => format!("video_{id}"),
    }
}

/// Whether files written for `a` and `b` could share a name prefix.
///
/// True when the stems are equal or one is the other plus a `.`-separated tail.
pub fn stems_overlap(a: &str, b: &str) -> bool {
    fn extends(longer: &str, shorter: &str) -> bool {
        longer
            .strip_prefix(shorter)
            .is_some_and(|rest| rest.starts_with('.'))
    }
    a == b || extends(a, b) || extends(b, a)
}

/// Stem made unique to one job by appending the head of its id.
pub fn disambiguate_stem(stem: &str, id: JobId) -> String {
    let id = id.to_string();
    format!("{stem}_{}", &id[..8])
}

/// File name of the merged artifact for `stem`.
pub fn artifact_name(stem: &str) -> String {
    format!("{stem}.{ARTIFACT_EXTENSION}")
}

/// Output template passed to the downloader (`-o`).
pub fn output_template(downloads_dir: &Path, stem: &str) -> PathBuf {
    downloads_dir.join(format!("{stem}.%(ext)s"))
}

/// Resolve a requested artifact name inside `downloads_dir`.
///
/// Returns `None` for anything but a single plain file name, so requests can
/// never reach outside the downloads directory.
pub fn resolve(downloads_dir: &Path, name: &str) -> Option<PathBuf> {
    if name.is_empty() || name.contains(['/', '\\']) {
        return None;
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(downloads_dir.join(name)),
        _ => None,
    }
}

/// Create the downloads directory if needed.
pub async fn ensure_dir(downloads_dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(downloads_dir).await
}

/// Remove leftovers of a failed job: partial downloads and per-format fragments.
///
/// Returns the number of files removed.
pub async fn remove_partials(downloads_dir: &Path, stem: &str) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(downloads_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let prefix = format!("{stem}.");
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix(stem) else { continue };
        if !name.starts_with(&prefix) || !is_partial(rest) {
            continue;
        }

        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => {
                debug!(file = %name, "Removed partial artifact");
                removed += 1;
            }
            Err(e) => warn!(file = %name, error = %e, "Failed to remove partial artifact"),
        }
    }
    Ok(removed)
}

fn is_partial(suffix: &str) -> bool {
    PARTIAL_SUFFIX.is_match(suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        let id = JobId::new();
        assert_eq!(sanitize_stem(Some("my video/../x"), id), "my_video_.._x");
        assert_eq!(sanitize_stem(Some("clip-01_final.v2"), id), "clip-01_final.v2");
        assert_eq!(sanitize_stem(Some("café"), id), "caf_");
    }

    #[test]
    fn sanitize_falls_back_to_job_id() {
        let id = JobId::new();
        assert_eq!(sanitize_stem(None, id), format!("video_{id}"));
        assert_eq!(sanitize_stem(Some("   "), id), format!("video_{id}"));
    }

    #[test]
    fn template_and_artifact_name() {
        let dir = Path::new("/srv/downloads");
        assert_eq!(
            output_template(dir, "clip"),
            PathBuf::from("/srv/downloads/clip.%(ext)s")
        );
        assert_eq!(artifact_name("clip"), "clip.mp4");
    }

    #[test]
    fn resolve_rejects_traversal() {
        let dir = Path::new("/srv/downloads");
        assert_eq!(
            resolve(dir, "clip.mp4"),
            Some(PathBuf::from("/srv/downloads/clip.mp4"))
        );
        assert!(resolve(dir, "../etc/passwd").is_none());
        assert!(resolve(dir, "..").is_none());
        assert!(resolve(dir, ".").is_none());
        assert!(resolve(dir, "a/b.mp4").is_none());
        assert!(resolve(dir, "a\\b.mp4").is_none());
        assert!(resolve(dir, "").is_none());
    }

    #[tokio::test]
    async fn remove_partials_keeps_finished_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "clip.mp4",
            "clip.f137.mp4",
            "clip.f140.m4a.part",
            "clip.mp4.part",
            "clip.mp4.ytdl",
            "clip.mp4.part-Frag3",
            "clip.temp.mp4",
            "clipper.mp4.part",
            "other.mp4.part",
            // Another job's stem that extends this one.
            "clip.f137_1a2b3c4d.f137.mp4.part",
            "clip.f137_1a2b3c4d.mp4",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let removed = remove_partials(dir.path(), "clip").await.unwrap();
        assert_eq!(removed, 6);

        let mut left: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        left.sort();
        assert_eq!(
            left,
            vec![
                "clip.f137_1a2b3c4d.f137.mp4.part",
                "clip.f137_1a2b3c4d.mp4",
                "clip.mp4",
                "clipper.mp4.part",
                "other.mp4.part",
            ]
        );
    }

    #[test]
    fn overlapping_stems() {
        assert!(stems_overlap("clip", "clip"));
        assert!(stems_overlap("clip", "clip.f137"));
        assert!(stems_overlap("clip.v2", "clip"));
        assert!(!stems_overlap("clip", "clipper"));
        assert!(!stems_overlap("clip", "clip_1a2b3c4d"));
    }

    #[test]
    fn disambiguated_stem_keeps_requested_name() {
        let id = JobId::new();
        let stem = disambiguate_stem("clip", id);
        assert!(stem.starts_with("clip_"));
        assert_eq!(stem.len(), "clip_".len() + 8);
        assert!(id.to_string().starts_with(&stem["clip_".len()..]));
        assert!(!stems_overlap("clip", &stem));
    }

    #[tokio::test]
    async fn remove_partials_missing_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(remove_partials(&missing, "clip").await.unwrap(), 0);
    }
}
