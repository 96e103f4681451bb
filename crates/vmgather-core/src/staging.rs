//! Validates, creates, and probes candidate staging directories.

use std::path::{Path, PathBuf};

use crate::error::{GatherError, Result};

/// Result of [`check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingCheck {
    /// Whether the directory is usable (exists or was created, and is
    /// writable).
    pub ok: bool,
    /// Absolute, symlink-resolved path.
    pub abs_path: PathBuf,
    /// Whether the directory already existed.
    pub exists: bool,
    /// Whether the directory could be created if missing.
    pub can_create: bool,
    /// Human-readable detail, populated on failure.
    pub message: Option<String>,
}

/// Recommends a platform-appropriate default staging directory.
pub fn recommend() -> PathBuf {
    if cfg!(target_os = "windows") {
        if let Ok(local_app_data) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(local_app_data).join("vmgather").join("staging");
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".vmgather").join("staging")
}

/// Checks whether `path` is usable as a staging directory, optionally
/// creating it (and its parents) when missing.
pub fn check(path: &Path, ensure: bool) -> StagingCheck {
    let existed = path.exists();

    if !existed {
        if !ensure {
            return StagingCheck {
                ok: false,
                abs_path: path.to_path_buf(),
                exists: false,
                can_create: true,
                message: Some("directory does not exist".to_string()),
            };
        }
        if let Err(e) = std::fs::create_dir_all(path) {
            return StagingCheck {
                ok: false,
                abs_path: path.to_path_buf(),
                exists: false,
                can_create: false,
                message: Some(format!("failed to create directory: {e}")),
            };
        }
    }

    let abs_path = match std::fs::canonicalize(path) {
        Ok(p) => p,
        Err(e) => {
            return StagingCheck {
                ok: false,
                abs_path: path.to_path_buf(),
                exists: existed,
                can_create: true,
                message: Some(format!("failed to resolve absolute path: {e}")),
            };
        }
    };

    let sentinel = abs_path.join(".vmgather-write-test");
    match std::fs::write(&sentinel, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&sentinel);
            StagingCheck {
                ok: true,
                abs_path,
                exists: true,
                can_create: true,
                message: None,
            }
        }
        Err(e) => StagingCheck {
            ok: false,
            abs_path,
            exists: true,
            can_create: true,
            message: Some(format!("directory is not writable: {e}")),
        },
    }
}

/// Resolves `stagingDir` per step 1 of the pipeline: the configured
/// directory if set, else the platform recommendation, creating it if
/// missing. Fails with `StagingUnavailable` if the directory cannot be made
/// writable.
pub fn resolve(configured: Option<&str>) -> Result<PathBuf> {
    let candidate = configured
        .map(PathBuf::from)
        .unwrap_or_else(recommend);
    let result = check(&candidate, true);
    if !result.ok {
        return Err(GatherError::StagingUnavailable(
            result.message.unwrap_or_else(|| "not writable".to_string()),
        ));
    }
    Ok(result.abs_path)
}

/// Resolves `requested` against `root`, following symlinks, and rejects the
/// result with `Forbidden` unless it remains inside `root`. Exists as a pure
/// helper so download-confinement logic is testable independent of an HTTP
/// layer.
pub fn resolve_confined(root: &Path, requested: &Path) -> Result<PathBuf> {
    let root_abs = std::fs::canonicalize(root)
        .map_err(|e| GatherError::StagingUnavailable(format!("resolving root: {e}")))?;
    let target_abs = std::fs::canonicalize(requested).map_err(|_| GatherError::Forbidden {
        path: requested.to_path_buf(),
    })?;
    if target_abs.starts_with(&root_abs) {
        Ok(target_abs)
    } else {
        Err(GatherError::Forbidden { path: target_abs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_creates_missing_directory_when_ensured() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("staging");
        let result = check(&target, true);
        assert!(result.ok);
        assert!(target.exists());
    }

    #[test]
    fn check_reports_missing_directory_without_ensure() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("absent");
        let result = check(&target, false);
        assert!(!result.ok);
        assert!(!result.exists);
    }

    #[test]
    fn resolve_confined_accepts_path_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let inside = dir.path().join("exports");
        std::fs::create_dir(&inside).unwrap();
        let file = inside.join("archive.zip");
        std::fs::write(&file, b"x").unwrap();

        let resolved = resolve_confined(&inside, &file).unwrap();
        assert!(resolved.starts_with(std::fs::canonicalize(&inside).unwrap()));
    }

    #[test]
    fn resolve_confined_rejects_path_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let inside = dir.path().join("exports");
        std::fs::create_dir(&inside).unwrap();
        let outside = dir.path().join("secret.txt");
        std::fs::write(&outside, b"x").unwrap();

        let err = resolve_confined(&inside, &outside).unwrap_err();
        assert!(matches!(err, GatherError::Forbidden { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_confined_rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let inside = dir.path().join("exports");
        std::fs::create_dir(&inside).unwrap();
        let outside = dir.path().join("secret.txt");
        std::fs::write(&outside, b"x").unwrap();
        let link = inside.join("escape.txt");
        std::os::unix::fs::symlink(&outside, &link).unwrap();

        let err = resolve_confined(&inside, &link).unwrap_err();
        assert!(matches!(err, GatherError::Forbidden { .. }));
    }
}
