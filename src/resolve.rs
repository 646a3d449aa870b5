//! Converter executable resolution.
//!
//! Locates a converter binary (`dvipdfm`, `dvips`) either from an absolute
//! path or by walking the `PATH` environment variable, and verifies the
//! candidate is readable and executable before anything tries to spawn it.
//! Spawning is where launch failures get expensive (a process slot, a
//! half-initialized request); a cheap existence/permission probe up front
//! turns them into an immediate [`ExportError::ToolNotFound`].
//!
//! Resolution is strict first-match: the first directory containing a file
//! with the right name decides the outcome. If that file exists but is not
//! readable and executable, resolution fails rather than continuing down the
//! path list.

use crate::error::ExportError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolve `name` to the executable the supervisor should spawn.
///
/// An absolute `name` is checked in place; anything else is searched for in
/// the `PATH` list. On Windows an `.exe` suffix is appended when missing.
pub fn resolve_tool(name: &str) -> Result<PathBuf, ExportError> {
    resolve_with_path(name, std::env::var("PATH").ok().as_deref())
}

/// Resolution against an explicit search-path string (`None` for unset).
/// Split out from [`resolve_tool`] so tests do not have to mutate the
/// process environment.
pub(crate) fn resolve_with_path(
    name: &str,
    search_path: Option<&str>,
) -> Result<PathBuf, ExportError> {
    let not_found = || ExportError::ToolNotFound {
        name: name.to_string(),
    };

    let file_name = with_platform_suffix(name);
    let candidate = Path::new(&file_name);

    if candidate.is_absolute() {
        return if is_usable(candidate) {
            Ok(candidate.to_path_buf())
        } else {
            Err(not_found())
        };
    }

    let search_path = match search_path {
        Some(p) if !p.is_empty() => p,
        _ => return Err(not_found()),
    };

    for dir in search_path.split(path_list_separator()) {
        let full = Path::new(dir).join(&file_name);
        if full.exists() {
            // Strict first-match: an unusable first hit fails resolution.
            return if is_usable(&full) {
                debug!("Resolved '{}' to {}", name, full.display());
                Ok(full)
            } else {
                Err(not_found())
            };
        }
    }

    Err(not_found())
}

fn path_list_separator() -> char {
    if cfg!(windows) {
        ';'
    } else {
        ':'
    }
}

fn with_platform_suffix(name: &str) -> String {
    if cfg!(windows) && !name.to_ascii_lowercase().ends_with(".exe") {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

fn is_usable(path: &Path) -> bool {
    path.is_file() && is_readable(path) && is_executable(path)
}

fn is_readable(path: &Path) -> bool {
    std::fs::File::open(path).is_ok()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}
