//! Shared filesystem conventions: user config directory resolution and the
//! atomic temp-then-rename write pattern used by the Session (notebook save)
//! and the provider registry's config file. There is no build/cache tree in
//! this domain — unlike a compiled-cell notebook, nothing here is compiled.

use std::io;
use std::path::{Path, PathBuf};

/// Resolve the `forge`-scoped directory under the user's config directory
/// (e.g. `~/.config/forge` on Linux, `~/Library/Application Support/forge`
/// on macOS), creating it if necessary.
pub fn config_dir() -> io::Result<PathBuf> {
    let base = dirs::config_dir().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "could not resolve a user config directory",
        )
    })?;
    let dir = base.join("forge");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Write `bytes` to `path` atomically: write to a sibling `.tmp` file in the
/// same directory, then `rename` over the destination. On Unix, `mode` (if
/// given) restricts permissions on the temp file before the rename so the
/// final file never has a window at the wrong permission bits.
pub fn atomic_write(path: &Path, bytes: &[u8], mode: Option<u32>) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "forge".to_string())
    ));

    std::fs::write(&tmp_path, bytes)?;

    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_replaces_destination() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");

        atomic_write(&path, b"{\"a\":1}", None).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":1}");

        atomic_write(&path, b"{\"a\":2}", None).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":2}");

        // No leftover temp file.
        let entries: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn atomic_write_sets_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("secret.json");
        atomic_write(&path, b"{}", Some(0o600)).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
