//! Resolves where persistent segment files live.
//!
//! Mirrors the candidate-list idiom used elsewhere in this codebase for
//! locating a writable directory: an explicit override wins outright, then
//! a couple of environment-variable fallbacks, then the user's home
//! directory, then the working directory. Nothing here touches the
//! filesystem beyond reading env vars; [`ensure_var_dir`] is what actually
//! creates the directory once a caller is ready to open a file in it.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CacheError, Result};

/// Overrides the resolved var directory outright.
pub const CLIENT_HOME_VAR: &str = "OBJCACHE_CLIENT_HOME";
/// Names an instance home; the var directory becomes `<value>/var`.
pub const INSTANCE_HOME_VAR: &str = "OBJCACHE_INSTANCE_HOME";

/// Resolves the directory persistent segment files live in: an explicit
/// config value wins outright, then `OBJCACHE_CLIENT_HOME`, then
/// `OBJCACHE_INSTANCE_HOME`/var, then a `.objcache` directory under the
/// user's home, then finally the process working directory.
pub fn resolve_var_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Ok(dir) = env::var(CLIENT_HOME_VAR) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Ok(instance_home) = env::var(INSTANCE_HOME_VAR) {
        if !instance_home.is_empty() {
            return PathBuf::from(instance_home).join("var");
        }
    }
    if let Some(home) = dirs_next::home_dir() {
        return home.join(".objcache");
    }
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Creates `dir` (and any missing parents) if it does not already exist,
/// returning a typed error instead of letting the first segment-file open
/// fail with a bare "not found".
pub fn ensure_var_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(|e| CacheError::VarDirUnavailable {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Builds the filename for one of the two segments of a persistent cache:
/// `c<storage>-<client>-<which>.zec`.
pub fn segment_filename(storage_tag: &str, client_tag: &str, which: u8) -> String {
    format!("c{storage_tag}-{client_tag}-{which}.zec")
}

/// Builds the full path to one of the two segments of a persistent cache.
pub fn segment_path(var_dir: &std::path::Path, storage_tag: &str, client_tag: &str, which: u8) -> PathBuf {
    var_dir.join(segment_filename(storage_tag, client_tag, which))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn explicit_override_wins() {
        let explicit = Path::new("/explicit/dir");
        assert_eq!(resolve_var_dir(Some(explicit)), explicit);
    }

    #[test]
    fn filenames_match_the_convention() {
        assert_eq!(segment_filename("store1", "client9", 0), "cstore1-client9-0.zec");
        assert_eq!(segment_filename("store1", "client9", 1), "cstore1-client9-1.zec");
    }

    #[test]
    fn segment_path_joins_var_dir() {
        let p = segment_path(Path::new("/var/cache"), "s", "c", 0);
        assert_eq!(p, Path::new("/var/cache/cs-c-0.zec"));
    }

    #[test]
    fn ensure_var_dir_creates_missing_directory() {
        let base = tempfile::tempdir().unwrap();
        let nested = base.path().join("nested").join("var");
        assert!(!nested.exists());
        ensure_var_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn ensure_var_dir_is_idempotent_on_existing_directory() {
        let base = tempfile::tempdir().unwrap();
        ensure_var_dir(base.path()).unwrap();
        ensure_var_dir(base.path()).unwrap();
    }
}
