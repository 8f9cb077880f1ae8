//! Central path resolution for taskroom data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `TASKROOM_DATA_DIR` env > `~/.taskroom`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
///
/// `explicit` already folds in the env var through clap; the home default
/// applies when neither is set.
pub fn init_data_dir(explicit: Option<&Path>) -> io::Result<PathBuf> {
    let dir = match explicit {
        Some(p) => p.to_path_buf(),
        None => dirs::home_dir()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "HOME directory not found"))?
            .join(".taskroom"),
    };

    let mut guard = DATA_DIR.write().unwrap_or_else(|e| e.into_inner());
    *guard = Some(dir.clone());
    Ok(dir)
}

/// Return the current data directory. Panics if `init_data_dir` hasn't been called.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .expect("data_dir() called before init_data_dir()")
}

pub fn db_path() -> PathBuf {
    data_dir().join("taskroom.db")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_live_under_the_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = init_data_dir(Some(tmp.path())).unwrap();
        assert_eq!(dir, tmp.path());

        ensure_dirs().unwrap();
        assert!(log_dir().is_dir());
        assert_eq!(db_path(), tmp.path().join("taskroom.db"));
    }
}
