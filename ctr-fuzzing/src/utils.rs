// ctr-fuzzing/src/utils.rs
//! Environment, corpus and artifact helpers

use std::env;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::LevelFilter;

use crate::config::HarnessConfig;
use crate::constants;
use crate::error::HarnessError;

/// Get the fuzzing mode from environment or default to standard
pub fn get_fuzzing_mode() -> String {
    env::var("CTR_FUZZING_MODE").unwrap_or_else(|_| constants::modes::STANDARD.to_string())
}

/// Default log filter for a fuzzing mode
pub fn log_level_for_mode(mode: &str) -> LevelFilter {
    match mode {
        constants::modes::DEBUG => LevelFilter::Debug,
        constants::modes::CI => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

/// Get the maximum iterations based on mode
pub fn get_max_iterations() -> usize {
    let default_iterations = match get_fuzzing_mode().as_str() {
        constants::modes::QUICK => 1000,
        constants::modes::THOROUGH => 50000,
        constants::modes::CI => 5000,
        _ => constants::MAX_ITERATIONS,
    };

    env::var("CTR_FUZZING_MAX_ITERATIONS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(default_iterations)
}

fn target_dir(var: &str, default: &str, target: &str) -> io::Result<PathBuf> {
    let base_dir = env::var(var).unwrap_or_else(|_| default.to_string());
    let path = Path::new(&base_dir).join(target);
    fs::create_dir_all(&path)?;
    Ok(path)
}

/// Get the corpus directory for a target, creating it if needed
pub fn get_corpus_dir(target: &str) -> io::Result<PathBuf> {
    target_dir("CTR_FUZZING_CORPUS_DIR", constants::DEFAULT_CORPUS_DIR, target)
}

/// Get the artifacts directory for a target, creating it if needed
pub fn get_artifacts_dir(target: &str) -> io::Result<PathBuf> {
    target_dir("CTR_FUZZING_ARTIFACTS_DIR", constants::DEFAULT_ARTIFACT_DIR, target)
}

/// Create a unique file name with timestamp
pub fn timestamped_filename(prefix: &str, extension: &str) -> String {
    format!(
        "{}_{}.{}",
        prefix,
        Utc::now().format("%Y%m%dT%H%M%S%.6f"),
        extension
    )
}

/// Save an input into `dir` under a timestamped name
pub fn save_to_corpus(dir: &Path, data: &[u8]) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(timestamped_filename("corpus", "bin"));
    fs::write(&path, data)?;
    Ok(path)
}

/// Load every regular file in `dir`, in name order
///
/// A missing directory yields an empty corpus.
pub fn load_corpus(dir: &Path) -> io::Result<Vec<Vec<u8>>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();

    paths.iter().map(fs::read).collect()
}

/// `current` with `dir` appended as the last search entry
pub fn extended_path(current: Option<OsString>, dir: &Path) -> Result<OsString, HarnessError> {
    let mut entries: Vec<PathBuf> = current
        .as_deref()
        .map(|value| env::split_paths(value).collect())
        .unwrap_or_default();
    if !entries.iter().any(|entry| entry == dir) {
        entries.push(dir.to_path_buf());
    }
    env::join_paths(entries).map_err(|err| HarnessError::InvalidPath {
        path: dir.to_path_buf(),
        reason: err.to_string(),
    })
}

/// Create the socket directory and make the daemon binaries resolvable
///
/// Runs once per process before the first iteration. Failures are fatal.
pub fn prepare_environment(config: &HarnessConfig) -> Result<(), HarnessError> {
    let socket_dir = config
        .socket_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new(constants::DEFAULT_SOCKET_DIR));

    fs::create_dir_all(socket_dir)
        .and_then(|()| fs::set_permissions(socket_dir, fs::Permissions::from_mode(0o777)))
        .map_err(|source| HarnessError::CreateDir {
            path: socket_dir.to_path_buf(),
            source,
        })?;

    let path = extended_path(env::var_os("PATH"), &config.binary_dir)?;
    env::set_var("PATH", &path);
    log::debug!(
        "socket directory {} ready, PATH includes {}",
        socket_dir.display(),
        config.binary_dir.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_levels_follow_mode() {
        assert_eq!(log_level_for_mode(constants::modes::DEBUG), LevelFilter::Debug);
        assert_eq!(log_level_for_mode(constants::modes::CI), LevelFilter::Error);
        assert_eq!(log_level_for_mode(constants::modes::QUICK), LevelFilter::Info);
    }

    #[test]
    fn test_extended_path_appends_once() {
        let dir = Path::new("/out/containerd-binaries");

        let path = extended_path(Some(OsString::from("/usr/bin:/bin")), dir).unwrap();
        assert_eq!(path, OsString::from("/usr/bin:/bin:/out/containerd-binaries"));

        let again = extended_path(Some(path.clone()), dir).unwrap();
        assert_eq!(again, path);

        let fresh = extended_path(None, dir).unwrap();
        assert_eq!(fresh, OsString::from("/out/containerd-binaries"));
    }

    #[test]
    fn test_extended_path_rejects_separator() {
        let result = extended_path(None, Path::new("/bad:dir"));
        assert!(matches!(result, Err(HarnessError::InvalidPath { .. })));
    }

    #[test]
    fn test_corpus_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = dir.path().join("corpus");

        assert!(load_corpus(&corpus).unwrap().is_empty());

        save_to_corpus(&corpus, b"first").unwrap();
        let loaded = load_corpus(&corpus).unwrap();
        assert_eq!(loaded, vec![b"first".to_vec()]);
    }

    #[test]
    fn test_prepare_environment_creates_socket_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig {
            socket_path: dir.path().join("run/containerd.sock"),
            binary_dir: dir.path().join("bin"),
            ..HarnessConfig::default()
        };

        prepare_environment(&config).unwrap();

        let meta = fs::metadata(dir.path().join("run")).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o777, 0o777);
        let path = env::var_os("PATH").unwrap();
        assert!(env::split_paths(&path).any(|entry| entry == config.binary_dir));
    }
}
