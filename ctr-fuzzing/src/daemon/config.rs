// ctr-fuzzing/src/daemon/config.rs
//! Debug configuration handed to the daemon via `--config`

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::DaemonError;

/// Runtime plugin whose shims get debug logging
pub const RUNTIME_PLUGIN: &str = "io.containerd.runtime.v1.linux";

#[derive(Debug, Serialize)]
struct DebugConfig {
    version: u32,
    plugins: BTreeMap<String, RuntimeDebug>,
}

#[derive(Debug, Serialize)]
struct RuntimeDebug {
    shim_debug: bool,
}

/// Render the shim-debug configuration as TOML
pub fn render_debug_config() -> Result<String, DaemonError> {
    let config = DebugConfig {
        version: 2,
        plugins: BTreeMap::from([(
            RUNTIME_PLUGIN.to_string(),
            RuntimeDebug { shim_debug: true },
        )]),
    };
    Ok(toml::to_string(&config)?)
}

/// Write the debug configuration to a fresh file in `dir` and return its path
///
/// The file outlives this call; the supervisor removes it once the daemon
/// launched with it has been reaped.
pub fn write_debug_config(dir: &Path) -> Result<PathBuf, DaemonError> {
    let rendered = render_debug_config()?;
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::Builder::new()
        .prefix("containerd-config-")
        .suffix(".toml")
        .tempfile_in(dir)?;
    file.write_all(rendered.as_bytes())?;
    let (_, path) = file.keep().map_err(|err| DaemonError::Io(err.error))?;
    Ok(path)
}
