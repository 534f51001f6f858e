//! Backend definition discovery.
//!
//! The broker directory (by default the directory holding the broker
//! executable) carries a `backends.json` file listing the backend
//! processes, and one `<backend>/input_methods/<im>/ime.json` file per
//! input method mapping its profile GUID to that backend:
//!
//! ```json
//! // backends.json
//! [
//!   {"name": "python", "command": "python\\python3\\python.exe",
//!    "workingDir": "python", "params": "server.py"}
//! ]
//!
//! // python/input_methods/example/ime.json
//! {"guid": "{F80736AA-28DB-423A-92C9-5540F501C939}", ...}
//! ```
//!
//! Discovery runs once at startup; missing or corrupt files are skipped
//! with a warning so one broken definition cannot take the broker down.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Deserialize;

/// Immutable description of one backend process.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendDescriptor {
    /// Stable short identifier, also the backend's directory name.
    pub name: String,
    /// Executable path, relative to the broker directory.
    pub command: String,
    /// Working directory for the spawned process.
    pub working_dir: String,
    /// Single argument string passed verbatim.
    #[serde(default)]
    pub params: String,
}

/// Per-input-method definition file. Only the GUID matters here.
#[derive(Debug, Deserialize)]
struct ProfileFile {
    guid: String,
}

/// Everything discovered from the broker directory at startup.
#[derive(Debug)]
pub struct BrokerConfig {
    /// Absolute broker directory; backend commands resolve against it.
    pub broker_dir: PathBuf,
    pub backends: Vec<BackendDescriptor>,
    /// Lowercased profile GUID to backend name.
    pub profiles: HashMap<String, String>,
}

impl BrokerConfig {
    /// Discover backend definitions under `broker_dir`.
    pub fn load(broker_dir: &Path) -> Result<Self> {
        let broker_dir = broker_dir
            .canonicalize()
            .with_context(|| format!("resolving broker directory {}", broker_dir.display()))?;

        let backends = load_backends(&broker_dir);
        let mut profiles = HashMap::new();
        for backend in &backends {
            scan_input_methods(&broker_dir, &backend.name, &mut profiles);
        }

        info!(
            "loaded {} backend(s) and {} profile mapping(s) from {}",
            backends.len(),
            profiles.len(),
            broker_dir.display()
        );

        Ok(Self {
            broker_dir,
            backends,
            profiles,
        })
    }

    /// Default broker directory: where the executable lives.
    pub fn default_dir() -> Result<PathBuf> {
        let exe = std::env::current_exe().context("locating broker executable")?;
        let dir = exe
            .parent()
            .context("broker executable has no parent directory")?;
        Ok(dir.to_path_buf())
    }
}

fn load_backends(broker_dir: &Path) -> Vec<BackendDescriptor> {
    let path = broker_dir.join("backends.json");
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!("cannot read {}: {}", path.display(), err);
            return Vec::new();
        }
    };

    match serde_json::from_str::<Vec<BackendDescriptor>>(&contents) {
        Ok(backends) => backends,
        Err(err) => {
            warn!("cannot parse {}: {}", path.display(), err);
            Vec::new()
        }
    }
}

/// Scan `<broker_dir>/<backend>/input_methods/*/ime.json` and record a
/// profile mapping for every readable definition.
fn scan_input_methods(broker_dir: &Path, backend: &str, profiles: &mut HashMap<String, String>) {
    let dir = broker_dir.join(backend).join("input_methods");
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!("no input methods under {}: {}", dir.display(), err);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.'))
        {
            continue;
        }

        let ime_json = path.join("ime.json");
        let contents = match fs::read_to_string(&ime_json) {
            Ok(contents) => contents,
            Err(_) => continue,
        };
        match serde_json::from_str::<ProfileFile>(&contents) {
            Ok(profile) => {
                let guid = profile.guid.to_lowercase();
                debug!("profile {} maps to backend '{}'", guid, backend);
                profiles.insert(guid, backend.to_string());
            }
            Err(err) => {
                warn!("cannot parse {}: {}", ime_json.display(), err);
            }
        }
    }
}
