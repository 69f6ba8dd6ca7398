use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// Directory holding every IPC socket of the pipeline.
const IPC_DIR: &str = "/tmp/mantis";

/// Where a ZeroMQ socket binds or connects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "address")]
pub enum Transport {
    /// Unix domain socket `/tmp/mantis/<name>.sock`.
    Ipc(String),
    Tcp { host: String, port: u16 },
}

impl Transport {
    pub fn ipc(name: &str) -> Self {
        Self::Ipc(name.to_string())
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp { host: host.into(), port }
    }

    /// Parse `ipc://...` or `tcp://host:port`.
    ///
    /// Only the file stem of an IPC path is kept; the socket always lives
    /// in the pipeline's IPC directory.
    pub fn parse(endpoint: &str) -> Result<Self, BusError> {
        let bad = |why: &str| BusError::Transport(format!("{why}: '{endpoint}'"));
        if let Some(path) = endpoint.strip_prefix("ipc://") {
            let name = Path::new(path)
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| bad("bad ipc endpoint"))?;
            return Ok(Self::ipc(name));
        }
        let addr = endpoint
            .strip_prefix("tcp://")
            .ok_or_else(|| bad("expected ipc:// or tcp://"))?;
        let (host, port) = addr.rsplit_once(':').ok_or_else(|| bad("missing port"))?;
        let port = port.parse().map_err(|_| bad("bad port"))?;
        Ok(Self::tcp(host, port))
    }

    pub fn endpoint(&self) -> String {
        match self {
            Self::Ipc(_) => format!("ipc://{}", self.ipc_path().unwrap_or_default().display()),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }

    fn ipc_path(&self) -> Option<PathBuf> {
        match self {
            Self::Ipc(name) => Some(Path::new(IPC_DIR).join(format!("{name}.sock"))),
            Self::Tcp { .. } => None,
        }
    }

    /// Create the IPC directory; binding fails without it. No-op for TCP.
    pub fn ensure_ipc_dir(&self) -> std::io::Result<()> {
        if let Some(dir) = self.ipc_path().as_deref().and_then(Path::parent) {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Delete a socket file left behind by a crashed process (it would make
    /// the next bind fail with `EADDRINUSE`). No-op for TCP.
    pub fn remove_stale_socket(&self) -> std::io::Result<()> {
        let Some(path) = self.ipc_path() else {
            return Ok(());
        };
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "removed stale IPC socket");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}
