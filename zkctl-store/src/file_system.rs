use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use zkctl_core::{CasOutcome, ControllerError, PeerState, PeerStateStore, Result, Snapshot};

const STATE_FILE: &str = "peer-state.json";

/// On-disk framing of the peer state.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u64,
    checksum: u32,
    payload: String,
}

/// File-based peer state.
///
/// The blob is stored as JSON with a CRC32 checksum of the payload. Writes go
/// to a temporary file that is atomically renamed over the previous one, and
/// the compare-and-write is serialized within the process.
#[derive(Debug)]
pub struct FileSystemPeerStore {
    state_file_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSystemPeerStore {
    /// Create a store under `data_dir`, creating the directory if needed.
    ///
    /// # Errors
    /// * Returns error if the data directory cannot be created
    pub async fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();

        if !data_dir.exists() {
            fs::create_dir_all(data_dir).await.map_err(|e| {
                ControllerError::store(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(Self {
            state_file_path: data_dir.join(STATE_FILE),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.state_file_path
    }

    async fn load(&self) -> Result<Snapshot> {
        let raw = match fs::read(&self.state_file_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Snapshot::default()),
            Err(e) => {
                return Err(ControllerError::store(format!(
                    "Failed to read state file: {}",
                    e
                )))
            }
        };

        let envelope: Envelope = serde_json::from_slice(&raw)?;
        let actual = crc32fast::hash(envelope.payload.as_bytes());
        if actual != envelope.checksum {
            return Err(ControllerError::store(format!(
                "Checksum mismatch in {}: expected {:08x}, found {:08x}",
                self.state_file_path.display(),
                envelope.checksum,
                actual
            )));
        }

        let state: PeerState = serde_json::from_str(&envelope.payload)?;
        Ok(Snapshot {
            version: envelope.version,
            state,
        })
    }

    async fn store(&self, version: u64, state: &PeerState) -> Result<()> {
        let payload = serde_json::to_string(state)?;
        let envelope = Envelope {
            version,
            checksum: crc32fast::hash(payload.as_bytes()),
            payload,
        };
        let encoded = serde_json::to_vec_pretty(&envelope)?;

        let temp_file_path = self.state_file_path.with_extension("tmp");
        fs::write(&temp_file_path, encoded).await.map_err(|e| {
            ControllerError::store(format!("Failed to write state to temp file: {}", e))
        })?;
        fs::rename(&temp_file_path, &self.state_file_path)
            .await
            .map_err(|e| {
                ControllerError::store(format!("Failed to rename temp file to state file: {}", e))
            })?;
        Ok(())
    }
}

#[async_trait]
impl PeerStateStore for FileSystemPeerStore {
    async fn read(&self) -> Result<Snapshot> {
        self.load().await
    }

    async fn compare_and_write(&self, expected: u64, state: &PeerState) -> Result<CasOutcome> {
        let _guard = self.write_lock.lock().await;

        let current = self.load().await?;
        if current.version != expected {
            debug!(
                "Peer state write lost: expected version {}, found {}",
                expected, current.version
            );
            return Ok(CasOutcome::Conflict {
                actual: current.version,
            });
        }

        let version = expected + 1;
        self.store(version, state).await?;
        Ok(CasOutcome::Written { version })
    }
}
