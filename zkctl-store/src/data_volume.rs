use std::path::Path;
use tokio::fs;
use tracing::debug;
use zkctl_core::{ConfigPaths, ControllerError, RenderedConfig, Result, TlsMaterial};

/// The unit's persisted volume: snapshot and transaction-log directories
/// plus the rendered server configuration.
///
/// Files are rewritten only when their content changes, so applying the same
/// configuration twice touches nothing.
#[derive(Debug, Clone)]
pub struct DataVolume {
    paths: ConfigPaths,
}

impl DataVolume {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            paths: ConfigPaths::new(root),
        }
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    /// Create the data, log and config directories.
    pub async fn prepare(&self) -> Result<()> {
        for dir in [
            &self.paths.data_dir,
            &self.paths.log_dir,
            &self.paths.config_dir,
        ] {
            fs::create_dir_all(dir).await.map_err(|e| {
                ControllerError::store(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// Write every rendered file. Returns whether anything changed.
    pub async fn write_config(&self, config: &RenderedConfig) -> Result<bool> {
        self.prepare().await?;

        let mut changed = false;
        changed |= write_if_changed(&self.paths.properties(), &config.properties).await?;
        changed |= write_if_changed(&self.paths.dynamic(), &config.dynamic).await?;
        changed |= write_if_changed(&self.paths.jaas(), &config.jaas).await?;
        changed |= write_if_changed(&self.paths.myid(), &config.myid).await?;

        if changed {
            debug!(
                "Rendered config {} written to {}",
                config.config_version,
                self.paths.config_dir.display()
            );
        }
        Ok(changed)
    }

    /// Write PEM keystore and truststore, or remove them when `None`.
    pub async fn write_tls(&self, material: Option<&TlsMaterial>) -> Result<bool> {
        self.prepare().await?;

        match material {
            Some(material) => {
                let mut keystore = material.private_key.clone();
                for pem in std::iter::once(&material.certificate).chain(material.chain.iter()) {
                    if !keystore.ends_with('\n') {
                        keystore.push('\n');
                    }
                    keystore.push_str(pem);
                }
                let truststore = material.trust_bundle.join("\n");

                let mut changed = write_if_changed(&self.paths.keystore(), &keystore).await?;
                changed |= write_if_changed(&self.paths.truststore(), &truststore).await?;
                Ok(changed)
            }
            None => {
                let mut changed = remove_if_present(&self.paths.keystore()).await?;
                changed |= remove_if_present(&self.paths.truststore()).await?;
                Ok(changed)
            }
        }
    }

    pub async fn read_myid(&self) -> Result<Option<u32>> {
        match fs::read_to_string(self.paths.myid()).await {
            Ok(content) => content
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| ControllerError::store(format!("Malformed myid file: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_if_changed(path: &Path, content: &str) -> Result<bool> {
    match fs::read_to_string(path).await {
        Ok(existing) if existing == content => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content).await?;
    fs::rename(&temp_path, path).await?;
    Ok(true)
}

async fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
