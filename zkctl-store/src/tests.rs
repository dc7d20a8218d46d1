#[cfg(test)]
mod unit_tests {
    use crate::{DataVolume, FileSystemPeerStore, InMemoryPeerStore};
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use zkctl_core::{
        CasOutcome, ConfigPaths, ConfigVersion, ControllerError, Credential, HealthStatus,
        PeerStateStore, RenderInput, RenderedConfig, Role, ServerEntry, ServerSettings,
        TlsMaterial, TlsRender, UnitId,
    };

    fn rendered(paths: &ConfigPaths, version: u64) -> RenderedConfig {
        let mut credentials = BTreeMap::new();
        credentials.insert("super".to_string(), Credential::new("super", "a"));
        credentials.insert("sync".to_string(), Credential::new("sync", "b"));
        RenderedConfig::render(&RenderInput {
            unit: UnitId::new(0),
            paths,
            settings: ServerSettings {
                init_limit: 5,
                sync_limit: 2,
                tick_time: 2000,
            },
            config_version: ConfigVersion::new(version),
            servers: vec![ServerEntry {
                unit: UnitId::new(0),
                host: "zk-0".to_string(),
                role: Role::Voter,
            }],
            credentials: &credentials,
            tls: TlsRender::default(),
        })
    }

    #[tokio::test]
    async fn test_in_memory_compare_and_write() {
        let store = InMemoryPeerStore::new();
        let other_handle = store.clone();

        let mut snapshot = store.read().await.unwrap();
        assert_eq!(snapshot.version, 0);

        snapshot.state.unit_mut(UnitId::new(1)).health = HealthStatus::Serving;
        let outcome = store
            .compare_and_write(snapshot.version, &snapshot.state)
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Written { version: 1 });

        // Clones observe the same blob
        let seen = other_handle.read().await.unwrap();
        assert_eq!(seen.version, 1);
        assert_eq!(
            seen.state.unit(UnitId::new(1)).map(|u| u.health),
            Some(HealthStatus::Serving)
        );

        let stale = other_handle
            .compare_and_write(0, &snapshot.state)
            .await
            .unwrap();
        assert_eq!(stale, CasOutcome::Conflict { actual: 1 });
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_file_system_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemPeerStore::new(temp_dir.path()).await.unwrap();

        let mut snapshot = store.read().await.unwrap();
        assert_eq!(snapshot.version, 0);
        snapshot
            .state
            .ensemble
            .members
            .insert(UnitId::new(0), Role::Voter);
        assert!(store
            .compare_and_write(0, &snapshot.state)
            .await
            .unwrap()
            .is_written());

        let reopened = FileSystemPeerStore::new(temp_dir.path()).await.unwrap();
        let loaded = reopened.read().await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.state, snapshot.state);

        let outcome = reopened.compare_and_write(0, &loaded.state).await.unwrap();
        assert_eq!(outcome, CasOutcome::Conflict { actual: 1 });
    }

    #[tokio::test]
    async fn test_file_system_detects_corruption() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemPeerStore::new(temp_dir.path()).await.unwrap();
        let mut snapshot = store.read().await.unwrap();
        snapshot.state.unit_mut(UnitId::new(2)).address = Some("zk-2".to_string());
        store.compare_and_write(0, &snapshot.state).await.unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        std::fs::write(store.path(), raw.replace("zk-2", "zk-9")).unwrap();

        let err = store.read().await.unwrap_err();
        assert!(matches!(err, ControllerError::Store { .. }));
    }

    #[tokio::test]
    async fn test_data_volume_writes_only_on_change() {
        let temp_dir = TempDir::new().unwrap();
        let volume = DataVolume::new(temp_dir.path());

        let first = rendered(volume.paths(), 1);
        assert!(volume.write_config(&first).await.unwrap());
        assert!(!volume.write_config(&first).await.unwrap());
        assert_eq!(volume.read_myid().await.unwrap(), Some(1));
        assert!(volume.paths().log_dir.is_dir());

        let second = rendered(volume.paths(), 2);
        assert!(volume.write_config(&second).await.unwrap());
        let dynamic = std::fs::read_to_string(volume.paths().dynamic()).unwrap();
        assert!(dynamic.ends_with("version=2\n"));
    }

    #[tokio::test]
    async fn test_data_volume_tls_files() {
        let temp_dir = TempDir::new().unwrap();
        let volume = DataVolume::new(temp_dir.path());
        let material = TlsMaterial {
            certificate: "CERT".to_string(),
            private_key: "KEY".to_string(),
            chain: vec!["INTERMEDIATE".to_string()],
            trust_bundle: vec!["NEW-CA".to_string(), "OLD-CA".to_string()],
        };

        assert!(volume.write_tls(Some(&material)).await.unwrap());
        assert!(!volume.write_tls(Some(&material)).await.unwrap());
        let keystore = std::fs::read_to_string(volume.paths().keystore()).unwrap();
        assert_eq!(keystore, "KEY\nCERT\nINTERMEDIATE");
        let truststore = std::fs::read_to_string(volume.paths().truststore()).unwrap();
        assert_eq!(truststore, "NEW-CA\nOLD-CA");

        assert!(volume.write_tls(None).await.unwrap());
        assert!(!volume.paths().keystore().exists());
        assert!(!volume.write_tls(None).await.unwrap());
    }
}
