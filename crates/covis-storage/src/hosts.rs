//! Replica access keyed by host name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use covis_config::Settings;
use covis_core::{CoreError, CoreResult, Host, HostRegistry, RawLocation, ReplicaStore};
use tracing::{debug, info};

use crate::backend::StorageBackend;
use crate::error::StorageResult;

/// One storage backend per configured replica host.
#[derive(Debug, Clone)]
pub struct HostStores {
    registry: HostRegistry,
    backends: HashMap<String, StorageBackend>,
}

impl HostStores {
    /// Empty table over `registry`.
    #[must_use]
    pub fn new(registry: HostRegistry) -> Self {
        Self {
            registry,
            backends: HashMap::new(),
        }
    }

    /// Build backends for every host with a configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error when an endpoint cannot be turned into a backend.
    pub fn from_settings(settings: &Settings) -> StorageResult<Self> {
        let mut stores = Self::new(settings.host_registry());
        for host in stores.registry.hosts() {
            if let Some(endpoint) = settings.host_endpoint(&host) {
                let backend = StorageBackend::from_endpoint(endpoint)?;
                stores.backends.insert(host.name().to_string(), backend);
            }
        }
        debug!(hosts = stores.backends.len(), "replica stores configured");
        Ok(stores)
    }

    /// Attach `backend` to `host`.
    #[must_use]
    pub fn with_backend(mut self, host: &Host, backend: StorageBackend) -> Self {
        self.backends.insert(host.name().to_string(), backend);
        self
    }

    fn backend(&self, host: &Host) -> CoreResult<&StorageBackend> {
        self.backends
            .get(host.name())
            .ok_or_else(|| CoreError::Configuration {
                key: host.config_key("URL"),
            })
    }
}

#[async_trait]
impl ReplicaStore for HostStores {
    async fn fetch(&self, location: &RawLocation, dest_dir: &Path) -> CoreResult<PathBuf> {
        let host = self.registry.resolve(&location.host)?;
        let backend = self.backend(&host)?;
        let file_name = Path::new(&location.path)
            .file_name()
            .map_or_else(|| "archive".into(), ToOwned::to_owned);
        let dest = dest_dir.join(file_name);
        backend.download(&location.path, &dest).await?;
        info!(host = %host, path = %location.path, "fetched replica");
        Ok(dest)
    }

    async fn store(&self, host: &Host, key: &str, src: &Path) -> CoreResult<String> {
        let backend = self.backend(host)?;
        backend.upload(key, src).await?;
        info!(host = %host, key, "stored replica");
        Ok(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use covis_config::{MapSource, settings_from};
    use covis_core::ArchiveFormat;

    type TestResult<T> = Result<T>;

    #[tokio::test]
    async fn settings_backends_fetch_and_store_by_host() -> TestResult<()> {
        let nas = tempfile::tempdir()?;
        let dmas = tempfile::tempdir()?;
        let scratch = tempfile::tempdir()?;
        tokio::fs::write(dmas.path().join("run.7z"), b"raw").await?;

        let source = MapSource::new()
            .with("COVIS_NAS_URL", format!("file://{}", nas.path().display()))
            .with("DMAS_URL", format!("file://{}", dmas.path().display()));
        let settings = settings_from(&source)?;
        let stores = HostStores::from_settings(&settings)?;

        let fetched = stores
            .fetch(
                &RawLocation::new("DMAS", "run.7z", ArchiveFormat::SevenZip),
                scratch.path(),
            )
            .await?;
        assert_eq!(fetched, scratch.path().join("run.7z"));

        let nas_host = settings.host_registry().resolve("COVIS-NAS")?;
        let recorded = stores
            .store(&nas_host, "2019/01/01/run.tar.gz", &fetched)
            .await?;
        assert_eq!(recorded, "2019/01/01/run.tar.gz");
        assert!(nas.path().join("2019/01/01/run.tar.gz").is_file());
        Ok(())
    }

    #[tokio::test]
    async fn host_without_endpoint_names_missing_key() -> TestResult<()> {
        let stores = HostStores::new(HostRegistry::default());
        let scratch = tempfile::tempdir()?;

        let err = stores
            .fetch(
                &RawLocation::new("COVIS-NAS", "run.7z", ArchiveFormat::SevenZip),
                scratch.path(),
            )
            .await
            .err();
        assert!(matches!(
            err,
            Some(CoreError::Configuration { key }) if key == "COVIS_NAS_URL"
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_replica_host_is_rejected() -> TestResult<()> {
        let stores = HostStores::new(HostRegistry::default());
        let scratch = tempfile::tempdir()?;
        let err = stores
            .fetch(
                &RawLocation::new("ELSEWHERE", "run.7z", ArchiveFormat::SevenZip),
                scratch.path(),
            )
            .await
            .err();
        assert!(matches!(err, Some(CoreError::UnknownHost { .. })));
        Ok(())
    }
}
