use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{path::Path as ObjPath, ObjectStore};
use uuid::Uuid;

use crate::utils::config::{AppConfig, StorageKind};

pub type DynStore = Arc<dyn ObjectStore>;

/// Presigned download links stay valid for a day.
pub const DEFAULT_URL_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Object storage for uploaded source files and generated exports.
#[derive(Clone)]
pub struct StorageManager {
    store: DynStore,
    backend_kind: StorageKind,
    local_base: Option<PathBuf>,
    public_base_url: String,
}

impl StorageManager {
    pub async fn new(cfg: &AppConfig) -> object_store::Result<Self> {
        let backend_kind = cfg.storage.clone();
        let (store, local_base) = create_storage_backend(cfg).await?;

        Ok(Self {
            store,
            backend_kind,
            local_base,
            public_base_url: cfg.public_file_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Wraps an already constructed backend, mostly for tests.
    pub fn with_backend(store: DynStore, backend_kind: StorageKind) -> Self {
        Self {
            store,
            backend_kind,
            local_base: None,
            public_base_url: "memory://files".to_string(),
        }
    }

    /// In-memory storage with no persistence.
    pub fn in_memory() -> Self {
        Self::with_backend(Arc::new(InMemory::new()), StorageKind::Memory)
    }

    pub fn backend_kind(&self) -> &StorageKind {
        &self.backend_kind
    }

    pub fn local_base_path(&self) -> Option<&Path> {
        self.local_base.as_deref()
    }

    pub async fn put(&self, location: &str, data: Bytes) -> object_store::Result<()> {
        let path = ObjPath::from(location);
        let payload = object_store::PutPayload::from_bytes(data);
        self.store.put(&path, payload).await.map(|_| ())
    }

    pub async fn get(&self, location: &str) -> object_store::Result<Bytes> {
        let path = ObjPath::from(location);
        let result = self.store.get(&path).await?;
        result.bytes().await
    }

    pub async fn exists(&self, location: &str) -> object_store::Result<bool> {
        let path = ObjPath::from(location);
        self.store
            .head(&path)
            .await
            .map(|_| true)
            .or_else(|e| match e {
                object_store::Error::NotFound { .. } => Ok(false),
                _ => Err(e),
            })
    }

    pub async fn list(
        &self,
        prefix: Option<&str>,
    ) -> object_store::Result<Vec<object_store::ObjectMeta>> {
        let prefix_path = prefix.map(ObjPath::from);
        self.store.list(prefix_path.as_ref()).try_collect().await
    }

    /// Persists a knowledge source file under `{tenant}/{knowledge_id}/{uuid}{ext}`.
    pub async fn save_file(
        &self,
        tenant_id: u64,
        knowledge_id: &str,
        file_name: &str,
        data: Bytes,
    ) -> object_store::Result<String> {
        let location = format!(
            "{tenant_id}/{knowledge_id}/{}{}",
            Uuid::new_v4(),
            extension_suffix(file_name)
        );
        self.put(&location, data).await?;
        Ok(location)
    }

    /// Persists generated bytes (exports, side files) under `{tenant}/exports/{uuid}{ext}`.
    pub async fn save_bytes(
        &self,
        tenant_id: u64,
        file_name: &str,
        data: Bytes,
    ) -> object_store::Result<String> {
        let location = format!(
            "{tenant_id}/exports/{}{}",
            Uuid::new_v4(),
            extension_suffix(file_name)
        );
        self.put(&location, data).await?;
        Ok(location)
    }

    pub async fn get_file(&self, location: &str) -> object_store::Result<Bytes> {
        self.get(location).await
    }

    /// Removes a single object. Missing objects are not an error.
    pub async fn delete_file(&self, location: &str) -> object_store::Result<()> {
        let path = ObjPath::from(location);
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Download link for a stored object that expires after `expiry`.
    pub fn file_url(&self, location: &str, expiry: Duration) -> String {
        let expires_at = chrono::Utc::now()
            + chrono::Duration::from_std(expiry).unwrap_or_else(|_| chrono::Duration::hours(24));
        format!(
            "{}/{}?expires={}",
            self.public_base_url,
            location.trim_start_matches('/'),
            expires_at.timestamp()
        )
    }
}

fn extension_suffix(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

async fn create_storage_backend(
    cfg: &AppConfig,
) -> object_store::Result<(DynStore, Option<PathBuf>)> {
    match cfg.storage {
        StorageKind::Local => {
            let base = resolve_base_dir(cfg);
            if !base.exists() {
                tokio::fs::create_dir_all(&base).await.map_err(|e| {
                    object_store::Error::Generic {
                        store: "LocalFileSystem",
                        source: e.into(),
                    }
                })?;
            }
            let store = LocalFileSystem::new_with_prefix(base.clone())?;
            Ok((Arc::new(store), Some(base)))
        }
        StorageKind::Memory => {
            let store = InMemory::new();
            Ok((Arc::new(store), None))
        }
    }
}

/// Resolve the absolute base directory used for local storage from config.
///
/// If `data_dir` is relative, it is resolved against the current working directory.
pub fn resolve_base_dir(cfg: &AppConfig) -> PathBuf {
    let dir = PathBuf::from(&cfg.data_dir);
    if dir.is_absolute() {
        dir
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> AppConfig {
        AppConfig {
            storage: StorageKind::Memory,
            public_file_base_url: "https://files.example.com/".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn memory_backend_round_trips_files() {
        let storage = StorageManager::new(&memory_config())
            .await
            .expect("create storage manager");
        assert!(storage.local_base_path().is_none());

        let location = storage
            .save_file(7, "knowledge-1", "report.pdf", Bytes::from_static(b"pdf bytes"))
            .await
            .expect("save file");
        assert!(location.starts_with("7/knowledge-1/"));
        assert!(location.ends_with(".pdf"));

        let fetched = storage.get_file(&location).await.expect("get");
        assert_eq!(fetched.as_ref(), b"pdf bytes");

        storage.delete_file(&location).await.expect("delete");
        assert!(!storage.exists(&location).await.expect("exists"));
        storage
            .delete_file(&location)
            .await
            .expect("deleting a missing file is fine");
    }

    #[tokio::test]
    async fn exports_live_under_tenant_exports_prefix() {
        let storage = StorageManager::in_memory();
        let location = storage
            .save_bytes(3, "failed.csv", Bytes::from_static(b"a,b"))
            .await
            .expect("save bytes");
        assert!(location.starts_with("3/exports/"));
        assert!(location.ends_with(".csv"));

        let listed = storage.list(Some("3/exports")).await.expect("list");
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn file_url_embeds_expiry() {
        let storage = StorageManager::new(&memory_config())
            .await
            .expect("create storage manager");
        let before = chrono::Utc::now().timestamp();
        let url = storage.file_url("1/exports/x.csv", DEFAULT_URL_EXPIRY);

        assert!(url.starts_with("https://files.example.com/1/exports/x.csv?expires="));
        let expires: i64 = url
            .rsplit('=')
            .next()
            .and_then(|v| v.parse().ok())
            .expect("expiry timestamp");
        assert!(expires >= before + 24 * 60 * 60 - 1);
    }

    #[tokio::test]
    async fn local_backend_writes_below_data_dir() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cfg = AppConfig {
            storage: StorageKind::Local,
            data_dir: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let storage = StorageManager::new(&cfg).await.expect("storage");
        let base = storage.local_base_path().expect("local base").to_path_buf();

        storage
            .put("a/b.txt", Bytes::from_static(b"local"))
            .await
            .expect("put");
        assert!(base.join("a/b.txt").exists());

        storage.delete_file("a/b.txt").await.expect("delete");
        assert!(!storage.exists("a/b.txt").await.expect("exists"));
    }
}
