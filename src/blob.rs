//! Blob injector (spec §4.G): fetch a server-side blob, then delete it, on every exit path.
//!
//! Used both when formatting a remote exception that references a `blobstore_id`, and when
//! splicing a compile log's contents into the agent's reply. The blobstore transport itself
//! is out of scope (spec §1) — callers supply a [`ResourceManager`].

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob fetch failed for {id}: {message}")]
    FetchFailed { id: String, message: String },
}

/// The blobstore-facing contract this crate depends on. Shared and reentrant (spec §5).
#[async_trait]
pub trait ResourceManager: Send + Sync {
    async fn get_resource(&self, id: &str) -> Result<Vec<u8>, BlobError>;
    async fn delete_resource(&self, id: &str);
}

/// Fetches `id`, then deletes it — unconditionally, even if the caller never reads the
/// fetched bytes (e.g. the fetch failed). This is the lossy-if-the-process-crashes window
/// Design Note "Blob side effects" calls out as intentional and not fixed here.
pub async fn download_and_delete_blob(
    resource_manager: &dyn ResourceManager,
    id: &str,
) -> Result<Vec<u8>, BlobError> {
    let result = resource_manager.get_resource(id).await;
    resource_manager.delete_resource(id).await;
    result
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeResourceManager {
        blobs: Mutex<HashMap<String, Vec<u8>>>,
        deleted: Mutex<Vec<String>>,
    }

    impl FakeResourceManager {
        pub fn with_blob(id: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
            let manager = Self::default();
            manager.blobs.lock().unwrap().insert(id.into(), bytes.into());
            manager
        }

        pub fn deleted_ids(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResourceManager for FakeResourceManager {
        async fn get_resource(&self, id: &str) -> Result<Vec<u8>, BlobError> {
            self.blobs.lock().unwrap().get(id).cloned().ok_or_else(|| BlobError::FetchFailed {
                id: id.to_string(),
                message: "not found".to_string(),
            })
        }

        async fn delete_resource(&self, id: &str) {
            self.deleted.lock().unwrap().push(id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::FakeResourceManager;
    use super::*;

    #[tokio::test]
    async fn fetches_and_deletes_on_success() {
        let manager = FakeResourceManager::with_blob("blob-1", b"hello".to_vec());
        let bytes = download_and_delete_blob(&manager, "blob-1").await.unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(manager.deleted_ids(), vec!["blob-1"]);
    }

    #[tokio::test]
    async fn deletes_even_when_fetch_fails() {
        let manager = FakeResourceManager::default();
        let result = download_and_delete_blob(&manager, "missing").await;
        assert!(result.is_err());
        assert_eq!(manager.deleted_ids(), vec!["missing"]);
    }
}
