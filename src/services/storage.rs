use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Object metadata attached to an upload, as key/value pairs.
pub type Metadata = Vec<(String, String)>;

/// Stores processed images and hands out their public URLs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn save(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
        metadata: &Metadata,
    ) -> Result<(), StorageError>;

    /// Make a saved object readable through its public URL.
    async fn make_public(&self, key: &str) -> Result<(), StorageError>;

    /// `https://<storage-host>/<bucket>/<key>`
    fn public_url(&self, key: &str) -> String;
}

/// Headers sent with an upload: metadata as `x-amz-meta-*`, plus the
/// public-read ACL when requested. Rejects anything that is not a valid
/// header name or a printable ASCII value.
fn upload_headers(metadata: &Metadata, public_acl: bool) -> Result<Vec<(String, String)>, StorageError> {
    let mut headers = Vec::with_capacity(metadata.len() + 1);
    for (key, value) in metadata {
        let valid_key = !key.is_empty()
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        let valid_value = value.chars().all(|c| c.is_ascii_graphic() || c == ' ');
        if !valid_key || !valid_value {
            return Err(StorageError::Metadata(key.clone()));
        }
        headers.push((format!("x-amz-meta-{}", key.to_ascii_lowercase()), value.clone()));
    }
    if public_acl {
        headers.push(("x-amz-acl".to_string(), "public-read".to_string()));
    }
    Ok(headers)
}

fn public_url(base: &str, bucket: &str, key: &str) -> String {
    format!("{}/{}/{}", base.trim_end_matches('/'), bucket, key)
}

/// Client for S3-compatible object storage.
pub struct S3BlobStore {
    bucket: Box<Bucket>,
    bucket_name: String,
    public_base_url: String,
    public_acl: bool,
}

impl S3BlobStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        public_base_url: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            bucket,
            bucket_name: bucket_name.to_string(),
            public_base_url: public_base_url.to_string(),
            public_acl: false,
        })
    }

    /// Send `x-amz-acl: public-read` with each upload. Leave off for
    /// backends without object ACLs, such as R2.
    pub fn with_public_acl(mut self, public_acl: bool) -> Self {
        self.public_acl = public_acl;
        self
    }

    fn check_status(key: &str, operation: &'static str, code: u16) -> Result<(), StorageError> {
        if (200..300).contains(&code) {
            Ok(())
        } else {
            Err(StorageError::Status {
                key: key.to_string(),
                operation,
                code,
            })
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn save(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
        metadata: &Metadata,
    ) -> Result<(), StorageError> {
        let mut bucket = self.bucket.as_ref().clone();
        for (name, value) in upload_headers(metadata, self.public_acl)? {
            bucket.add_header(&name, &value);
        }

        let response = bucket
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(StorageError::S3)?;
        Self::check_status(key, "put", response.status_code())
    }

    /// Read access comes from the upload ACL or from the bucket itself;
    /// this confirms the object is in place to be served.
    async fn make_public(&self, key: &str) -> Result<(), StorageError> {
        let (_, code) = self.bucket.head_object(key).await.map_err(StorageError::S3)?;
        Self::check_status(key, "head", code)
    }

    fn public_url(&self, key: &str) -> String {
        public_url(&self.public_base_url, &self.bucket_name, key)
    }
}

/// A stored object in [`MemoryBlobStore`].
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub data: Vec<u8>,
    pub content_type: String,
    pub metadata: Metadata,
    pub public: bool,
}

/// Process-local blob store.
pub struct MemoryBlobStore {
    bucket_name: String,
    public_base_url: String,
    objects: RwLock<HashMap<String, StoredBlob>>,
}

impl MemoryBlobStore {
    pub fn new(bucket_name: &str, public_base_url: &str) -> Self {
        Self {
            bucket_name: bucket_name.to_string(),
            public_base_url: public_base_url.to_string(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<StoredBlob> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn save(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
        metadata: &Metadata,
    ) -> Result<(), StorageError> {
        self.objects.write().await.insert(
            key.to_string(),
            StoredBlob {
                data: data.to_vec(),
                content_type: content_type.to_string(),
                metadata: metadata.clone(),
                public: false,
            },
        );
        Ok(())
    }

    async fn make_public(&self, key: &str) -> Result<(), StorageError> {
        match self.objects.write().await.get_mut(key) {
            Some(blob) => {
                blob.public = true;
                Ok(())
            }
            None => Err(StorageError::NotFound(key.to_string())),
        }
    }

    fn public_url(&self, key: &str) -> String {
        public_url(&self.public_base_url, &self.bucket_name, key)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("S3 {operation} of {key} returned HTTP {code}")]
    Status {
        key: String,
        operation: &'static str,
        code: u16,
    },

    #[error("Invalid object metadata entry {0}")]
    Metadata(String),

    #[error("Object {0} not found")]
    NotFound(String),

    #[error("timeout of {}ms exceeded", .0.as_millis())]
    Timeout(std::time::Duration),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_url_joins_host_bucket_and_key() {
        assert_eq!(
            public_url("https://storage.googleapis.com/", "jobs-bucket", "processed/a.jpg"),
            "https://storage.googleapis.com/jobs-bucket/processed/a.jpg"
        );
    }

    #[test]
    fn metadata_travels_as_amz_meta_headers() {
        let metadata = vec![
            ("jobId".to_string(), "0b6c3f9e-1d2a-4c5b-9e8f-7a6b5c4d3e2f".to_string()),
            ("processedAt".to_string(), "2026-10-19T08:30:00.000Z".to_string()),
        ];

        let headers = upload_headers(&metadata, false).unwrap();
        assert_eq!(
            headers,
            vec![
                (
                    "x-amz-meta-jobid".to_string(),
                    "0b6c3f9e-1d2a-4c5b-9e8f-7a6b5c4d3e2f".to_string()
                ),
                (
                    "x-amz-meta-processedat".to_string(),
                    "2026-10-19T08:30:00.000Z".to_string()
                ),
            ]
        );

        let headers = upload_headers(&metadata, true).unwrap();
        assert_eq!(
            headers.last(),
            Some(&("x-amz-acl".to_string(), "public-read".to_string()))
        );
    }

    #[test]
    fn metadata_that_cannot_be_a_header_is_rejected() {
        let bad_key = vec![("job id".to_string(), "a".to_string())];
        assert!(matches!(upload_headers(&bad_key, false), Err(StorageError::Metadata(_))));

        let bad_value = vec![("jobId".to_string(), "line\nbreak".to_string())];
        assert!(matches!(upload_headers(&bad_value, false), Err(StorageError::Metadata(_))));
    }

    #[tokio::test]
    async fn make_public_requires_a_saved_object() {
        let store = MemoryBlobStore::new("bucket", "https://cdn.example.com");
        assert!(matches!(
            store.make_public("processed/missing.jpg").await,
            Err(StorageError::NotFound(_))
        ));

        store
            .save("processed/a.jpg", b"jpeg", "image/jpeg", &vec![("jobId".into(), "a".into())])
            .await
            .unwrap();
        store.make_public("processed/a.jpg").await.unwrap();

        let blob = store.get("processed/a.jpg").await.unwrap();
        assert!(blob.public);
        assert_eq!(blob.content_type, "image/jpeg");
        assert_eq!(store.public_url("processed/a.jpg"), "https://cdn.example.com/bucket/processed/a.jpg");
    }
}
