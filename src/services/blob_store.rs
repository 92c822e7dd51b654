//! src/services/blob_store.rs
//!
//! Blob storage for segment payloads. The core only talks to the
//! [`BlobStore`] trait; [`LocalBlobStore`] keeps blobs on local disk under
//! `base_path/{key}` and hands out HMAC-signed, time-limited URLs that the
//! `/blobs/{*key}` routes verify.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut, stream};
use hmac::{Hmac, Mac};
use md5::Context;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{
    fmt, io,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_BLOB_KEY_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("invalid blob key `{0}`")]
    InvalidKey(String),
    #[error("blob `{0}` already exists")]
    AlreadyExists(String),
    #[error("presigned url rejected: {0}")]
    InvalidSignature(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// What a presigned URL allows its holder to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobOperation {
    Get,
    Put,
}

impl fmt::Display for BlobOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlobOperation::Get => "get",
            BlobOperation::Put => "put",
        })
    }
}

/// Outcome of a successful write.
#[derive(Debug, Clone)]
pub struct BlobReceipt {
    pub size: i64,
    pub etag: String,
}

/// Key/value blob storage consumed by the segment and object services.
///
/// `put` never overwrites: a key that already holds a blob is refused with
/// [`BlobError::AlreadyExists`]. `delete` tolerates repeated calls.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: Option<&str>,
    ) -> BlobResult<BlobReceipt>;

    async fn get(&self, key: &str) -> BlobResult<Bytes>;

    /// Remove a blob. Missing blobs are not an error.
    async fn delete(&self, key: &str) -> BlobResult<()>;

    /// Build a URL granting `operation` on `key` until `ttl` elapses.
    fn presigned_url(
        &self,
        key: &str,
        operation: BlobOperation,
        ttl: Duration,
    ) -> BlobResult<String>;
}

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies `(operation, key, expires)` triples.
#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
}

impl UrlSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self, operation: BlobOperation, key: &str, expires: i64) -> BlobResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| BlobError::InvalidSignature("signing key rejected"))?;
        mac.update(format!("{}\n{}\n{}", operation, key, expires).as_bytes());
        Ok(mac)
    }

    fn sign(&self, operation: BlobOperation, key: &str, expires: i64) -> BlobResult<String> {
        let tag = self.mac(operation, key, expires)?.finalize().into_bytes();
        Ok(URL_SAFE_NO_PAD.encode(tag))
    }

    fn verify(
        &self,
        operation: BlobOperation,
        key: &str,
        expires: i64,
        signature: &str,
        now: i64,
    ) -> BlobResult<()> {
        if expires < now {
            return Err(BlobError::InvalidSignature("url expired"));
        }
        let tag = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| BlobError::InvalidSignature("malformed signature"))?;
        self.mac(operation, key, expires)?
            .verify_slice(&tag)
            .map_err(|_| BlobError::InvalidSignature("signature mismatch"))
    }
}

/// Blob store on the local filesystem.
#[derive(Clone)]
pub struct LocalBlobStore {
    /// Directory all blob keys are resolved against.
    pub base_path: PathBuf,

    /// Public origin presigned URLs are built on, e.g. `http://127.0.0.1:3000`.
    base_url: String,

    signer: UrlSigner,
}

impl LocalBlobStore {
    pub fn new(
        base_path: impl Into<PathBuf>,
        base_url: impl Into<String>,
        signer: UrlSigner,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            base_url: base_url.into(),
            signer,
        }
    }

    /// Reject keys that could escape `base_path`.
    fn ensure_key_safe(&self, key: &str) -> BlobResult<()> {
        let invalid = key.is_empty()
            || key.len() > MAX_BLOB_KEY_LEN
            || key.starts_with('/')
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if invalid {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn blob_path(&self, key: &str) -> BlobResult<PathBuf> {
        self.ensure_key_safe(key)?;
        Ok(self.base_path.join(key))
    }

    /// Stream a payload to disk under `key`, replacing any existing blob.
    ///
    /// Only for keys the caller has claimed exclusively, such as an object
    /// whose upload slot it holds.
    pub async fn put_stream<S>(&self, key: &str, stream: S) -> BlobResult<BlobReceipt>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.write_stream(key, stream, false).await
    }

    /// Bytes go to a temporary file that is fsynced and then moved to the
    /// final path, so readers never observe a partial blob. With `exclusive`
    /// the move is a hard link, which fails if the key already exists.
    async fn write_stream<S>(
        &self,
        key: &str,
        stream: S,
        exclusive: bool,
    ) -> BlobResult<BlobReceipt>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let file_path = self.blob_path(key)?;
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| BlobError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(BlobError::Io(err));
                }
            };
            size += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BlobError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BlobError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BlobError::Io(err));
        }

        if exclusive {
            let linked = fs::hard_link(&tmp_path, &file_path).await;
            let _ = fs::remove_file(&tmp_path).await;
            match linked {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    return Err(BlobError::AlreadyExists(key.to_string()));
                }
                Err(err) => return Err(BlobError::Io(err)),
            }
        } else if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BlobError::Io(err));
            }
        }

        let etag = format!("{:x}", digest.compute());
        debug!(key, size, %etag, "stored blob");
        Ok(BlobReceipt { size, etag })
    }

    /// Open a blob for streaming out.
    pub async fn open(&self, key: &str) -> BlobResult<File> {
        let path = self.blob_path(key)?;
        File::open(&path).await.map_err(|err| not_found_or_io(err, key))
    }

    /// Check a presigned URL's query parameters against `key`.
    pub fn verify_presigned(
        &self,
        key: &str,
        operation: BlobOperation,
        expires: i64,
        signature: &str,
    ) -> BlobResult<()> {
        self.signer
            .verify(operation, key, expires, signature, Utc::now().timestamp())
    }

    /// Remove empty directories from `start` up to, but excluding, `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

fn not_found_or_io(err: io::Error, key: &str) -> BlobError {
    if err.kind() == ErrorKind::NotFound {
        BlobError::NotFound(key.to_string())
    } else {
        BlobError::Io(err)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: Option<&str>,
    ) -> BlobResult<BlobReceipt> {
        debug!(key, content_type, "writing blob");
        self.write_stream(key, stream::once(async move { Ok(bytes) }), true)
            .await
    }

    async fn get(&self, key: &str) -> BlobResult<Bytes> {
        let path = self.blob_path(key)?;
        let data = fs::read(&path)
            .await
            .map_err(|err| not_found_or_io(err, key))?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        let path = self.blob_path(key)?;
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed blob file {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob file {} already missing", path.display());
            }
            Err(err) => return Err(BlobError::Io(err)),
        }

        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent, &self.base_path).await;
        }
        Ok(())
    }

    fn presigned_url(
        &self,
        key: &str,
        operation: BlobOperation,
        ttl: Duration,
    ) -> BlobResult<String> {
        self.ensure_key_safe(key)?;
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let signature = self.signer.sign(operation, key, expires)?;
        Ok(format!(
            "{}/blobs/{}?op={}&expires={}&signature={}",
            self.base_url.trim_end_matches('/'),
            key,
            operation,
            expires,
            signature
        ))
    }
}
