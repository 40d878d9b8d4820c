//! Storage backends addressed by slash-separated object paths.
//!
//! # Design
//! - `file://` endpoints map object paths onto a directory tree; `http(s)://`
//!   endpoints speak the S3 API path-style (`<base>/<bucket>/<key>`), signed
//!   with SigV4 when credentials are configured and anonymous otherwise.
//! - Object paths are sanitised; `..` and absolute segments are rejected.
//! - Server errors and connection failures are reported as transient so the
//!   worker can redeliver the task.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use covis_config::Endpoint;
use covis_core::{CoreResult, ObjectStore};
use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH};
use reqwest::{Body, Client, Method, RequestBuilder, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::error::{StorageError, StorageResult};
use crate::sigv4::{Credentials, EMPTY_PAYLOAD_SHA256, UNSIGNED_PAYLOAD, uri_encode};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Concrete storage endpoint.
#[derive(Debug, Clone)]
pub enum StorageBackend {
    /// Directory tree on a mounted filesystem.
    Filesystem {
        /// Root directory.
        root: PathBuf,
    },
    /// S3-compatible endpoint addressed path-style.
    S3 {
        /// Shared client.
        client: Client,
        /// Base URL, always ending in `/`.
        base: Url,
        /// Signing credentials; requests are anonymous without them.
        credentials: Option<Credentials>,
    },
}

impl StorageBackend {
    /// Backend rooted at `root`.
    #[must_use]
    pub fn filesystem(root: impl Into<PathBuf>) -> Self {
        Self::Filesystem { root: root.into() }
    }

    /// Build a backend from configured connection details.
    ///
    /// # Errors
    ///
    /// Returns an error for unparsable URLs, unsupported schemes, or when the
    /// HTTP client cannot be built.
    pub fn from_endpoint(endpoint: &Endpoint) -> StorageResult<Self> {
        let url = Url::parse(&endpoint.url).map_err(|source| StorageError::InvalidUrl {
            value: endpoint.url.clone(),
            source,
        })?;
        match url.scheme() {
            "file" => Ok(Self::filesystem(url.path())),
            "http" | "https" => {
                let client = Client::builder()
                    .timeout(REQUEST_TIMEOUT)
                    .connect_timeout(CONNECT_TIMEOUT)
                    .build()
                    .map_err(|source| StorageError::Client { source })?;
                let credentials = endpoint
                    .access_key
                    .clone()
                    .zip(endpoint.secret_key.clone())
                    .map(|(access, secret)| Credentials::new(access, secret));
                Ok(Self::s3(client, url, credentials))
            }
            other => Err(StorageError::UnsupportedScheme {
                scheme: other.to_string(),
            }),
        }
    }

    /// S3 backend over `base`.
    #[must_use]
    pub fn s3(client: Client, mut base: Url, credentials: Option<Credentials>) -> Self {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self::S3 {
            client,
            base,
            credentials,
        }
    }

    /// Copy the object at `object` to the local file `dest`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] for missing objects and transport or
    /// IO errors otherwise.
    pub async fn download(&self, object: &str, dest: &Path) -> StorageResult<()> {
        match self {
            Self::Filesystem { root } => {
                let source = resolve_local(root, object)?;
                if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
                    return Err(StorageError::NotFound {
                        location: source.display().to_string(),
                    });
                }
                ensure_parent(dest).await?;
                tokio::fs::copy(&source, dest)
                    .await
                    .map_err(|err| StorageError::io("storage.download", &source, err))?;
            }
            Self::S3 {
                client,
                base,
                credentials,
            } => {
                let url = join(base, object)?;
                let response = signed(client, Method::GET, &url, credentials.as_ref(), None)?
                    .send()
                    .await
                    .map_err(|source| http_error("storage.download", &url, source))?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Err(StorageError::NotFound {
                        location: url.to_string(),
                    });
                }
                check_status("storage.download", &url, response.status())?;

                ensure_parent(dest).await?;
                let mut file = tokio::fs::File::create(dest)
                    .await
                    .map_err(|err| StorageError::io("storage.download", dest, err))?;
                let mut body = response.bytes_stream();
                while let Some(chunk) = body.next().await {
                    let chunk =
                        chunk.map_err(|source| http_error("storage.download", &url, source))?;
                    file.write_all(&chunk)
                        .await
                        .map_err(|err| StorageError::io("storage.download", dest, err))?;
                }
                file.flush()
                    .await
                    .map_err(|err| StorageError::io("storage.download", dest, err))?;
            }
        }
        debug!(object, dest = %dest.display(), "downloaded object");
        Ok(())
    }

    /// Copy the local file `src` to `object`.
    ///
    /// # Errors
    ///
    /// Returns transport or IO errors.
    pub async fn upload(&self, object: &str, src: &Path) -> StorageResult<()> {
        match self {
            Self::Filesystem { root } => {
                let target = resolve_local(root, object)?;
                ensure_parent(&target).await?;
                tokio::fs::copy(src, &target)
                    .await
                    .map_err(|err| StorageError::io("storage.upload", &target, err))?;
            }
            Self::S3 {
                client,
                base,
                credentials,
            } => {
                let url = join(base, object)?;
                let file = tokio::fs::File::open(src)
                    .await
                    .map_err(|err| StorageError::io("storage.upload", src, err))?;
                let length = file
                    .metadata()
                    .await
                    .map_err(|err| StorageError::io("storage.upload", src, err))?
                    .len();
                let response = signed(
                    client,
                    Method::PUT,
                    &url,
                    credentials.as_ref(),
                    Some(UNSIGNED_PAYLOAD),
                )?
                .header(CONTENT_LENGTH, length)
                .body(Body::from(file))
                .send()
                .await
                .map_err(|source| http_error("storage.upload", &url, source))?;
                check_status("storage.upload", &url, response.status())?;
            }
        }
        info!(object, src = %src.display(), "uploaded object");
        Ok(())
    }

    /// Whether the container `name` exists.
    ///
    /// # Errors
    ///
    /// Returns transport errors.
    pub async fn container_exists(&self, name: &str) -> StorageResult<bool> {
        match self {
            Self::Filesystem { root } => {
                let dir = resolve_local(root, name)?;
                Ok(tokio::fs::metadata(&dir)
                    .await
                    .is_ok_and(|meta| meta.is_dir()))
            }
            Self::S3 {
                client,
                base,
                credentials,
            } => {
                let url = join(base, name)?;
                let response = signed(client, Method::HEAD, &url, credentials.as_ref(), None)?
                    .send()
                    .await
                    .map_err(|source| http_error("storage.exists", &url, source))?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(false);
                }
                check_status("storage.exists", &url, response.status())?;
                Ok(true)
            }
        }
    }

    /// Create the container `name`.
    ///
    /// # Errors
    ///
    /// Returns transport or IO errors.
    pub async fn create_container(&self, name: &str) -> StorageResult<()> {
        match self {
            Self::Filesystem { root } => {
                let dir = resolve_local(root, name)?;
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|err| StorageError::io("storage.create_container", &dir, err))
            }
            Self::S3 {
                client,
                base,
                credentials,
            } => {
                let url = join(base, name)?;
                let response = signed(client, Method::PUT, &url, credentials.as_ref(), None)?
                    .send()
                    .await
                    .map_err(|source| http_error("storage.create_container", &url, source))?;
                check_status("storage.create_container", &url, response.status())
            }
        }
    }
}

#[async_trait]
impl ObjectStore for StorageBackend {
    async fn get(&self, bucket: &str, key: &str, dest: &Path) -> CoreResult<()> {
        Ok(self.download(&object_path(bucket, key), dest).await?)
    }

    async fn put(&self, bucket: &str, key: &str, src: &Path) -> CoreResult<()> {
        Ok(self.upload(&object_path(bucket, key), src).await?)
    }

    async fn bucket_exists(&self, bucket: &str) -> CoreResult<bool> {
        Ok(self.container_exists(bucket).await?)
    }

    async fn make_bucket(&self, bucket: &str) -> CoreResult<()> {
        Ok(self.create_container(bucket).await?)
    }
}

fn object_path(bucket: &str, key: &str) -> String {
    format!("{bucket}/{}", key.trim_start_matches('/'))
}

fn sanitize(object: &str) -> StorageResult<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(object.trim_start_matches('/')).components() {
        match component {
            Component::Normal(segment) => clean.push(segment),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::NotFound {
                    location: object.to_string(),
                });
            }
        }
    }
    Ok(clean)
}

fn resolve_local(root: &Path, object: &str) -> StorageResult<PathBuf> {
    Ok(root.join(sanitize(object)?))
}

fn join(base: &Url, object: &str) -> StorageResult<Url> {
    let clean = sanitize(object)?;
    let relative = clean
        .components()
        .map(|component| uri_encode(&component.as_os_str().to_string_lossy()))
        .collect::<Vec<_>>()
        .join("/");
    let mut url = base.clone();
    url.set_path(&format!("{}{relative}", base.path()));
    Ok(url)
}

/// Request builder for `url`, carrying SigV4 headers when `credentials` are set.
///
/// `payload_sha256` defaults to the hash of an empty body.
fn signed(
    client: &Client,
    method: Method,
    url: &Url,
    credentials: Option<&Credentials>,
    payload_sha256: Option<&str>,
) -> StorageResult<RequestBuilder> {
    let Some(credentials) = credentials else {
        return Ok(client.request(method, url.clone()));
    };
    let payload_sha256 = payload_sha256.unwrap_or(EMPTY_PAYLOAD_SHA256);
    let headers = credentials.sign(method.as_str(), url, &[], payload_sha256, Utc::now())?;
    Ok(client
        .request(method, url.clone())
        .header("x-amz-date", headers.amz_date)
        .header("x-amz-content-sha256", headers.content_sha256)
        .header(AUTHORIZATION, headers.authorization))
}

fn http_error(operation: &'static str, url: &Url, source: reqwest::Error) -> StorageError {
    StorageError::Http {
        operation,
        url: url.to_string(),
        source,
    }
}

fn check_status(operation: &'static str, url: &Url, status: StatusCode) -> StorageResult<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(StorageError::Status {
            operation,
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

async fn ensure_parent(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| StorageError::io("storage.prepare_parent", parent, err))?;
    }
    Ok(())
}
