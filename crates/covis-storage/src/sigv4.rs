//! AWS Signature Version 4 for S3-compatible endpoints such as `MinIO`.
//!
//! # Design
//! - Only header signing is supported; presigned query strings are not.
//! - Signed headers are `host`, `x-amz-content-sha256`, `x-amz-date`, plus any
//!   extra headers the caller passes in.
//! - Uploads send `UNSIGNED-PAYLOAD` so multi-gigabyte archives are not read twice.

use std::fmt;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{StorageError, StorageResult};

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 of an empty body.
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
/// Payload hash placeholder for streamed uploads.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
/// Region assumed when none is configured; `MinIO` answers to it by default.
pub const DEFAULT_REGION: &str = "us-east-1";

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";

/// Access key pair plus signing region.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key: String,
    secret_key: String,
    region: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

/// Headers to attach to a signed request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    /// `Authorization` value.
    pub authorization: String,
    /// `x-amz-date` value.
    pub amz_date: String,
    /// `x-amz-content-sha256` value.
    pub content_sha256: String,
}

impl Credentials {
    /// Credentials for [`DEFAULT_REGION`].
    #[must_use]
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: DEFAULT_REGION.to_string(),
        }
    }

    /// Access key identifier.
    #[must_use]
    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    /// Sign a request for `url` made at `at`.
    ///
    /// `headers` are extra `(name, value)` pairs that will be sent and must be
    /// covered by the signature.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Signing`] when the URL has no host or the MAC
    /// cannot be keyed.
    pub fn sign(
        &self,
        method: &str,
        url: &Url,
        headers: &[(&str, &str)],
        payload_sha256: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<SignedHeaders> {
        let amz_date = at.format("%Y%m%dT%H%M%SZ").to_string();
        let day = at.format("%Y%m%d").to_string();
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(StorageError::Signing),
        };

        let mut canonical: Vec<(String, String)> = vec![
            ("host".to_string(), host),
            ("x-amz-content-sha256".to_string(), payload_sha256.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        canonical.extend(
            headers
                .iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string())),
        );
        canonical.sort();
        let signed_headers = canonical
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let header_block: String = canonical
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();

        let request = format!(
            "{method}\n{path}\n{query}\n{header_block}\n{signed_headers}\n{payload_sha256}",
            path = url.path(),
            query = canonical_query(url),
        );
        let scope = format!("{day}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(request.as_bytes()))
        );

        let key = [day.as_str(), self.region.as_str(), SERVICE, "aws4_request"]
            .iter()
            .try_fold(format!("AWS4{}", self.secret_key).into_bytes(), |key, part| {
                hmac(&key, part.as_bytes())
            })?;
        let signature = hex::encode(hmac(&key, string_to_sign.as_bytes())?);

        Ok(SignedHeaders {
            authorization: format!(
                "{ALGORITHM} Credential={}/{scope},SignedHeaders={signed_headers},\
                 Signature={signature}",
                self.access_key
            ),
            amz_date,
            content_sha256: payload_sha256.to_string(),
        })
    }
}

/// Percent-encode `segment` with the unreserved set S3 expects.
#[must_use]
pub fn uri_encode(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| (uri_encode(&key), uri_encode(&value)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn hmac(key: &[u8], data: &[u8]) -> StorageResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| StorageError::Signing)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
