//! S3-compatible object storage driver
//!
//! Speaks the S3 REST API directly over the shared HTTP client with
//! SigV4 request signing and path-style addressing, so any
//! S3-compatible endpoint works. Uploads above the configured part size
//! go through the multipart protocol; payloads are streamed, never
//! signed, so every request carries `UNSIGNED-PAYLOAD`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::io::AsyncReadExt;

use super::{body_from_artifact, object_key, reader_from_response, FileStorage};
use crate::artifact::ArtifactFile;
use crate::reader::ArtifactReader;
use depot_config::{BackendConfig, StorageCredentials};
use depot_core::{Error, Result};

const BACKEND: &str = "s3";
const SERVICE: &str = "s3";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

pub struct S3Storage {
    client: reqwest::Client,
}

struct S3Params<'a> {
    endpoint: &'a str,
    region: &'a str,
    bucket: &'a str,
    access_key_id: &'a str,
    secret_access_key: &'a str,
    part_size: u64,
}

impl S3Storage {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("http client construction cannot fail"),
        }
    }

    fn params<'a>(credentials: &'a StorageCredentials) -> Result<S3Params<'a>> {
        match &credentials.backend {
            BackendConfig::S3 {
                endpoint,
                region,
                bucket,
                access_key_id,
                secret_access_key,
                part_size,
            } => Ok(S3Params {
                endpoint: endpoint.trim_end_matches('/'),
                region,
                bucket,
                access_key_id,
                secret_access_key,
                part_size: *part_size,
            }),
            other => Err(Error::config(format!(
                "credentials '{}' carry a {} backend, not s3",
                credentials.key,
                other.kind()
            ))),
        }
    }

    /// Build and sign a request. `query` must already be in canonical
    /// order (sorted by parameter name).
    fn request(
        &self,
        params: &S3Params<'_>,
        method: Method,
        key: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::RequestBuilder> {
        let path = format!("/{}/{}", params.bucket, key);
        let canonical_query = canonical_query_string(query);
        let url = if canonical_query.is_empty() {
            format!("{}{}", params.endpoint, path)
        } else {
            format!("{}{}?{}", params.endpoint, path, canonical_query)
        };

        let host = host_of(params.endpoint)?;
        let now = Utc::now();
        let authorization = sign(
            method.as_str(),
            &path,
            &canonical_query,
            &host,
            now,
            params.region,
            params.access_key_id,
            params.secret_access_key,
        );

        Ok(self
            .client
            .request(method, url)
            .header("host", host)
            .header("x-amz-date", amz_date(now))
            .header("x-amz-content-sha256", UNSIGNED_PAYLOAD)
            .header("authorization", authorization))
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        operation: &'static str,
    ) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::backend(BACKEND, operation, e.to_string()))?;
        Ok(response)
    }

    async fn put_single(
        &self,
        params: &S3Params<'_>,
        key: &str,
        artifact: &ArtifactFile,
    ) -> Result<()> {
        let body = body_from_artifact(artifact).await?;
        let request = self
            .request(params, Method::PUT, key, &[])?
            .header("content-length", artifact.size())
            .body(body);
        let response = self.send(request, "put object").await?;
        check_status(response, "put object").await?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        params: &S3Params<'_>,
        key: &str,
        artifact: &ArtifactFile,
    ) -> Result<()> {
        let request = self.request(params, Method::POST, key, &[("uploads", "")])?;
        let response = self.send(request, "initiate multipart").await?;
        let body = check_status(response, "initiate multipart")
            .await?
            .text()
            .await
            .map_err(|e| Error::backend(BACKEND, "initiate multipart", e.to_string()))?;
        let upload_id = extract_xml_tag(&body, "UploadId").ok_or_else(|| {
            Error::backend(BACKEND, "initiate multipart", "response carried no UploadId")
        })?;

        let result = self
            .upload_parts(params, key, artifact, &upload_id)
            .await;
        if result.is_err() {
            // Abort so the endpoint reclaims staged parts; the original
            // error is the one worth reporting.
            if let Ok(request) =
                self.request(params, Method::DELETE, key, &[("uploadId", &upload_id)])
            {
                let _ = self.send(request, "abort multipart").await;
            }
        }
        result
    }

    async fn upload_parts(
        &self,
        params: &S3Params<'_>,
        key: &str,
        artifact: &ArtifactFile,
        upload_id: &str,
    ) -> Result<()> {
        let mut reader = artifact.reader().await?;
        let mut etags: Vec<(u32, String)> = Vec::new();
        let mut part_number = 1u32;

        loop {
            let mut part = Vec::with_capacity(params.part_size as usize);
            let mut reached_end = false;
            while (part.len() as u64) < params.part_size {
                let want = (params.part_size as usize - part.len()).min(64 * 1024);
                let mut chunk = vec![0u8; want];
                let read = reader
                    .read(&mut chunk)
                    .await
                    .map_err(|e| Error::backend(BACKEND, "read upload part", e.to_string()))?;
                if read == 0 {
                    reached_end = true;
                    break;
                }
                part.extend_from_slice(&chunk[..read]);
            }
            if part.is_empty() {
                break;
            }

            let part_str = part_number.to_string();
            let query = [("partNumber", part_str.as_str()), ("uploadId", upload_id)];
            let request = self
                .request(params, Method::PUT, key, &query)?
                .header("content-length", part.len())
                .body(Bytes::from(part));
            let response = self.send(request, "upload part").await?;
            let response = check_status(response, "upload part").await?;
            let etag = response
                .headers()
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    Error::backend(BACKEND, "upload part", "response carried no ETag")
                })?
                .to_string();
            etags.push((part_number, etag));
            part_number += 1;

            if reached_end {
                break;
            }
        }

        let mut complete = String::from("<CompleteMultipartUpload>");
        for (number, etag) in &etags {
            complete.push_str(&format!(
                "<Part><PartNumber>{number}</PartNumber><ETag>{etag}</ETag></Part>"
            ));
        }
        complete.push_str("</CompleteMultipartUpload>");

        let request = self
            .request(params, Method::POST, key, &[("uploadId", upload_id)])?
            .header("content-type", "application/xml")
            .body(complete);
        let response = self.send(request, "complete multipart").await?;
        check_status(response, "complete multipart").await?;
        Ok(())
    }
}

impl Default for S3Storage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FileStorage for S3Storage {
    async fn store(
        &self,
        path: &str,
        name: &str,
        artifact: &ArtifactFile,
        credentials: &StorageCredentials,
    ) -> Result<bool> {
        if self.exist(path, name, credentials).await? {
            return Ok(false);
        }
        let params = Self::params(credentials)?;
        let key = object_key(path, name);
        if artifact.size() > params.part_size {
            self.put_multipart(&params, &key, artifact).await?;
        } else {
            self.put_single(&params, &key, artifact).await?;
        }
        tracing::debug!(key, size = artifact.size(), "object stored");
        Ok(true)
    }

    async fn load(
        &self,
        path: &str,
        name: &str,
        credentials: &StorageCredentials,
    ) -> Result<ArtifactReader> {
        let params = Self::params(credentials)?;
        let key = object_key(path, name);
        let request = self.request(&params, Method::GET, &key, &[])?;
        let response = self.send(request, "get object").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::not_found(name));
        }
        let response = check_status(response, "get object").await?;
        reader_from_response(response, BACKEND, credentials).await
    }

    async fn delete(
        &self,
        path: &str,
        name: &str,
        credentials: &StorageCredentials,
    ) -> Result<()> {
        let params = Self::params(credentials)?;
        let key = object_key(path, name);
        let request = self.request(&params, Method::DELETE, &key, &[])?;
        let response = self.send(request, "delete object").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response, "delete object").await?;
        Ok(())
    }

    async fn exist(
        &self,
        path: &str,
        name: &str,
        credentials: &StorageCredentials,
    ) -> Result<bool> {
        let params = Self::params(credentials)?;
        let key = object_key(path, name);
        let request = self.request(&params, Method::HEAD, &key, &[])?;
        let response = self.send(request, "head object").await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(Error::backend(
                BACKEND,
                "head object",
                format!("unexpected status {status}"),
            )),
        }
    }
}

async fn check_status(
    response: reqwest::Response,
    operation: &'static str,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::backend(
        BACKEND,
        operation,
        format!("status {status}: {}", body.chars().take(200).collect::<String>()),
    ))
}

fn host_of(endpoint: &str) -> Result<String> {
    let url = url::Url::parse(endpoint)
        .map_err(|e| Error::config(format!("invalid s3 endpoint '{endpoint}': {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::config(format!("s3 endpoint '{endpoint}' has no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn amz_date(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%SZ").to_string()
}

/// RFC 3986 encoding as SigV4 wants it
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn canonical_query_string(query: &[(&str, &str)]) -> String {
    query
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k, true), uri_encode(v, true)))
        .collect::<Vec<_>>()
        .join("&")
}

fn hmac_sha256(key: &[u8], data: &str) -> Vec<u8> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

#[allow(clippy::too_many_arguments)]
fn sign(
    method: &str,
    path: &str,
    canonical_query: &str,
    host: &str,
    now: DateTime<Utc>,
    region: &str,
    access_key_id: &str,
    secret_access_key: &str,
) -> String {
    let timestamp = amz_date(now);
    let date = now.format("%Y%m%d").to_string();
    let signed_headers = "host;x-amz-content-sha256;x-amz-date";

    let canonical_request = format!(
        "{method}\n{}\n{canonical_query}\nhost:{host}\nx-amz-content-sha256:{UNSIGNED_PAYLOAD}\nx-amz-date:{timestamp}\n\n{signed_headers}\n{UNSIGNED_PAYLOAD}",
        uri_encode(path, false)
    );

    let scope = format!("{date}/{region}/{SERVICE}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{timestamp}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = hmac_sha256(format!("AWS4{secret_access_key}").as_bytes(), &date);
    let key = hmac_sha256(&key, region);
    let key = hmac_sha256(&key, SERVICE);
    let key = hmac_sha256(&key, "aws4_request");
    let signature = hex::encode(hmac_sha256(&key, &string_to_sign));

    format!(
        "AWS4-HMAC-SHA256 Credential={access_key_id}/{scope}, SignedHeaders={signed_headers}, Signature={signature}"
    )
}

fn extract_xml_tag(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_string())
}
