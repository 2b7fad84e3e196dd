//! Proprietary object store driver
//!
//! A COS-style HTTP object API with per-request HMAC-SHA1 signing. Each
//! request carries a signature valid only inside a time window derived
//! from the configured expiry, so captured requests go stale quickly.

use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha1::{Digest, Sha1};
use std::time::Duration;

use super::{body_from_artifact, object_key, reader_from_response, FileStorage};
use crate::artifact::ArtifactFile;
use crate::reader::ArtifactReader;
use depot_config::{BackendConfig, StorageCredentials};
use depot_core::{Error, Result};

const BACKEND: &str = "object_store";

pub struct CosStorage {
    client: reqwest::Client,
}

struct CosParams<'a> {
    endpoint: &'a str,
    bucket: &'a str,
    secret_id: &'a str,
    secret_key: &'a str,
    sign_expiry: Duration,
}

impl CosStorage {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("http client construction cannot fail"),
        }
    }

    fn params<'a>(credentials: &'a StorageCredentials) -> Result<CosParams<'a>> {
        match &credentials.backend {
            BackendConfig::ObjectStore {
                endpoint,
                bucket,
                secret_id,
                secret_key,
                sign_expiry,
            } => Ok(CosParams {
                endpoint: endpoint.trim_end_matches('/'),
                bucket,
                secret_id,
                secret_key,
                sign_expiry: *sign_expiry,
            }),
            other => Err(Error::config(format!(
                "credentials '{}' carry a {} backend, not object_store",
                credentials.key,
                other.kind()
            ))),
        }
    }

    fn request(
        &self,
        params: &CosParams<'_>,
        method: Method,
        key: &str,
    ) -> reqwest::RequestBuilder {
        let path = format!("/{}/{}", params.bucket, key);
        let url = format!("{}{}", params.endpoint, path);
        let now = Utc::now().timestamp();
        let authorization = sign(
            method.as_str(),
            &path,
            params.secret_id,
            params.secret_key,
            now,
            now + params.sign_expiry.as_secs() as i64,
        );
        self.client
            .request(method, url)
            .header("authorization", authorization)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        operation: &'static str,
    ) -> Result<reqwest::Response> {
        request
            .send()
            .await
            .map_err(|e| Error::backend(BACKEND, operation, e.to_string()))
    }
}

impl Default for CosStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FileStorage for CosStorage {
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

        let body = body_from_artifact(artifact).await?;
        let request = self
            .request(&params, Method::PUT, &key)
            .header("content-length", artifact.size())
            .body(body);
        let response = self.send(request, "put object").await?;
        check_status(response, "put object").await?;
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
        let request = self.request(&params, Method::GET, &key);
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
        let request = self.request(&params, Method::DELETE, &key);
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
        let request = self.request(&params, Method::HEAD, &key);
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

fn hmac_sha1(key: &[u8], data: &str) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Time-boxed q-sign signature over the method and path
fn sign(
    method: &str,
    path: &str,
    secret_id: &str,
    secret_key: &str,
    start: i64,
    end: i64,
) -> String {
    let key_time = format!("{start};{end}");
    let sign_key = hmac_sha1(secret_key.as_bytes(), &key_time);

    let http_string = format!("{}\n{path}\n\n\n", method.to_lowercase());
    let string_to_sign = format!(
        "sha1\n{key_time}\n{}\n",
        hex::encode(Sha1::digest(http_string.as_bytes()))
    );
    let signature = hmac_sha1(sign_key.as_bytes(), &string_to_sign);

    format!(
        "q-sign-algorithm=sha1&q-ak={secret_id}&q-sign-time={key_time}&q-key-time={key_time}&q-header-list=&q-url-param-list=&q-signature={signature}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials(endpoint: &str, staging: &std::path::Path) -> StorageCredentials {
        StorageCredentials {
            key: "cos-test".into(),
            backend: BackendConfig::ObjectStore {
                endpoint: endpoint.into(),
                bucket: "blobs".into(),
                secret_id: "id".into(),
                secret_key: "key".into(),
                sign_expiry: Duration::from_secs(600),
            },
            cache: Default::default(),
            upload: depot_config::UploadSettings {
                location: staging.to_path_buf(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn signature_carries_the_validity_window() {
        let auth = sign("GET", "/blobs/ab/cd/hash", "id", "key", 1000, 1600);
        assert!(auth.starts_with("q-sign-algorithm=sha1&q-ak=id&q-sign-time=1000;1600"));
        assert!(auth.contains("q-key-time=1000;1600"));
        assert!(auth.contains("&q-signature="));

        // The same window signs deterministically, a different window
        // changes the signature.
        assert_eq!(auth, sign("GET", "/blobs/ab/cd/hash", "id", "key", 1000, 1600));
        assert_ne!(auth, sign("GET", "/blobs/ab/cd/hash", "id", "key", 1001, 1601));
    }

    #[test]
    fn signature_depends_on_method_and_path() {
        let get = sign("GET", "/blobs/a", "id", "key", 1000, 1600);
        let put = sign("PUT", "/blobs/a", "id", "key", 1000, 1600);
        let other = sign("GET", "/blobs/b", "id", "key", 1000, 1600);
        assert_ne!(get, put);
        assert_ne!(get, other);
    }

    #[tokio::test]
    async fn round_trip_against_a_mock_endpoint() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let creds = credentials(&server.uri(), dir.path());
        let storage = CosStorage::new();

        Mock::given(method("HEAD"))
            .and(path("/blobs/ab/cd/hash"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/blobs/ab/cd/hash"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/blobs/ab/cd/hash"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"object content".to_vec()))
            .mount(&server)
            .await;

        let artifact = ArtifactFile::from_bytes(&b"object content"[..], dir.path());
        assert!(storage.store("ab/cd", "hash", &artifact, &creds).await.unwrap());

        let reader = storage.load("ab/cd", "hash", &creds).await.unwrap();
        assert_eq!(reader.read_to_vec().await.unwrap(), b"object content");
    }

    #[tokio::test]
    async fn delete_tolerates_missing_objects() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let creds = credentials(&server.uri(), dir.path());
        let storage = CosStorage::new();

        Mock::given(method("DELETE"))
            .and(path("/blobs/ab/cd/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        storage.delete("ab/cd", "gone", &creds).await.unwrap();
    }
}
