//! HDFS driver over the WebHDFS REST gateway
//!
//! Two-step transfers as WebHDFS specifies: the namenode is asked with
//! `noredirect=true` and answers with the datanode location, then the
//! data moves against that location. Namenodes are configured as an HA
//! list; the active index is remembered so the standby is only probed
//! after a failure.

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{body_from_artifact, object_key, reader_from_response, FileStorage};
use crate::artifact::ArtifactFile;
use crate::reader::ArtifactReader;
use depot_config::{BackendConfig, StorageCredentials};
use depot_core::{Error, Result};

const BACKEND: &str = "hdfs";

pub struct HdfsStorage {
    client: reqwest::Client,
    active_namenode: AtomicUsize,
}

struct HdfsParams<'a> {
    name_nodes: &'a [String],
    user: &'a str,
    root: &'a str,
}

#[derive(Deserialize)]
struct RedirectLocation {
    #[serde(rename = "Location")]
    location: String,
}

#[derive(Deserialize)]
struct BooleanResponse {
    boolean: bool,
}

impl HdfsStorage {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("http client construction cannot fail"),
            active_namenode: AtomicUsize::new(0),
        }
    }

    fn params<'a>(credentials: &'a StorageCredentials) -> Result<HdfsParams<'a>> {
        match &credentials.backend {
            BackendConfig::Hdfs {
                name_nodes,
                user,
                root,
            } => {
                if name_nodes.is_empty() {
                    return Err(Error::config(format!(
                        "credentials '{}' list no hdfs namenodes",
                        credentials.key
                    )));
                }
                Ok(HdfsParams {
                    name_nodes,
                    user,
                    root: root.trim_end_matches('/'),
                })
            }
            other => Err(Error::config(format!(
                "credentials '{}' carry a {} backend, not hdfs",
                credentials.key,
                other.kind()
            ))),
        }
    }

    fn file_url(params: &HdfsParams<'_>, namenode: &str, key: &str, op: &str) -> String {
        format!(
            "{}/webhdfs/v1{}/{}?op={}&user.name={}&noredirect=true",
            namenode.trim_end_matches('/'),
            params.root,
            key,
            op,
            params.user
        )
    }

    /// Issue a namenode request, failing over through the HA list.
    ///
    /// A connect failure or a standby rejection moves on to the next
    /// namenode; the index that answered is remembered for next time.
    /// Only body-less namenode requests go through here, data transfers
    /// hit the returned datanode location directly.
    async fn namenode_request(
        &self,
        params: &HdfsParams<'_>,
        method: Method,
        key: &str,
        op: &str,
        operation: &'static str,
    ) -> Result<reqwest::Response> {
        let count = params.name_nodes.len();
        let start = self.active_namenode.load(Ordering::Relaxed) % count;
        let mut last_error = None;

        for offset in 0..count {
            let index = (start + offset) % count;
            let namenode = &params.name_nodes[index];
            let url = Self::file_url(params, namenode, key, op);

            match self.client.request(method.clone(), &url).send().await {
                Ok(response) if response.status() == StatusCode::FORBIDDEN => {
                    // Standby namenodes answer 403 with a StandbyException body
                    tracing::warn!(namenode, "namenode rejected request, trying next");
                    last_error = Some(Error::backend(
                        BACKEND,
                        operation,
                        format!("namenode '{namenode}' is not active"),
                    ));
                }
                Ok(response) => {
                    self.active_namenode.store(index, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(e) => {
                    tracing::warn!(namenode, error = %e, "namenode unreachable, trying next");
                    last_error = Some(Error::backend(BACKEND, operation, e.to_string()));
                }
            }
        }

        Err(last_error.expect("at least one namenode was tried"))
    }

    async fn redirect_location(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<String> {
        let response = check_status(response, operation).await?;
        let redirect: RedirectLocation = response
            .json()
            .await
            .map_err(|e| Error::backend(BACKEND, operation, e.to_string()))?;
        Ok(redirect.location)
    }
}

impl Default for HdfsStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FileStorage for HdfsStorage {
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

        let response = self
            .namenode_request(
                &params,
                Method::PUT,
                &key,
                "CREATE&overwrite=true",
                "create file",
            )
            .await?;
        let location = Self::redirect_location(response, "create file").await?;

        let body = body_from_artifact(artifact).await?;
        let response = self
            .client
            .put(&location)
            .header("content-length", artifact.size())
            .body(body)
            .send()
            .await
            .map_err(|e| Error::backend(BACKEND, "write file", e.to_string()))?;
        check_status(response, "write file").await?;
        tracing::debug!(key, size = artifact.size(), "file stored");
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

        let response = self
            .namenode_request(&params, Method::GET, &key, "OPEN", "open file")
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::not_found(name));
        }
        let location = Self::redirect_location(response, "open file").await?;

        let response = self
            .client
            .get(&location)
            .send()
            .await
            .map_err(|e| Error::backend(BACKEND, "read file", e.to_string()))?;
        let response = check_status(response, "read file").await?;
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

        let response = self
            .namenode_request(&params, Method::DELETE, &key, "DELETE", "delete file")
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let response = check_status(response, "delete file").await?;
        // WebHDFS reports an already-absent path as boolean=false
        let outcome: BooleanResponse = response
            .json()
            .await
            .map_err(|e| Error::backend(BACKEND, "delete file", e.to_string()))?;
        if !outcome.boolean {
            tracing::debug!(key, "path was already absent");
        }
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

        let response = self
            .namenode_request(&params, Method::GET, &key, "GETFILESTATUS", "stat file")
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(Error::backend(
                BACKEND,
                "stat file",
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
