//! HTTP client for a PLC directory server.

use std::collections::BTreeMap;

use async_trait::async_trait;
use civpds_types::Did;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::error::{CryptoError, CryptoResult};
use crate::plc::{DirectoryClient, DirectoryOp};

/// The public directory.
pub const DEFAULT_PLC_URL: &str = "https://plc.directory";

/// Document data served at `GET {base}/{did}/data`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DidData {
    #[serde(default)]
    verification_methods: BTreeMap<String, String>,
}

/// [`DirectoryClient`] backed by a directory server's HTTP API.
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn did_url(&self, did: &Did) -> String {
        format!("{}/{}", self.base_url, did.as_str())
    }
}

fn http_err(err: reqwest::Error) -> CryptoError {
    CryptoError::Directory(err.to_string())
}

#[async_trait]
impl DirectoryClient for HttpDirectory {
    async fn submit(&self, did: &Did, op: DirectoryOp) -> CryptoResult<()> {
        let body = serde_json::to_vec(&op.to_json())
            .map_err(|e| CryptoError::Directory(e.to_string()))?;
        let response = self
            .client
            .post(self.did_url(did))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(http_err)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CryptoError::Directory(format!(
                "submit for {did} rejected with {status}: {text}"
            )));
        }
        debug!(%did, "directory operation submitted");
        Ok(())
    }

    async fn atproto_key(&self, did: &Did) -> CryptoResult<Option<String>> {
        let response = self
            .client
            .get(format!("{}/data", self.did_url(did)))
            .send()
            .await
            .map_err(http_err)?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => return Ok(None),
            status if !status.is_success() => {
                return Err(CryptoError::Directory(format!(
                    "lookup of {did} failed with {status}"
                )))
            }
            _ => {}
        }
        let body = response.bytes().await.map_err(http_err)?;
        let data: DidData =
            serde_json::from_slice(&body).map_err(|e| CryptoError::Directory(e.to_string()))?;
        Ok(data.verification_methods.get("atproto").cloned())
    }
}
