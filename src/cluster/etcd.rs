//! etcd (v2 API) implementation of the watched key-value store.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use crate::cluster::store::{
    ClusterStore, StoreError, StoreNode, StoreResponse, StoreUpdate, UpdateKind,
};

const WATCH_TIMEOUT: Duration = Duration::from_secs(60);

pub struct EtcdStore {
    client: reqwest::Client,
    base_url: String,
}

impl EtcdStore {
    pub fn new(host: &str, port: u16) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            base_url: format!("http://{host}:{port}/v2/keys"),
        })
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }

    async fn parse_response(
        response: reqwest::Response,
    ) -> Result<(Value, i64), StoreError> {
        let status = response.status();
        let store_id = response
            .headers()
            .get("x-etcd-index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(-1);
        let body: Value = response
            .json()
            .await
            .map_err(|e| StoreError::Server(e.to_string()))?;
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound);
        }
        if let Some(error_code) = body.get("errorCode").and_then(|v| v.as_i64()) {
            // 401: the requested watch index was cleared from the event log.
            if error_code == 401 {
                return Err(StoreError::WaitIdOutdated);
            }
            return Err(StoreError::Server(format!(
                "etcd error {error_code}: {}",
                body.get("message").and_then(|v| v.as_str()).unwrap_or("")
            )));
        }
        if !status.is_success() {
            return Err(StoreError::Server(format!("http status {status}")));
        }
        Ok((body, store_id))
    }

    fn parse_node(value: &Value) -> StoreNode {
        StoreNode {
            key: value
                .get("key")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            value: value
                .get("value")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            nodes: value
                .get("nodes")
                .and_then(|v| v.as_array())
                .map(|nodes| nodes.iter().map(Self::parse_node).collect())
                .unwrap_or_default(),
            is_dir: value.get("dir").and_then(|v| v.as_bool()).unwrap_or(false),
            modified_id: value
                .get("modifiedIndex")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
        }
    }

    fn map_send_error(e: reqwest::Error) -> StoreError {
        if e.is_connect() || e.is_timeout() {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Server(e.to_string())
        }
    }
}

#[async_trait]
impl ClusterStore for EtcdStore {
    async fn get(&self, key: &str, recursive: bool) -> Result<StoreResponse, StoreError> {
        let mut url = self.key_url(key);
        if recursive {
            url.push_str("?recursive=true");
        }
        debug!("etcd get {url}");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let (body, store_id) = Self::parse_response(response).await?;
        let node = body
            .get("node")
            .map(Self::parse_node)
            .ok_or_else(|| StoreError::Server("response carries no node".to_string()))?;
        Ok(StoreResponse { node, store_id })
    }

    async fn watch(&self, key: &str, after_id: i64) -> Result<StoreUpdate, StoreError> {
        let mut url = format!("{}?wait=true&recursive=true", self.key_url(key));
        if after_id > 0 {
            url.push_str(&format!("&waitIndex={after_id}"));
        }
        debug!("etcd watch {url}");
        let response = self
            .client
            .get(url)
            .timeout(WATCH_TIMEOUT)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let (body, _) = Self::parse_response(response).await?;
        let action = body.get("action").and_then(|v| v.as_str()).unwrap_or("");
        let node = body
            .get("node")
            .map(Self::parse_node)
            .ok_or_else(|| StoreError::Server("update carries no node".to_string()))?;
        let kind = match action {
            "delete" | "expire" | "compareAndDelete" => UpdateKind::Remove,
            _ => UpdateKind::Set,
        };
        Ok(StoreUpdate { kind, node })
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        refresh: bool,
    ) -> Result<(), StoreError> {
        let mut form: Vec<(&str, String)> = Vec::new();
        if refresh {
            form.push(("refresh", "true".to_string()));
            form.push(("prevExist", "true".to_string()));
        } else {
            form.push(("value", value.to_string()));
        }
        if let Some(ttl) = ttl {
            form.push(("ttl", ttl.as_secs().to_string()));
        }
        let response = self
            .client
            .put(self.key_url(key))
            .form(&form)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        Self::parse_response(response).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .delete(self.key_url(key))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        Self::parse_response(response).await?;
        Ok(())
    }
}
