//! HTTP client for a node's public API

use crate::common::{Error, Result};
use crate::node::membership::JoinRequest;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Body of `GET /raft`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RaftStatus {
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Node")]
    pub node: String,
}

pub struct NodeClient {
    base: String,
    client: reqwest::Client,
}

impl NodeClient {
    /// `node` is a `host:port` or a full `http://` URL.
    pub fn new(node: &str) -> Result<Self> {
        let base = if node.starts_with("http://") || node.starts_with("https://") {
            node.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", node)
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { base, client })
    }

    pub async fn get(&self, key: &str) -> Result<String> {
        let resp = self
            .client
            .get(format!("{}/key/{}", self.base, key))
            .send()
            .await?;
        let resp = check(resp).await?;
        let mut body: HashMap<String, String> = resp.json().await?;
        Ok(body.remove(key).unwrap_or_default())
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_many(&BTreeMap::from([(key.to_string(), value.to_string())]))
            .await
    }

    pub async fn set_many(&self, pairs: &BTreeMap<String, String>) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/key", self.base))
            .json(pairs)
            .send()
            .await?;
        check(resp).await.map(|_| ())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let resp = self
            .client
            .delete(format!("{}/key/{}", self.base, key))
            .send()
            .await?;
        check(resp).await.map(|_| ())
    }

    pub async fn join(&self, id: &str, raft_addr: &str) -> Result<()> {
        let body = JoinRequest {
            addr: raft_addr.to_string(),
            id: id.to_string(),
        };
        let resp = self
            .client
            .post(format!("{}/join", self.base))
            .json(&body)
            .send()
            .await?;
        check(resp).await.map(|_| ())
    }

    pub async fn status(&self) -> Result<RaftStatus> {
        let resp = self
            .client
            .get(format!("{}/raft", self.base))
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(format!("{}/health", self.base))
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::METHOD_NOT_ALLOWED => Error::NotLeader("unknown".into()),
        StatusCode::BAD_REQUEST => Error::InvalidRequest(body),
        _ => Error::Http(format!("{}: {}", status, body)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalization() {
        assert_eq!(NodeClient::new("127.0.0.1:11000").unwrap().base, "http://127.0.0.1:11000");
        assert_eq!(
            NodeClient::new("http://node0:11000/").unwrap().base,
            "http://node0:11000"
        );
    }

    #[test]
    fn test_status_body() {
        let status: RaftStatus =
            serde_json::from_str(r#"{"State":"Leader","Node":"node0"}"#).unwrap();
        assert_eq!(status.state, "Leader");
        assert_eq!(status.node, "node0");
    }
}
