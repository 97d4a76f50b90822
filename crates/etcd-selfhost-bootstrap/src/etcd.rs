//! etcd membership API
//!
//! The orchestrator talks to etcd through its v3 JSON gateway rather than the
//! gRPC client: membership changes and health are the only calls it needs,
//! and plain HTTP keeps the request cancellable by dropping the future.
//!
//! uint64 member IDs travel as decimal strings on the gateway, and proto3
//! omits empty fields, so every wire field is defaulted.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, trace};

#[cfg(test)]
use mockall::automock;

use etcd_selfhost_common::Error;

use crate::probe::{HealthProbe, ProbeReport};

/// A member as reported by etcd's own member list
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EtcdMember {
    /// etcd member ID
    pub id: u64,
    /// Member name; empty until the member has started
    pub name: String,
    /// Peer URLs
    pub peer_urls: Vec<String>,
    /// Client URLs; empty until the member has started
    pub client_urls: Vec<String>,
}

impl EtcdMember {
    /// Whether the member process has started and published its name
    pub fn is_started(&self) -> bool {
        !self.name.is_empty()
    }
}

/// Response of a successful member add
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddedMember {
    /// The member that was added (not yet started)
    pub member: EtcdMember,
    /// Full membership after the add, including the new member
    pub members: Vec<EtcdMember>,
}

impl AddedMember {
    /// `--initial-cluster` value the new member must start with
    pub fn initial_cluster(&self, new_name: &str) -> String {
        initial_cluster(&self.members, self.member.id, new_name)
    }
}

/// Render an `--initial-cluster` flag value from a member list.
///
/// The member identified by `new_id` has no name yet, so `new_name` stands in.
pub fn initial_cluster(members: &[EtcdMember], new_id: u64, new_name: &str) -> String {
    members
        .iter()
        .flat_map(|m| {
            let name = if m.id == new_id {
                new_name
            } else {
                m.name.as_str()
            };
            m.peer_urls.iter().map(move |url| format!("{}={}", name, url))
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Trait abstracting etcd's cluster membership API
///
/// Every call takes the client endpoints of the members the caller believes
/// are healthy; implementations try them in order until one answers.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EtcdMembership: Send + Sync {
    /// List current members
    async fn list_members(&self, endpoints: &[String]) -> Result<Vec<EtcdMember>, Error>;

    /// Add a voting member with the given peer URLs
    async fn add_member(
        &self,
        endpoints: &[String],
        peer_urls: &[String],
    ) -> Result<AddedMember, Error>;

    /// Remove a member by ID, returning the remaining membership
    async fn remove_member(&self, endpoints: &[String], id: u64) -> Result<Vec<EtcdMember>, Error>;
}

#[derive(Debug, Deserialize)]
struct WireMember {
    #[serde(rename = "ID", default, deserialize_with = "lenient_u64")]
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(rename = "peerURLs", default)]
    peer_urls: Vec<String>,
    #[serde(rename = "clientURLs", default)]
    client_urls: Vec<String>,
}

impl From<WireMember> for EtcdMember {
    fn from(w: WireMember) -> Self {
        Self {
            id: w.id,
            name: w.name,
            peer_urls: w.peer_urls,
            client_urls: w.client_urls,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct MemberListResponse {
    #[serde(default)]
    members: Vec<WireMember>,
}

#[derive(Debug, Deserialize)]
struct MemberAddResponse {
    member: WireMember,
    #[serde(default)]
    members: Vec<WireMember>,
}

#[derive(Debug, Serialize)]
struct MemberAddRequest<'a> {
    #[serde(rename = "peerURLs")]
    peer_urls: &'a [String],
}

#[derive(Debug, Serialize)]
struct MemberRemoveRequest {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    health: String,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s.parse().map_err(D::Error::custom),
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom(format!("member ID {} is not a uint64", n))),
        serde_json::Value::Null => Ok(0),
        other => Err(D::Error::custom(format!("unexpected member ID {}", other))),
    }
}

/// Default timeout for a single gateway request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// etcd client over the v3 JSON gateway
#[derive(Clone)]
pub struct EtcdGatewayClient {
    http: reqwest::Client,
}

impl EtcdGatewayClient {
    /// Create a client whose requests time out after `request_timeout`
    pub fn new(request_timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| {
                Error::internal_with_context("etcd_client", format!("failed to build client: {}", e))
            })?;
        Ok(Self { http })
    }

    async fn post<B, R>(&self, endpoint: &str, path: &str, body: &B) -> Result<R, Error>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
        trace!(url = %url, "etcd gateway request");
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| map_transport_error(endpoint, e))?;
        decode(endpoint, response).await
    }

    /// Try each endpoint in order; only transient failures fall through
    async fn post_any<B, R>(&self, endpoints: &[String], path: &str, body: &B) -> Result<R, Error>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let mut last_error = None;
        for endpoint in endpoints {
            match self.post(endpoint, path, body).await {
                Ok(r) => return Ok(r),
                Err(e) if e.is_retryable() => {
                    debug!(endpoint = %endpoint, error = %e, "etcd endpoint failed, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::internal_with_context("etcd_client", "no client endpoints to contact")
        }))
    }
}

fn map_transport_error(endpoint: &str, e: reqwest::Error) -> Error {
    Error::transient(endpoint, e.to_string())
}

async fn decode<R: DeserializeOwned>(endpoint: &str, response: reqwest::Response) -> Result<R, Error> {
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| map_transport_error(endpoint, e))?;

    if !status.is_success() {
        let detail: GatewayError = serde_json::from_slice(&bytes).unwrap_or_default();
        let message = if !detail.message.is_empty() {
            detail.message
        } else if !detail.error.is_empty() {
            detail.error
        } else {
            format!("HTTP {}", status)
        };
        // 5xx and 429 are etcd saying "not now" (leader election, too many requests)
        let retryable = status.is_server_error() || status.as_u16() == 429;
        return Err(Error::etcd(endpoint, message, retryable));
    }

    serde_json::from_slice(&bytes).map_err(|e| {
        Error::etcd(endpoint, format!("malformed gateway response: {}", e), false)
    })
}

#[async_trait]
impl EtcdMembership for EtcdGatewayClient {
    async fn list_members(&self, endpoints: &[String]) -> Result<Vec<EtcdMember>, Error> {
        let resp: MemberListResponse = self
            .post_any(endpoints, "/v3/cluster/member/list", &serde_json::json!({}))
            .await?;
        Ok(resp.members.into_iter().map(EtcdMember::from).collect())
    }

    async fn add_member(
        &self,
        endpoints: &[String],
        peer_urls: &[String],
    ) -> Result<AddedMember, Error> {
        let resp: MemberAddResponse = self
            .post_any(
                endpoints,
                "/v3/cluster/member/add",
                &MemberAddRequest { peer_urls },
            )
            .await?;
        Ok(AddedMember {
            member: resp.member.into(),
            members: resp.members.into_iter().map(EtcdMember::from).collect(),
        })
    }

    async fn remove_member(&self, endpoints: &[String], id: u64) -> Result<Vec<EtcdMember>, Error> {
        let resp: MemberListResponse = self
            .post_any(
                endpoints,
                "/v3/cluster/member/remove",
                &MemberRemoveRequest { id: id.to_string() },
            )
            .await?;
        Ok(resp.members.into_iter().map(EtcdMember::from).collect())
    }
}

#[async_trait]
impl HealthProbe for EtcdGatewayClient {
    async fn probe(&self, endpoint: &str) -> Result<ProbeReport, Error> {
        let url = format!("{}/health", endpoint.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| map_transport_error(endpoint, e))?;
        let health: HealthResponse = decode(endpoint, response).await?;
        if health.health != "true" {
            return Ok(ProbeReport::unhealthy());
        }

        let members: MemberListResponse = self
            .post(endpoint, "/v3/cluster/member/list", &serde_json::json!({}))
            .await?;
        Ok(ProbeReport::healthy(members.members.len()))
    }
}
