//! Minimal Hetzner Cloud API client.
//!
//! Covers the server lifecycle calls the fleet controller needs: listing,
//! creating, deleting and rebuilding servers, plus polling the actions those
//! calls return.

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, error};

/// Default API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.hetzner.cloud/v1";

/// Page size used when listing servers (API maximum is 50).
const PAGE_SIZE: u32 = 50;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error within reqwest library
    #[error("Hetzner API request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// Error object returned by the API
    #[error("Hetzner API error ({status}) {code}: {message}")]
    Api {
        status: StatusCode,
        code: String,
        message: String,
    },

    /// Non-success status without a parseable error body
    #[error("HTTP error from API: {0}")]
    HttpError(StatusCode),

    /// An action finished with status `error`
    #[error("Action {id} failed: {message}")]
    ActionFailed { id: u64, message: String },

    /// Unknown action status
    #[error("Unknown action status: {0}")]
    UnknownActionStatus(String),

    /// Timeout waiting for condition
    #[error("Timeout: {0}")]
    Timeout(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub created: String,
    pub public_net: PublicNet,
}

impl Server {
    /// Public IPv4 address, if the server has one.
    pub fn public_ipv4(&self) -> Option<Ipv4Addr> {
        self.public_net
            .ipv4
            .as_ref()
            .and_then(|v4| v4.ip.parse().ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicNet {
    #[serde(default)]
    pub ipv4: Option<Ipv4Info>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ipv4Info {
    pub ip: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Action {
    pub id: u64,
    pub command: String,
    pub status: String,
    #[serde(default)]
    pub error: Option<ActionError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionError {
    pub code: String,
    pub message: String,
}

/// Parameters for `POST /servers`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub server_type: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub start_after_create: bool,
    pub public_net: PublicNetRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicNetRequest {
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
}

#[derive(Debug, Clone, Serialize)]
struct RebuildParams<'a> {
    image: &'a str,
}

#[derive(Debug, Deserialize)]
struct ServerListResponse {
    servers: Vec<Server>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    pagination: Pagination,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    next_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CreateServerResponse {
    server: Server,
}

#[derive(Debug, Deserialize)]
struct ActionResponse {
    action: Action,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: String,
    message: String,
}

pub struct HetznerCloudAPI {
    client: Client,
    token: String,
    base_url: String,
}

impl HetznerCloudAPI {
    pub fn new<T: ToString>(token: T) -> Result<Self> {
        Self::with_base_url(token, DEFAULT_BASE_URL)
    }

    /// Create a client against a custom endpoint (used for tests and proxies).
    pub fn with_base_url<T: ToString, U: ToString>(token: T, base_url: U) -> Result<Self> {
        let client = Client::builder().user_agent("nunc-forge").build()?;
        Ok(Self {
            client,
            token: token.to_string(),
            base_url: base_url.to_string().trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        self.client.request(method, url).bearer_auth(&self.token)
    }

    /// Turn a non-success response into an error, preferring the API error body.
    async fn api_error(resp: reqwest::Response) -> Error {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(parsed) => Error::Api {
                status,
                code: parsed.error.code,
                message: parsed.error.message,
            },
            Err(_) => {
                error!("Hetzner API returned {status}: {body}");
                Error::HttpError(status)
            }
        }
    }

    /// List all servers in the project, following pagination.
    pub async fn list_servers(&self) -> Result<Vec<Server>> {
        let mut servers = Vec::new();
        let mut page = 1;

        loop {
            let resp = self
                .request(Method::GET, "servers")
                .query(&[("page", page), ("per_page", PAGE_SIZE)])
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(Self::api_error(resp).await);
            }

            let list: ServerListResponse = resp.json().await?;
            servers.extend(list.servers);

            match list.meta.and_then(|m| m.pagination.next_page) {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        debug!("Listed {} servers", servers.len());
        Ok(servers)
    }

    /// Create a server. The server starts booting immediately when
    /// `start_after_create` is set.
    pub async fn create_server(&self, params: &CreateServerRequest) -> Result<Server> {
        let resp = self
            .request(Method::POST, "servers")
            .json(params)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }

        let created: CreateServerResponse = resp.json().await?;
        debug!("Created server {} ({})", created.server.name, created.server.id);
        Ok(created.server)
    }

    /// Delete a server. Returns the deletion action.
    pub async fn delete_server(&self, id: u64) -> Result<Action> {
        let resp = self
            .request(Method::DELETE, &format!("servers/{id}"))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }

        let resp: ActionResponse = resp.json().await?;
        debug!("Delete action for server {id}: {}", resp.action.id);
        Ok(resp.action)
    }

    /// Rebuild a server from an image. Returns the rebuild action.
    pub async fn rebuild_server(&self, id: u64, image: &str) -> Result<Action> {
        let resp = self
            .request(Method::POST, &format!("servers/{id}/actions/rebuild"))
            .json(&RebuildParams { image })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }

        let resp: ActionResponse = resp.json().await?;
        debug!("Rebuild action for server {id}: {}", resp.action.id);
        Ok(resp.action)
    }

    /// Get the current state of an action.
    pub async fn get_action(&self, id: u64) -> Result<Action> {
        let resp = self
            .request(Method::GET, &format!("actions/{id}"))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }

        let resp: ActionResponse = resp.json().await?;
        Ok(resp.action)
    }

    /// Poll an action until it completes or `timeout` elapses.
    pub async fn wait_for_action(&self, action: &Action, timeout: Duration) -> Result<()> {
        let start = tokio::time::Instant::now();
        let mut current = action.clone();

        loop {
            match classify_action(&current)? {
                ActionState::Done => return Ok(()),
                ActionState::Running => {}
            }

            if start.elapsed() > timeout {
                return Err(Error::Timeout(format!(
                    "Action {} ({}) did not complete within {timeout:?}",
                    current.id, current.command
                )));
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
            current = self.get_action(current.id).await?;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ActionState {
    Running,
    Done,
}

fn classify_action(action: &Action) -> Result<ActionState> {
    match action.status.as_str() {
        "success" => Ok(ActionState::Done),
        "running" => Ok(ActionState::Running),
        "error" => Err(Error::ActionFailed {
            id: action.id,
            message: action
                .error
                .as_ref()
                .map(|e| format!("{}: {}", e.code, e.message))
                .unwrap_or_else(|| "unknown error".to_string()),
        }),
        other => Err(Error::UnknownActionStatus(other.to_string())),
    }
}
