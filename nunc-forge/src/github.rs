//! GitHub API client for self-hosted runner management.
//!
//! Handles:
//! - Personal access token or GitHub App authentication (JWT generation)
//! - Installation access token retrieval for the configured repository
//! - Runner registration tokens, listing and deletion

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::{GitHubCredentials, Repository};

/// GitHub API base URL
const GITHUB_API_URL: &str = "https://api.github.com";

/// Page size for runner listing (GitHub maximum)
const RUNNERS_PER_PAGE: usize = 100;

/// A runner as registered on GitHub.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegisteredRunner {
    pub id: u64,
    pub name: String,
}

/// Operations the fleet needs from the CI service's worker registry.
#[async_trait]
pub trait RunnerRegistry: Send + Sync {
    /// List every self-hosted runner registered on the repository.
    async fn list_runners(&self) -> Result<Vec<RegisteredRunner>>;

    /// Deregister a runner by its GitHub id.
    async fn delete_runner(&self, runner_id: u64) -> Result<()>;

    /// Get a fresh short-lived registration token.
    async fn registration_token(&self) -> Result<String>;
}

/// Cached access token with expiration tracking
#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: chrono::DateTime<Utc>,
}

impl CachedToken {
    /// Check if the token is still valid (with a 5-minute buffer)
    fn is_valid(&self) -> bool {
        self.expires_at > Utc::now() + Duration::minutes(5)
    }
}

/// JWT claims for GitHub App authentication
#[derive(Debug, Serialize)]
struct AppJwtClaims {
    /// Issued at time
    iat: i64,
    /// Expiration time (max 10 minutes)
    exp: i64,
    /// GitHub App ID (issuer)
    iss: String,
}

/// Response from installation access token endpoint
#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

/// Response from runner registration token endpoint
#[derive(Debug, Deserialize)]
struct RegistrationTokenResponse {
    token: String,
}

/// Response from runners list endpoint
#[derive(Debug, Deserialize)]
struct RunnersListResponse {
    runners: Vec<RegisteredRunner>,
}

/// Installation info from GitHub API
#[derive(Debug, Deserialize)]
struct Installation {
    id: u64,
}

enum Auth {
    Token(String),
    App {
        app_id: u64,
        private_key: String,
        installation_id: RwLock<Option<u64>>,
        cached_token: RwLock<Option<CachedToken>>,
    },
}

/// GitHub API client bound to one repository
pub struct GitHubClient {
    repository: Repository,
    auth: Auth,
    http_client: Client,
    base_url: String,
}

impl GitHubClient {
    /// Create a client from resolved credentials, reading the App key if needed.
    pub fn new(repository: Repository, credentials: &GitHubCredentials) -> Result<Self> {
        let auth = match credentials {
            GitHubCredentials::Token(token) => Auth::Token(token.clone()),
            GitHubCredentials::App {
                app_id,
                private_key_path,
            } => Auth::App {
                app_id: *app_id,
                private_key: read_private_key(private_key_path)?,
                installation_id: RwLock::new(None),
                cached_token: RwLock::new(None),
            },
        };

        let http_client = Client::builder()
            .user_agent("nunc-forge")
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            repository,
            auth,
            http_client,
            base_url: GITHUB_API_URL.to_string(),
        })
    }

    /// Point the client at a different API host (GitHub Enterprise, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Check that the credentials work against the repository.
    pub async fn validate(&self) -> Result<()> {
        info!("Validating GitHub credentials for {}...", self.repository);
        let runners = self.list_runners().await.with_context(|| {
            format!(
                "Failed to access runners of {}. Check the credentials and their permissions.",
                self.repository
            )
        })?;
        info!(
            "GitHub API access validated ({} runner(s) registered)",
            runners.len()
        );
        Ok(())
    }

    /// Generate a JWT for GitHub App authentication
    fn generate_jwt(app_id: u64, private_key: &str) -> Result<String> {
        let now = Utc::now();
        let claims = AppJwtClaims {
            // GitHub recommends 60 seconds in the past to avoid clock drift
            iat: (now - Duration::seconds(60)).timestamp(),
            // Max expiration is 10 minutes
            exp: (now + Duration::minutes(9)).timestamp(),
            iss: app_id.to_string(),
        };

        let key = EncodingKey::from_rsa_pem(private_key.as_bytes())
            .context("Failed to parse GitHub App private key")?;

        encode(&Header::new(Algorithm::RS256), &claims, &key).context("Failed to generate JWT")
    }

    /// Bearer token for regular API calls.
    async fn access_token(&self) -> Result<String> {
        let (app_id, private_key, installation_id, cached_token) = match &self.auth {
            Auth::Token(token) => return Ok(token.clone()),
            Auth::App {
                app_id,
                private_key,
                installation_id,
                cached_token,
            } => (*app_id, private_key, installation_id, cached_token),
        };

        if let Some(token) = cached_token.read().await.as_ref()
            && token.is_valid()
        {
            return Ok(token.token.clone());
        }

        let jwt = Self::generate_jwt(app_id, private_key)?;
        let known_installation = *installation_id.read().await;
        let installation = match known_installation {
            Some(id) => id,
            None => {
                let id = self.find_installation(&jwt).await?;
                *installation_id.write().await = Some(id);
                id
            }
        };

        let url = format!(
            "{}/app/installations/{installation}/access_tokens",
            self.base_url
        );
        let response = self
            .github_request(Method::POST, &url, &jwt)
            .send()
            .await
            .context("Failed to request installation access token")?;
        let response = check_status(response, "requesting installation access token").await?;

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation access token response")?;

        let expires_at = chrono::DateTime::parse_from_rfc3339(&token_response.expires_at)
            .context("Failed to parse token expiration")?
            .with_timezone(&Utc);

        *cached_token.write().await = Some(CachedToken {
            token: token_response.token.clone(),
            expires_at,
        });

        Ok(token_response.token)
    }

    /// Look up the App installation that covers the repository.
    async fn find_installation(&self, jwt: &str) -> Result<u64> {
        let url = format!("{}{}", self.base_url, self.repository.installation_path());
        let response = self
            .github_request(Method::GET, &url, jwt)
            .send()
            .await
            .context("Failed to look up GitHub App installation")?;
        let response = check_status(response, "looking up installation").await.with_context(|| {
            format!("GitHub App is not installed on {}", self.repository)
        })?;

        let installation: Installation = response
            .json()
            .await
            .context("Failed to parse installation response")?;
        debug!(
            "Using installation {} for {}",
            installation.id, self.repository
        );
        Ok(installation.id)
    }

    fn github_request(&self, method: Method, url: &str, bearer: &str) -> RequestBuilder {
        self.http_client
            .request(method, url)
            .header("Authorization", format!("Bearer {bearer}"))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    /// Get a runner registration token for the repository
    pub async fn get_registration_token(&self) -> Result<String> {
        let access_token = self.access_token().await?;
        let url = format!(
            "{}{}",
            self.base_url,
            self.repository.registration_token_path()
        );

        let response = self
            .github_request(Method::POST, &url, &access_token)
            .send()
            .await
            .context("Failed to request runner registration token")?;
        let response = check_status(response, "getting registration token").await?;

        let token_response: RegistrationTokenResponse = response
            .json()
            .await
            .context("Failed to parse registration token response")?;

        Ok(token_response.token)
    }

    /// List all runners of the repository, following pagination
    pub async fn list_all_runners(&self) -> Result<Vec<RegisteredRunner>> {
        let access_token = self.access_token().await?;
        let mut runners = Vec::new();
        let mut page = 1;

        loop {
            let url = format!(
                "{}{}?per_page={RUNNERS_PER_PAGE}&page={page}",
                self.base_url,
                self.repository.runners_list_path()
            );

            let response = self
                .github_request(Method::GET, &url, &access_token)
                .send()
                .await
                .context("Failed to list runners")?;
            let response = check_status(response, "listing runners").await?;

            let page_runners = response
                .json::<RunnersListResponse>()
                .await
                .context("Failed to parse runners list response")?
                .runners;

            let count = page_runners.len();
            runners.extend(page_runners);

            if count < RUNNERS_PER_PAGE {
                break;
            }
            page += 1;
        }

        debug!("GitHub reports {} runner(s) for {}", runners.len(), self.repository);
        Ok(runners)
    }

    /// Delete a runner by its ID
    pub async fn remove_runner(&self, runner_id: u64) -> Result<()> {
        let access_token = self.access_token().await?;
        let url = format!(
            "{}{}",
            self.base_url,
            self.repository.runner_delete_path(runner_id)
        );

        let response = self
            .github_request(Method::DELETE, &url, &access_token)
            .send()
            .await
            .context("Failed to delete runner")?;

        // 204 No Content is the success response
        check_status(response, "deleting runner").await?;
        info!("Removed runner {} from {}", runner_id, self.repository);
        Ok(())
    }
}

#[async_trait]
impl RunnerRegistry for GitHubClient {
    async fn list_runners(&self) -> Result<Vec<RegisteredRunner>> {
        self.list_all_runners().await
    }

    async fn delete_runner(&self, runner_id: u64) -> Result<()> {
        self.remove_runner(runner_id).await
    }

    async fn registration_token(&self) -> Result<String> {
        self.get_registration_token().await
    }
}

fn read_private_key(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| {
        format!(
            "Failed to read GitHub App private key: {}",
            path.display()
        )
    })
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(anyhow!("GitHub API error {what} ({status}): {body}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::{Path as UrlPath, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{delete, get};
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Runners registered on the mock repository, served in pages.
    #[derive(Clone)]
    struct MockGitHub {
        runners: Arc<Mutex<Vec<(u64, String)>>>,
        pages_served: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl MockGitHub {
        fn with_runners(count: u64) -> Self {
            Self {
                runners: Arc::new(Mutex::new(
                    (1..=count).map(|id| (id, format!("amd64-{id}"))).collect(),
                )),
                pages_served: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer ghp_test")
            && headers.get("x-github-api-version").is_some()
    }

    async fn list_runners(
        State(gh): State<MockGitHub>,
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
    ) -> (StatusCode, axum::Json<Value>) {
        if !authorized(&headers) {
            return (StatusCode::UNAUTHORIZED, axum::Json(json!({"message": "Bad credentials"})));
        }
        let per_page: usize = query["per_page"].parse().unwrap();
        let page: usize = query["page"].parse().unwrap();
        gh.pages_served
            .lock()
            .unwrap()
            .push((query["per_page"].clone(), query["page"].clone()));

        let all = gh.runners.lock().unwrap().clone();
        let runners: Vec<Value> = all
            .iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .map(|(id, name)| json!({"id": id, "name": name, "status": "online", "busy": false}))
            .collect();
        (
            StatusCode::OK,
            axum::Json(json!({"total_count": all.len(), "runners": runners})),
        )
    }

    async fn delete_runner(
        State(gh): State<MockGitHub>,
        headers: HeaderMap,
        UrlPath(id): UrlPath<u64>,
    ) -> StatusCode {
        if !authorized(&headers) {
            return StatusCode::UNAUTHORIZED;
        }
        let mut runners = gh.runners.lock().unwrap();
        let before = runners.len();
        runners.retain(|(runner_id, _)| *runner_id != id);
        if runners.len() == before {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::NO_CONTENT
        }
    }

    /// Serve the mock API on an ephemeral port and return a client pointed at it.
    async fn client_for(gh: MockGitHub) -> GitHubClient {
        let router = Router::new()
            .route("/repos/octo/widgets/actions/runners", get(list_runners))
            .route("/repos/octo/widgets/actions/runners/{id}", delete(delete_runner))
            .with_state(gh);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let repo: Repository = "octo/widgets".parse().unwrap();
        GitHubClient::new(repo, &GitHubCredentials::Token("ghp_test".into()))
            .unwrap()
            .with_base_url(format!("http://{addr}"))
    }

    #[tokio::test]
    async fn test_list_runners_reads_every_page() {
        let gh = MockGitHub::with_runners(103);
        let client = client_for(gh.clone()).await;

        let runners = client.list_runners().await.unwrap();

        assert_eq!(runners.len(), 103);
        assert_eq!(runners[0], RegisteredRunner { id: 1, name: "amd64-1".into() });
        assert_eq!(runners[102], RegisteredRunner { id: 103, name: "amd64-103".into() });
        assert_eq!(
            *gh.pages_served.lock().unwrap(),
            vec![("100".to_string(), "1".to_string()), ("100".to_string(), "2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_list_runners_full_last_page() {
        let gh = MockGitHub::with_runners(100);
        let client = client_for(gh.clone()).await;

        assert_eq!(client.list_runners().await.unwrap().len(), 100);
        // A full page means there may be more; the empty second page ends the loop
        assert_eq!(gh.pages_served.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_runner() {
        let gh = MockGitHub::with_runners(3);
        let client = client_for(gh.clone()).await;

        client.delete_runner(2).await.unwrap();
        let names: Vec<_> = gh.runners.lock().unwrap().iter().map(|(_, n)| n.clone()).collect();
        assert_eq!(names, vec!["amd64-1", "amd64-3"]);

        let err = client.delete_runner(2).await.unwrap_err();
        assert!(format!("{err:#}").contains("404"));
    }

    #[test]
    fn test_cached_token_validity() {
        let valid_token = CachedToken {
            token: "test".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        };
        assert!(valid_token.is_valid());

        let expired_token = CachedToken {
            token: "test".to_string(),
            expires_at: Utc::now() - Duration::hours(1),
        };
        assert!(!expired_token.is_valid());

        // Token expiring in less than 5 minutes should be considered invalid
        let almost_expired = CachedToken {
            token: "test".to_string(),
            expires_at: Utc::now() + Duration::minutes(4),
        };
        assert!(!almost_expired.is_valid());
    }

    #[test]
    fn test_parse_runners_list() {
        let body = r#"{
            "total_count": 2,
            "runners": [
                {"id": 23, "name": "amd64-0", "os": "linux", "status": "online", "busy": true, "labels": []},
                {"id": 24, "name": "laptop", "os": "macos", "status": "offline", "busy": false, "labels": []}
            ]
        }"#;
        let parsed: RunnersListResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed.runners,
            vec![
                RegisteredRunner { id: 23, name: "amd64-0".into() },
                RegisteredRunner { id: 24, name: "laptop".into() },
            ]
        );
    }

    #[test]
    fn test_app_client_requires_readable_key() {
        let credentials = GitHubCredentials::App {
            app_id: 1,
            private_key_path: "/nonexistent/app.pem".into(),
        };
        let repo: Repository = "octo/widgets".parse().unwrap();
        assert!(GitHubClient::new(repo, &credentials).is_err());
    }

    #[test]
    fn test_generate_jwt_rejects_invalid_key() {
        assert!(GitHubClient::generate_jwt(1, "not a pem").is_err());
    }

    #[tokio::test]
    async fn test_token_auth_uses_token_directly() {
        let repo: Repository = "octo/widgets".parse().unwrap();
        let client =
            GitHubClient::new(repo, &GitHubCredentials::Token("ghp_abc".into())).unwrap();
        assert_eq!(client.access_token().await.unwrap(), "ghp_abc");
    }
}
