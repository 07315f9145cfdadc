//! Git Hosting Adapter: repository, user and collaborator lifecycle on the
//! remote Git service.
//!
//! Callers treat every method as one atomic remote call. Retrying lives here:
//! requests that never reached the server are retried, and server errors are
//! retried only for idempotent methods (PUT/DELETE).

use crate::config::GiteaConfig;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Serialize;
use std::{fmt, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum GitHostingError {
    #[error("{operation}: request failed: {source}")]
    Transport {
        operation: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{operation}: server answered {status}: {body}")]
    Api {
        operation: String,
        status: StatusCode,
        body: String,
    },
    #[error("invalid Git hosting URL `{0}`")]
    InvalidUrl(String),
    #[error("building HTTP client failed: {0}")]
    Client(#[source] reqwest::Error),
}

pub type GitResult<T> = Result<T, GitHostingError>;

/// Collaborator access level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Read => f.write_str("read"),
            Permission::Write => f.write_str("write"),
            Permission::Admin => f.write_str("admin"),
        }
    }
}

#[async_trait]
pub trait GitHosting: Send + Sync {
    async fn repo_create(&self, repo: &str) -> GitResult<()>;

    /// A missing repository is not an error.
    async fn repo_delete(&self, repo: &str) -> GitResult<()>;

    /// Commit initial content authored by the tenant.
    async fn repo_initialize(&self, repo: &str, tenant: &str, email: &str) -> GitResult<()>;

    async fn user_create(&self, username: &str, email: &str, password: &str) -> GitResult<()>;

    /// A missing user is not an error.
    async fn user_delete(&self, username: &str) -> GitResult<()>;

    async fn collaborator_add(
        &self,
        repo: &str,
        username: &str,
        permission: Permission,
    ) -> GitResult<()>;

    /// A missing collaborator is not an error.
    async fn collaborator_remove(&self, repo: &str, username: &str) -> GitResult<()>;

    /// SSH clone URL shown to operators and tenants.
    fn clone_url(&self, repo: &str) -> String;
}

/// Gitea REST API v1 client. Every repository lives under one organisation.
#[derive(Clone, Debug)]
pub struct GiteaClient {
    client: Client,
    base_url: String,
    token: String,
    org: String,
    ssh_host: String,
    ssh_port: u16,
}

#[derive(Serialize)]
struct CreateRepoPayload<'a> {
    name: &'a str,
    description: String,
    private: bool,
    auto_init: bool,
}

#[derive(Serialize)]
struct CreateUserPayload<'a> {
    username: &'a str,
    email: &'a str,
    password: &'a str,
    must_change_password: bool,
    send_notify: bool,
}

#[derive(Serialize)]
struct CollaboratorPayload {
    permission: Permission,
}

#[derive(Serialize)]
struct Identity<'a> {
    name: &'a str,
    email: &'a str,
}

#[derive(Serialize)]
struct CreateFilePayload<'a> {
    content: String,
    message: &'a str,
    author: Identity<'a>,
    committer: Identity<'a>,
}

impl GiteaClient {
    pub fn new(config: &GiteaConfig) -> GitResult<Self> {
        let base_url = config.url.trim_end_matches('/').to_string();
        let ssh_host = Url::parse(&base_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .ok_or_else(|| GitHostingError::InvalidUrl(config.url.clone()))?;
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("tenantctl/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(GitHostingError::Client)?;

        Ok(Self {
            client,
            base_url,
            token: config.token.clone(),
            org: config.org.clone(),
            ssh_host,
            ssh_port: config.ssh_port,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("Authorization", format!("token {}", self.token))
    }

    /// Send a request, retrying transport failures and (for idempotent
    /// requests) server errors with exponential backoff.
    async fn send(
        &self,
        operation: &str,
        idempotent: bool,
        build: impl Fn() -> RequestBuilder + Send + Sync,
    ) -> GitResult<Response> {
        let mut attempt = 1;
        loop {
            debug!("{} (attempt {}/{})", operation, attempt, MAX_ATTEMPTS);
            let retry = match self.authorized(build()).send().await {
                Ok(resp) if idempotent && resp.status().is_server_error() && attempt < MAX_ATTEMPTS => {
                    format!("server answered {}", resp.status())
                }
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_connect() && attempt < MAX_ATTEMPTS => err.to_string(),
                Err(source) => {
                    return Err(GitHostingError::Transport {
                        operation: operation.to_string(),
                        source,
                    });
                }
            };
            let delay = BACKOFF_BASE * 2u32.pow(attempt - 1);
            warn!("{}: {}; retrying in {:?}", operation, retry, delay);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Map the response onto success when its status is in `accepted`.
    async fn expect(operation: &str, resp: Response, accepted: &[StatusCode]) -> GitResult<()> {
        let status = resp.status();
        if accepted.contains(&status) {
            debug!("{}: {}", operation, status);
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(GitHostingError::Api {
            operation: operation.to_string(),
            status,
            body: body.trim().to_string(),
        })
    }
}

#[async_trait]
impl GitHosting for GiteaClient {
    async fn repo_create(&self, repo: &str) -> GitResult<()> {
        let operation = format!("create repository {}/{}", self.org, repo);
        let url = self.url(&format!("/orgs/{}/repos", self.org));
        let payload = CreateRepoPayload {
            name: repo,
            description: format!("Content repository for tenant {}", repo),
            private: true,
            auto_init: false,
        };
        let resp = self
            .send(&operation, false, || self.client.post(&url).json(&payload))
            .await?;
        Self::expect(&operation, resp, &[StatusCode::CREATED]).await?;
        info!("created remote repository {}/{}", self.org, repo);
        Ok(())
    }

    async fn repo_delete(&self, repo: &str) -> GitResult<()> {
        let operation = format!("delete repository {}/{}", self.org, repo);
        let url = self.url(&format!("/repos/{}/{}", self.org, repo));
        let resp = self
            .send(&operation, true, || self.client.delete(&url))
            .await?;
        Self::expect(
            &operation,
            resp,
            &[StatusCode::NO_CONTENT, StatusCode::NOT_FOUND],
        )
        .await?;
        info!("removed remote repository {}/{}", self.org, repo);
        Ok(())
    }

    async fn repo_initialize(&self, repo: &str, tenant: &str, email: &str) -> GitResult<()> {
        let operation = format!("initialize repository {}/{}", self.org, repo);
        let url = self.url(&format!("/repos/{}/{}/contents/README.md", self.org, repo));
        let readme = format!(
            "# {}\n\nContent published for tenant `{}`.\n\
             Files uploaded over SFTP are served from this repository.\n",
            tenant, tenant
        );
        let payload = CreateFilePayload {
            content: general_purpose::STANDARD.encode(readme),
            message: "Initialize content repository",
            author: Identity { name: tenant, email },
            committer: Identity { name: tenant, email },
        };
        let resp = self
            .send(&operation, false, || self.client.post(&url).json(&payload))
            .await?;
        Self::expect(&operation, resp, &[StatusCode::CREATED]).await
    }

    async fn user_create(&self, username: &str, email: &str, password: &str) -> GitResult<()> {
        let operation = format!("create user {}", username);
        let url = self.url("/admin/users");
        let payload = CreateUserPayload {
            username,
            email,
            password,
            must_change_password: false,
            send_notify: false,
        };
        let resp = self
            .send(&operation, false, || self.client.post(&url).json(&payload))
            .await?;
        Self::expect(&operation, resp, &[StatusCode::CREATED]).await?;
        info!("created remote user {}", username);
        Ok(())
    }

    async fn user_delete(&self, username: &str) -> GitResult<()> {
        let operation = format!("delete user {}", username);
        let url = self.url(&format!("/admin/users/{}?purge=true", username));
        let resp = self
            .send(&operation, true, || self.client.delete(&url))
            .await?;
        Self::expect(
            &operation,
            resp,
            &[StatusCode::NO_CONTENT, StatusCode::NOT_FOUND],
        )
        .await?;
        info!("removed remote user {}", username);
        Ok(())
    }

    async fn collaborator_add(
        &self,
        repo: &str,
        username: &str,
        permission: Permission,
    ) -> GitResult<()> {
        let operation = format!("add {} as {} collaborator on {}", username, permission, repo);
        let url = self.url(&format!(
            "/repos/{}/{}/collaborators/{}",
            self.org, repo, username
        ));
        let payload = CollaboratorPayload { permission };
        let resp = self
            .send(&operation, true, || self.client.put(&url).json(&payload))
            .await?;
        Self::expect(&operation, resp, &[StatusCode::NO_CONTENT]).await
    }

    async fn collaborator_remove(&self, repo: &str, username: &str) -> GitResult<()> {
        let operation = format!("remove collaborator {} from {}", username, repo);
        let url = self.url(&format!(
            "/repos/{}/{}/collaborators/{}",
            self.org, repo, username
        ));
        let resp = self
            .send(&operation, true, || self.client.delete(&url))
            .await?;
        Self::expect(
            &operation,
            resp,
            &[StatusCode::NO_CONTENT, StatusCode::NOT_FOUND],
        )
        .await
    }

    fn clone_url(&self, repo: &str) -> String {
        format!(
            "ssh://git@{}:{}/{}/{}.git",
            self.ssh_host, self.ssh_port, self.org, repo
        )
    }
}
