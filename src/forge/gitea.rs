//! Gitea / Forgejo backend implementation.
//!
//! Uses the `/api/v1` repository endpoints with token authentication.  Pushes
//! go over smart HTTP with the token embedded as `oauth2:<token>@` in the
//! remote URL.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;

use super::{ForgeBackend, RepoStatus};

// ---------------------------------------------------------------------------
// Backend struct
// ---------------------------------------------------------------------------

pub struct GiteaBackend {
    base_url: String,
    public_url: String,
    owner: String,
    token: String,
    http_client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CreateRepoRequest<'a> {
    name: &'a str,
    private: bool,
    auto_init: bool,
}

impl GiteaBackend {
    pub fn new(config: &Config) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("forgedrop/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeouts.http_secs))
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            base_url: config.gitea.url.trim_end_matches('/').to_string(),
            public_url: config.public_url().trim_end_matches('/').to_string(),
            owner: config.gitea.owner.clone(),
            token: config.credentials.gitea_token.clone(),
            http_client,
        })
    }

    fn repo_api_url(&self, name: &str) -> String {
        format!("{}/api/v1/repos/{}/{name}", self.base_url, self.owner)
    }

    fn auth_header(&self) -> String {
        format!("token {}", self.token)
    }

    /// `GET /repos/{owner}/{repo}`; only a 200 counts as present.
    async fn repository_exists(&self, name: &str) -> Result<bool> {
        let resp = self
            .http_client
            .get(self.repo_api_url(name))
            .header("Authorization", self.auth_header())
            .header("Accept", "application/json")
            .send()
            .await
            .context("Gitea repository lookup failed")?;

        let status = resp.status();
        debug!(%status, "repository lookup");
        Ok(status == StatusCode::OK)
    }
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl ForgeBackend for GiteaBackend {
    #[instrument(skip(self), fields(owner = %self.owner))]
    async fn ensure_repository(&self, name: &str) -> Result<RepoStatus> {
        if self.repository_exists(name).await? {
            debug!("repository already exists");
            return Ok(RepoStatus::Existing);
        }

        let resp = self
            .http_client
            .post(format!("{}/api/v1/user/repos", self.base_url))
            .header("Authorization", self.auth_header())
            .header("Accept", "application/json")
            .json(&CreateRepoRequest {
                name,
                private: false,
                auto_init: false,
            })
            .send()
            .await
            .context("Gitea repository creation request failed")?;

        let status = resp.status();
        if status == StatusCode::CREATED {
            info!("repository created");
            return Ok(RepoStatus::Created);
        }

        let body = resp
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unreadable>"));

        // A concurrent upload for the same project won the creation race.
        if status == StatusCode::CONFLICT {
            warn!(%status, "repository created concurrently; treating as existing");
            return Ok(RepoStatus::Existing);
        }

        bail!("create repo failed ({status}): {}", body.trim());
    }

    #[instrument(skip(self), fields(owner = %self.owner))]
    async fn delete_repository(&self, name: &str) -> Result<()> {
        let resp = self
            .http_client
            .delete(self.repo_api_url(name))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .context("Gitea repository deletion request failed")?;

        match resp.status() {
            StatusCode::NO_CONTENT => {
                info!("repository deleted");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                debug!("repository already absent");
                Ok(())
            }
            status => {
                let body = resp
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<unreadable>"));
                bail!("delete failed ({status}): {}", body.trim());
            }
        }
    }

    fn clone_url(&self, name: &str) -> String {
        format!("{}/{}/{name}.git", self.public_url, self.owner)
    }

    fn push_url(&self, name: &str) -> Result<String> {
        let raw = format!("{}/{}/{name}.git", self.base_url, self.owner);
        let mut url = reqwest::Url::parse(&raw).with_context(|| format!("invalid remote URL: {raw}"))?;
        url.set_username("oauth2")
            .and_then(|()| url.set_password(Some(&self.token)))
            .map_err(|()| anyhow::anyhow!("cannot embed credentials in remote URL: {raw}"))?;
        Ok(url.into())
    }

    fn push_secrets(&self) -> Vec<String> {
        let mut secrets = vec![self.token.clone()];
        // `set_password` percent-encodes, so the URL git echoes may differ.
        if let Ok(mut url) = reqwest::Url::parse("http://oauth2@localhost/") {
            if url.set_password(Some(&self.token)).is_ok() {
                if let Some(encoded) = url.password().filter(|e| *e != self.token) {
                    secrets.push(encoded.to_string());
                }
            }
        }
        secrets
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
