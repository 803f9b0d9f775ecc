//! Source host client: resolves repositories to clone URLs, fetches the
//! optional `service.json` descriptor, and turns push webhooks into
//! services. Only public repositories may auto-deploy.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::models::{PublicConfiguration, Service, default_branch};

/// The fields of a push webhook the orchestrator cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct PushWebhook {
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub repository: WebhookRepository,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookRepository {
    pub full_name: String,
    #[serde(default)]
    pub private: bool,
}

pub struct GitHubClient {
    http: reqwest::Client,
    /// Optional `user:token` credential for descriptor fetches.
    auth: Option<String>,
}

impl GitHubClient {
    pub fn new(auth: Option<String>) -> Self {
        GitHubClient {
            http: reqwest::Client::new(),
            auth,
        }
    }

    pub fn repository_url(repository: &str) -> String {
        format!("https://github.com/{repository}")
    }

    pub fn clone_url(repository: &str) -> String {
        format!("{}.git", Self::repository_url(repository))
    }

    fn descriptor_url(repository: &str, branch: &str) -> String {
        format!("https://raw.githubusercontent.com/{repository}/{branch}/service.json")
    }

    pub async fn exists(&self, repository: &str) -> bool {
        match self
            .http
            .head(Self::repository_url(repository))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                log::warn!("Failed to check repository {repository}: {err}");
                false
            }
        }
    }

    /// Fetches the repository's descriptor file. Every failure mode, from
    /// network errors to a missing or unparsable file, falls back to the
    /// empty default configuration.
    pub async fn fetch_configuration(&self, service: &Service) -> PublicConfiguration {
        let url = Self::descriptor_url(&service.repository, &service.branch);
        match self.try_fetch_configuration(&url).await {
            Ok(config) => {
                log::info!("Configuration found at {url}");
                config
            }
            Err(err) => {
                log::info!("No service configuration found at {url}: {err}");
                PublicConfiguration::default()
            }
        }
    }

    async fn try_fetch_configuration(&self, url: &str) -> Result<PublicConfiguration> {
        let mut request = self
            .http
            .get(url)
            .header("user-agent", "homebots/cloudy")
            .header("pragma", "no-cache")
            .header("cache-control", "no-cache");

        if let Some(auth) = &self.auth {
            let (user, token) = auth.split_once(':').unwrap_or((auth.as_str(), ""));
            request = request.basic_auth(user, Some(token));
        }

        let response = request.send().await?.error_for_status()?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// Extracts the service named by a push webhook. Private repositories are
/// rejected regardless of any other field.
pub fn service_from_webhook(webhook: &PushWebhook) -> Result<Service> {
    if webhook.repository.private {
        return Err(Error::Forbidden);
    }

    let branch = webhook
        .git_ref
        .as_deref()
        .map(branch_from_ref)
        .map(str::to_string)
        .unwrap_or_else(default_branch);

    Ok(Service {
        repository: webhook.repository.full_name.clone(),
        branch,
    })
}

/// `refs/<anything>/<branch>` → `<branch>`; anything else passes through.
fn branch_from_ref(git_ref: &str) -> &str {
    match git_ref.strip_prefix("refs/") {
        Some(rest) if rest.contains('/') => rest.rsplit('/').next().unwrap_or(rest),
        _ => git_ref,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webhook(git_ref: Option<&str>, private: bool) -> PushWebhook {
        PushWebhook {
            git_ref: git_ref.map(str::to_string),
            repository: WebhookRepository {
                full_name: "acme/app".to_string(),
                private,
            },
        }
    }

    #[test]
    fn branch_is_taken_from_the_ref() {
        let service = service_from_webhook(&webhook(Some("refs/heads/feature-x"), false)).unwrap();
        assert_eq!(service.repository, "acme/app");
        assert_eq!(service.branch, "feature-x");
    }

    #[test]
    fn nested_branch_names_keep_their_last_segment() {
        let service = service_from_webhook(&webhook(Some("refs/heads/feat/login"), false)).unwrap();
        assert_eq!(service.branch, "login");
    }

    #[test]
    fn absent_ref_defaults_to_master() {
        let service = service_from_webhook(&webhook(None, false)).unwrap();
        assert_eq!(service.branch, "master");
    }

    #[test]
    fn private_repositories_are_rejected() {
        assert!(matches!(
            service_from_webhook(&webhook(Some("refs/heads/master"), true)),
            Err(Error::Forbidden)
        ));
        assert!(matches!(
            service_from_webhook(&webhook(None, true)),
            Err(Error::Forbidden)
        ));
    }

    #[test]
    fn urls_are_built_from_the_repository_name() {
        assert_eq!(
            GitHubClient::repository_url("acme/app"),
            "https://github.com/acme/app"
        );
        assert_eq!(
            GitHubClient::clone_url("acme/app"),
            "https://github.com/acme/app.git"
        );
        assert_eq!(
            GitHubClient::descriptor_url("acme/app", "dev"),
            "https://raw.githubusercontent.com/acme/app/dev/service.json"
        );
    }
}
