//! Chat notification transport: the `Notifier` contract and a Matrix implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "inwatch-notify";

pub const DEFAULT_HOMESERVER: &str = "https://matrix.org";
pub const DEFAULT_PASSWORD_ENV: &str = "MATRIX_PASSWORD";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification secret missing: set {var}")]
    SecretMissing { var: String },
    #[error("invalid homeserver url `{url}`: {message}")]
    InvalidHomeserver { url: String, message: String },
    #[error("login as {user} failed with status {status}: {body}")]
    Login {
        user: String,
        status: u16,
        body: String,
    },
    #[error("message rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, destination: &str, body: &str) -> Result<(), NotifyError>;

    /// Releases any session held by the notifier. Called once at the end of a run.
    async fn close(&self) {}
}

/// Reads a required secret from the environment; absent and empty are both missing.
pub fn read_secret(var: &str) -> Result<String, NotifyError> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(NotifyError::SecretMissing {
            var: var.to_string(),
        }),
    }
}

#[derive(Debug, Clone)]
pub struct MatrixConfig {
    pub homeserver: String,
    pub user: String,
    pub password_env: String,
    pub timeout: Duration,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            homeserver: DEFAULT_HOMESERVER.to_string(),
            user: String::new(),
            password_env: DEFAULT_PASSWORD_ENV.to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    identifier: LoginIdentifier<'a>,
    password: &'a str,
    initial_device_display_name: &'static str,
}

#[derive(Debug, Serialize)]
struct LoginIdentifier<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    user: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
}

#[derive(Debug, Serialize)]
struct TextMessage<'a> {
    msgtype: &'static str,
    body: &'a str,
}

/// Matrix client-server API notifier.
///
/// Logs in with a password on the first send, reuses the access token for the rest
/// of the run and logs out on [`Notifier::close`]. A token the server no longer
/// accepts is dropped so the next send logs in again.
pub struct MatrixNotifier {
    client: reqwest::Client,
    homeserver: Url,
    user: String,
    password: String,
    access_token: Mutex<Option<String>>,
}

impl MatrixNotifier {
    /// Builds a notifier whose password comes from `config.password_env`.
    pub fn from_env(config: MatrixConfig) -> Result<Self, NotifyError> {
        let password = read_secret(&config.password_env)?;
        Self::new(config, password)
    }

    pub fn new(config: MatrixConfig, password: String) -> Result<Self, NotifyError> {
        if password.is_empty() {
            return Err(NotifyError::SecretMissing {
                var: config.password_env,
            });
        }
        let homeserver =
            Url::parse(&config.homeserver).map_err(|e| NotifyError::InvalidHomeserver {
                url: config.homeserver.clone(),
                message: e.to_string(),
            })?;
        if homeserver.cannot_be_a_base() {
            return Err(NotifyError::InvalidHomeserver {
                url: config.homeserver,
                message: "not a base url".to_string(),
            });
        }
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            homeserver,
            user: config.user,
            password,
            access_token: Mutex::new(None),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.homeserver.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(["_matrix", "client", "v3"])
                .extend(segments);
        }
        url
    }

    async fn login(&self) -> Result<String, NotifyError> {
        let request = LoginRequest {
            kind: "m.login.password",
            identifier: LoginIdentifier {
                kind: "m.id.user",
                user: &self.user,
            },
            password: &self.password,
            initial_device_display_name: "inwatch",
        };
        let resp = self
            .client
            .post(self.endpoint(&["login"]))
            .json(&request)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::Login {
                user: self.user.clone(),
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let login: LoginResponse = resp.json().await?;
        info!(user = %self.user, "matrix session established");
        Ok(login.access_token)
    }

    async fn session_token(&self) -> Result<String, NotifyError> {
        let mut guard = self.access_token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }
        let token = self.login().await?;
        *guard = Some(token.clone());
        Ok(token)
    }
}

#[async_trait]
impl Notifier for MatrixNotifier {
    async fn send(&self, destination: &str, body: &str) -> Result<(), NotifyError> {
        let token = self.session_token().await?;
        let txn_id = Uuid::new_v4().to_string();
        let url = self.endpoint(&["rooms", destination, "send", "m.room.message", &txn_id]);

        let resp = self
            .client
            .put(url)
            .bearer_auth(&token)
            .json(&TextMessage {
                msgtype: "m.text",
                body,
            })
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            self.access_token.lock().await.take();
        }
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        debug!(room = destination, %txn_id, "matrix message delivered");
        Ok(())
    }

    async fn close(&self) {
        let Some(token) = self.access_token.lock().await.take() else {
            return;
        };
        let result = self
            .client
            .post(self.endpoint(&["logout"]))
            .bearer_auth(&token)
            .json(&serde_json::json!({}))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => debug!("matrix session closed"),
            Ok(resp) => warn!(status = resp.status().as_u16(), "matrix logout rejected"),
            Err(err) => warn!(error = %err, "matrix logout failed"),
        }
    }
}
