use std::sync::Arc;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use shared::{
    domain::Role,
    error::ApiException,
    protocol::{AuthenticationResponse, LoginRequest, RegisterRequest},
};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{config::Settings, error::ClientError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub username: String,
    pub role: Role,
    pub full_name: Option<String>,
}

#[derive(Debug, Clone)]
struct Credentials {
    token: String,
    user: AuthenticatedUser,
}

// Clones share one token, so a 401 seen by any clone logs all of them out.
#[derive(Clone)]
pub struct AuthSession {
    http: Client,
    settings: Arc<Settings>,
    credentials: Arc<RwLock<Option<Credentials>>>,
}

impl AuthSession {
    pub fn new(http: Client, settings: Arc<Settings>) -> Self {
        Self {
            http,
            settings,
            credentials: Arc::new(RwLock::new(None)),
        }
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthenticatedUser, ClientError> {
        let url = self
            .settings
            .endpoint(&format!("{}/login", self.settings.auth_path));
        let res = self
            .http
            .post(url)
            .json(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            let body = if body.trim().is_empty() {
                format!("Login failed ({})", status.as_u16())
            } else {
                body
            };
            return Err(ApiException::from_response(status.as_u16(), body).into());
        }

        let body: AuthenticationResponse = res.json().await?;
        let user = AuthenticatedUser {
            username: body.username,
            role: body.role,
            full_name: body.full_name,
        };
        info!(username = %user.username, role = ?user.role, "auth: logged in");
        *self.credentials.write().await = Some(Credentials {
            token: body.token,
            user: user.clone(),
        });
        Ok(user)
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<String, ClientError> {
        let url = self
            .settings
            .endpoint(&format!("{}/register", self.settings.auth_path));
        let res = self.http.post(url).json(request).send().await?;

        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        if !status.is_success() {
            let body = if body.trim().is_empty() {
                format!("Registration failed ({})", status.as_u16())
            } else {
                body
            };
            return Err(ApiException::from_response(status.as_u16(), body).into());
        }
        info!(username = %request.username, "auth: registered");
        Ok(body)
    }

    pub async fn logout(&self) {
        self.credentials.write().await.take();
    }

    pub async fn current_user(&self) -> Option<AuthenticatedUser> {
        self.credentials
            .read()
            .await
            .as_ref()
            .map(|creds| creds.user.clone())
    }

    pub async fn is_authenticated(&self) -> bool {
        self.credentials.read().await.is_some()
    }

    pub async fn send(&self, request: RequestBuilder) -> Result<Response, ClientError> {
        let token = self
            .credentials
            .read()
            .await
            .as_ref()
            .map(|creds| creds.token.clone());
        let request = match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let res = request.send().await?;
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }

        if status == StatusCode::UNAUTHORIZED {
            warn!("auth: server rejected token, clearing session");
            self.logout().await;
        }
        let body = res.text().await.unwrap_or_default();
        Err(ApiException::from_response(status.as_u16(), body).into())
    }
}
