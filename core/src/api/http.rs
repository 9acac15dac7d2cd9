use super::types::*;
use super::LiftApi;
use crate::config::ApiSettings;
use crate::error::LiftError;
use crate::events::AuthEventBus;
use crate::session::{AuthTokens, SessionHolder};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use url::Url;

/// reqwest-backed client for the Lift REST API.
///
/// Authenticated calls carry the session's bearer token. A 401/403 triggers
/// one refresh through `auth/refresh-token`; if that fails the auth bus is
/// notified and the call fails with [`LiftError::Auth`].
pub struct HttpLiftApi {
    client: Client,
    base_url: Url,
    session: SessionHolder,
    bus: AuthEventBus,
    refresh_lock: AsyncMutex<()>,
}

impl HttpLiftApi {
    pub fn new(
        settings: &ApiSettings,
        session: SessionHolder,
        bus: AuthEventBus,
    ) -> Result<Self, LiftError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|err| LiftError::unknown(format!("failed to build http client: {err}")))?;
        let mut base_url = settings.base_url.clone();
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client,
            base_url,
            session,
            bus,
            refresh_lock: AsyncMutex::new(()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, LiftError> {
        self.base_url
            .join(path)
            .map_err(|err| LiftError::unknown(format!("invalid endpoint {path}: {err}")))
    }

    async fn dispatch<F>(
        &self,
        method: &Method,
        path: &str,
        authenticated: bool,
        build: &F,
    ) -> Result<(Response, Option<String>), LiftError>
    where
        F: Fn(RequestBuilder) -> RequestBuilder + Send + Sync,
    {
        let mut request = self.client.request(method.clone(), self.endpoint(path)?);
        let token = if authenticated {
            self.session.access_token()
        } else {
            None
        };
        if let Some(token) = &token {
            request = request.bearer_auth(token);
        }
        let response = build(request).send().await.map_err(transport_error)?;
        Ok((response, token))
    }

    async fn call_with<T, F>(
        &self,
        method: Method,
        path: &str,
        authenticated: bool,
        build: F,
    ) -> Result<T, LiftError>
    where
        T: DeserializeOwned,
        F: Fn(RequestBuilder) -> RequestBuilder + Send + Sync,
    {
        let (mut response, token) = self.dispatch(&method, path, authenticated, &build).await?;
        if authenticated && is_auth_status(response.status()) {
            match self.refresh(token.as_deref()).await {
                Ok(()) => {
                    response = self.dispatch(&method, path, authenticated, &build).await?.0;
                }
                Err(err) => {
                    tracing::warn!(%err, path, "token refresh failed");
                }
            }
        }
        match decode(response).await {
            Err(LiftError::Auth(message)) if authenticated => {
                self.bus.publish();
                Err(LiftError::Auth(message))
            }
            other => other,
        }
    }

    async fn call<T, B>(
        &self,
        method: Method,
        path: &str,
        authenticated: bool,
        body: Option<&B>,
    ) -> Result<T, LiftError>
    where
        T: DeserializeOwned,
        B: Serialize + Sync + ?Sized,
    {
        self.call_with(method, path, authenticated, |request| match body {
            Some(body) => request.json(body),
            None => request,
        })
        .await
    }

    /// Exchange the refresh token. Concurrent callers that failed with the
    /// same stale token wait for a single refresh.
    async fn refresh(&self, stale_token: Option<&str>) -> Result<(), LiftError> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.session.access_token();
        if current.is_some() && current.as_deref() != stale_token {
            return Ok(());
        }
        let refresh_token = self
            .session
            .refresh_token()
            .ok_or_else(|| LiftError::Auth("no refresh token".into()))?;
        let tokens = self
            .refresh_token(&RefreshTokenRequest { refresh_token })
            .await?;
        self.session.update_tokens(tokens).await?;
        tracing::debug!("access token refreshed");
        Ok(())
    }
}

fn is_auth_status(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

fn transport_error(err: reqwest::Error) -> LiftError {
    if err.is_decode() {
        LiftError::unknown(err)
    } else {
        LiftError::network(err)
    }
}

/// Map an HTTP status to the error taxonomy.
pub(crate) fn categorize(status: StatusCode, message: String) -> LiftError {
    match status.as_u16() {
        400 | 404 | 409 | 422 => LiftError::Validation(message),
        401 | 403 => LiftError::Auth(message),
        408 => LiftError::Network(message),
        429 | 500..=599 => LiftError::Server(message),
        _ => LiftError::Unknown(message),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, LiftError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|err| LiftError::unknown(format!("unexpected response body: {err}")));
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .ok()
        .and_then(|envelope| envelope.message)
        .unwrap_or_else(|| format!("request failed with status {status}"));
    Err(categorize(status, message))
}

#[async_trait]
impl LiftApi for HttpLiftApi {
    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, LiftError> {
        self.call(Method::POST, "auth/login", false, Some(request))
            .await
    }

    async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, LiftError> {
        self.call(Method::POST, "auth/register", false, Some(request))
            .await
    }

    async fn refresh_token(&self, request: &RefreshTokenRequest) -> Result<AuthTokens, LiftError> {
        self.call(Method::POST, "auth/refresh-token", false, Some(request))
            .await
    }

    async fn verify_otp(&self, request: &VerifyOtpRequest) -> Result<AuthResponse, LiftError> {
        self.call(Method::POST, "auth/verify-otp", false, Some(request))
            .await
    }

    async fn resend_otp(&self, request: &ResendOtpRequest) -> Result<MessageResponse, LiftError> {
        self.call(Method::POST, "auth/resend-otp", false, Some(request))
            .await
    }

    async fn check_username(&self, username: &str) -> Result<UsernameAvailability, LiftError> {
        self.call_with(Method::GET, "users/username/check", false, |request| {
            request.query(&[("username", username)])
        })
        .await
    }

    async fn username_suggestions(&self, seed: &str) -> Result<Vec<String>, LiftError> {
        self.call_with(Method::GET, "users/username/suggestions", false, |request| {
            request.query(&[("seed", seed)])
        })
        .await
    }

    async fn get_profile(&self) -> Result<Profile, LiftError> {
        self.call::<_, ()>(Method::GET, "users/me", true, None).await
    }

    async fn update_profile(&self, request: &UpdateProfileRequest) -> Result<Profile, LiftError> {
        self.call(Method::PATCH, "users/me", true, Some(request))
            .await
    }

    async fn upload_avatar(&self, upload: &AvatarUpload) -> Result<AvatarResponse, LiftError> {
        if !upload.content_type.starts_with("image/") {
            return Err(LiftError::Validation(format!(
                "avatar must be an image, got {}",
                upload.content_type
            )));
        }
        self.call_with(Method::POST, "users/me/avatar", true, |request| {
            let part = Part::bytes(upload.bytes.clone())
                .file_name(upload.file_name.clone())
                .mime_str(&upload.content_type)
                .unwrap_or_else(|_| {
                    Part::bytes(upload.bytes.clone()).file_name(upload.file_name.clone())
                });
            request.multipart(Form::new().part("avatar", part))
        })
        .await
    }

    async fn get_interests(&self) -> Result<Vec<Interest>, LiftError> {
        self.call::<_, ()>(Method::GET, "interests", false, None)
            .await
    }

    async fn raise_lift(&self, request: &RaiseLiftRequest) -> Result<Lift, LiftError> {
        self.call(Method::POST, "lifts", true, Some(request)).await
    }

    async fn resolve_account_name(
        &self,
        account_number: &str,
        bank_code: &str,
    ) -> Result<AccountName, LiftError> {
        self.call_with(Method::GET, "banks/resolve", true, |request| {
            request.query(&[("accountNumber", account_number), ("bankCode", bank_code)])
        })
        .await
    }
}
