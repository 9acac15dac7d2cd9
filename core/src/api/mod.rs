//! Remote endpoint client for the Lift backend.
//!
//! [`LiftApi`] is the seam the cache and session layers talk to. The HTTP
//! implementation lives in [`http`]; [`mock`] serves the same contract from
//! memory for tests and smoke runs.

pub mod http;
pub mod mock;
pub mod types;

use crate::error::LiftError;
use crate::session::AuthTokens;
use async_trait::async_trait;
use types::*;

pub use http::HttpLiftApi;
pub use mock::MockLiftApi;

#[async_trait]
pub trait LiftApi: Send + Sync {
    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, LiftError>;

    async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, LiftError>;

    async fn refresh_token(&self, request: &RefreshTokenRequest) -> Result<AuthTokens, LiftError>;

    async fn verify_otp(&self, request: &VerifyOtpRequest) -> Result<AuthResponse, LiftError>;

    async fn resend_otp(&self, request: &ResendOtpRequest) -> Result<MessageResponse, LiftError>;

    async fn check_username(&self, username: &str) -> Result<UsernameAvailability, LiftError>;

    async fn username_suggestions(&self, seed: &str) -> Result<Vec<String>, LiftError>;

    async fn get_profile(&self) -> Result<Profile, LiftError>;

    async fn update_profile(&self, request: &UpdateProfileRequest) -> Result<Profile, LiftError>;

    async fn upload_avatar(&self, upload: &AvatarUpload) -> Result<AvatarResponse, LiftError>;

    async fn get_interests(&self) -> Result<Vec<Interest>, LiftError>;

    async fn raise_lift(&self, request: &RaiseLiftRequest) -> Result<Lift, LiftError>;

    async fn resolve_account_name(
        &self,
        account_number: &str,
        bank_code: &str,
    ) -> Result<AccountName, LiftError>;
}
