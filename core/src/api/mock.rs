use super::types::*;
use super::LiftApi;
use crate::error::LiftError;
use crate::events::AuthEventBus;
use crate::session::AuthTokens;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// In-memory implementation of the Lift API.
///
/// Failures can be scripted per operation. A scripted [`LiftError::Auth`]
/// behaves like an unrecoverable 401 on the real client: the auth bus is
/// notified before the error is returned.
pub struct MockLiftApi {
    bus: AuthEventBus,
    latency: Duration,
    state: Mutex<MockState>,
}

struct MockState {
    profile: Profile,
    taken_usernames: HashSet<String>,
    interests: Vec<Interest>,
    failures: HashMap<&'static str, VecDeque<LiftError>>,
    calls: HashMap<&'static str, usize>,
    lifts: Vec<Lift>,
}

impl MockLiftApi {
    pub fn new(bus: AuthEventBus) -> Self {
        let profile = Profile {
            id: "user-1".to_string(),
            username: "ada".to_string(),
            full_name: "Ada Obi".to_string(),
            email: "ada@example.com".to_string(),
            avatar_url: None,
            bio: None,
            interests: Vec::new(),
            onboarding_complete: false,
            lifts_raised: 0,
        };
        let interests = ["Education", "Health", "Rent", "Small business"]
            .iter()
            .enumerate()
            .map(|(idx, name)| Interest {
                id: format!("interest-{idx}"),
                name: name.to_string(),
            })
            .collect();
        Self {
            bus,
            latency: Duration::from_millis(20),
            state: Mutex::new(MockState {
                profile,
                taken_usernames: ["ada", "admin", "lift"].iter().map(|s| s.to_string()).collect(),
                interests,
                failures: HashMap::new(),
                calls: HashMap::new(),
                lifts: Vec::new(),
            }),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next call to `operation` fail with `error`.
    pub fn fail_next(&self, operation: &'static str, error: LiftError) {
        self.state
            .lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.state.lock().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn profile(&self) -> Profile {
        self.state.lock().profile.clone()
    }

    async fn enter(&self, operation: &'static str) -> Result<(), LiftError> {
        let scripted = {
            let mut state = self.state.lock();
            *state.calls.entry(operation).or_insert(0) += 1;
            state
                .failures
                .get_mut(operation)
                .and_then(|queue| queue.pop_front())
        };
        sleep(self.latency).await;
        match scripted {
            Some(err) => {
                if err.is_auth() {
                    self.bus.publish();
                }
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn issue_tokens(&self) -> AuthResponse {
        let state = self.state.lock();
        AuthResponse {
            access_token: format!("access-{}", Uuid::new_v4()),
            refresh_token: format!("refresh-{}", Uuid::new_v4()),
            user_id: state.profile.id.clone(),
            onboarding_complete: state.profile.onboarding_complete,
        }
    }
}

#[async_trait]
impl LiftApi for MockLiftApi {
    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, LiftError> {
        self.enter("login").await?;
        if request.password.is_empty() {
            return Err(LiftError::Validation("password is required".into()));
        }
        Ok(self.issue_tokens())
    }

    async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, LiftError> {
        self.enter("register").await?;
        if !request.email.contains('@') {
            return Err(LiftError::Validation("enter a valid email address".into()));
        }
        let mut state = self.state.lock();
        state.profile.email = request.email.clone();
        state.profile.full_name = request.full_name.clone();
        Ok(RegisterResponse {
            user_id: state.profile.id.clone(),
            otp_sent_to: request.email.clone(),
        })
    }

    async fn refresh_token(&self, request: &RefreshTokenRequest) -> Result<AuthTokens, LiftError> {
        self.enter("refresh_token").await?;
        if request.refresh_token.is_empty() {
            return Err(LiftError::Auth("refresh token missing".into()));
        }
        Ok(self.issue_tokens().tokens())
    }

    async fn verify_otp(&self, request: &VerifyOtpRequest) -> Result<AuthResponse, LiftError> {
        self.enter("verify_otp").await?;
        if request.otp.len() != 6 || !request.otp.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(LiftError::Validation("the code must be 6 digits".into()));
        }
        Ok(self.issue_tokens())
    }

    async fn resend_otp(&self, request: &ResendOtpRequest) -> Result<MessageResponse, LiftError> {
        self.enter("resend_otp").await?;
        Ok(MessageResponse {
            message: format!("A new code was sent to {}", request.email),
        })
    }

    async fn check_username(&self, username: &str) -> Result<UsernameAvailability, LiftError> {
        self.enter("check_username").await?;
        let normalized = username.trim().to_lowercase();
        let available = !self.state.lock().taken_usernames.contains(&normalized);
        Ok(UsernameAvailability {
            username: normalized,
            available,
        })
    }

    async fn username_suggestions(&self, seed: &str) -> Result<Vec<String>, LiftError> {
        self.enter("username_suggestions").await?;
        let seed = seed.trim().to_lowercase();
        let state = self.state.lock();
        Ok((1..=5)
            .map(|n| format!("{seed}{n}"))
            .filter(|name| !state.taken_usernames.contains(name))
            .take(3)
            .collect())
    }

    async fn get_profile(&self) -> Result<Profile, LiftError> {
        self.enter("get_profile").await?;
        Ok(self.state.lock().profile.clone())
    }

    async fn update_profile(&self, request: &UpdateProfileRequest) -> Result<Profile, LiftError> {
        self.enter("update_profile").await?;
        let mut state = self.state.lock();
        if let Some(username) = &request.username {
            let normalized = username.trim().to_lowercase();
            if normalized != state.profile.username && state.taken_usernames.contains(&normalized) {
                return Err(LiftError::Validation(format!("{normalized} is taken")));
            }
            state.taken_usernames.insert(normalized.clone());
            state.profile.username = normalized;
        }
        if let Some(full_name) = &request.full_name {
            state.profile.full_name = full_name.clone();
        }
        if let Some(bio) = &request.bio {
            state.profile.bio = Some(bio.clone());
        }
        if let Some(interests) = &request.interests {
            state.profile.interests = interests.clone();
        }
        if let Some(done) = request.onboarding_complete {
            state.profile.onboarding_complete = done;
        }
        Ok(state.profile.clone())
    }

    async fn upload_avatar(&self, upload: &AvatarUpload) -> Result<AvatarResponse, LiftError> {
        self.enter("upload_avatar").await?;
        if upload.bytes.is_empty() {
            return Err(LiftError::Validation("image is empty".into()));
        }
        let url = format!("https://cdn.example.com/avatars/{}", upload.file_name);
        self.state.lock().profile.avatar_url = Some(url.clone());
        Ok(AvatarResponse { avatar_url: url })
    }

    async fn get_interests(&self) -> Result<Vec<Interest>, LiftError> {
        self.enter("get_interests").await?;
        Ok(self.state.lock().interests.clone())
    }

    async fn raise_lift(&self, request: &RaiseLiftRequest) -> Result<Lift, LiftError> {
        self.enter("raise_lift").await?;
        if request.title.trim().is_empty() {
            return Err(LiftError::Validation("give your lift a title".into()));
        }
        if let LiftKind::Monetary { amount: 0, .. } = request.kind {
            return Err(LiftError::Validation("amount must be greater than zero".into()));
        }
        let mut state = self.state.lock();
        let lift = Lift {
            id: format!("lift-{}", Uuid::new_v4()),
            owner_id: state.profile.id.clone(),
            title: request.title.clone(),
            description: request.description.clone(),
            kind: request.kind.clone(),
            status: LiftStatus::Open,
            created_at: Utc::now(),
        };
        state.profile.lifts_raised += 1;
        state.lifts.push(lift.clone());
        Ok(lift)
    }

    async fn resolve_account_name(
        &self,
        account_number: &str,
        bank_code: &str,
    ) -> Result<AccountName, LiftError> {
        self.enter("resolve_account_name").await?;
        if account_number.len() != 10 {
            return Err(LiftError::Validation("account number must be 10 digits".into()));
        }
        let full_name = self.state.lock().profile.full_name.to_uppercase();
        Ok(AccountName {
            account_number: account_number.to_string(),
            bank_code: bank_code.to_string(),
            account_name: full_name,
        })
    }
}
