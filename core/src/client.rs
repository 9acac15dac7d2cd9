use crate::api::types::*;
use crate::api::{HttpLiftApi, LiftApi};
use crate::cache::{fetcher, Fetcher, QueryCache, QueryObserver, QueryOptions, QueryState};
use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::error::LiftError;
use crate::events::AuthEventBus;
use crate::key::{KeyFilter, QueryKey};
use crate::persist::{self, CachePersister};
use crate::session::{SessionHolder, SessionPhase};
use crate::store::{FileStore, KeyValueStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const USERNAME_STALE_TIME: Duration = Duration::from_secs(30);

/// Composition root: owns the cache, session, auth bus and API client, and
/// exposes the queries and mutations screens use.
pub struct LiftClient {
    api: Arc<dyn LiftApi>,
    cache: QueryCache,
    session: SessionHolder,
    bus: AuthEventBus,
    persister: CachePersister,
    gc_task: JoinHandle<()>,
}

impl LiftClient {
    /// Restore the cache, hydrate the session and start background tasks.
    /// `make_api` receives the session and bus so the endpoint client can
    /// attach tokens and report auth failures.
    pub async fn start<F>(
        config: &ClientConfig,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        make_api: F,
    ) -> Result<Self, LiftError>
    where
        F: FnOnce(&SessionHolder, &AuthEventBus) -> Result<Arc<dyn LiftApi>, LiftError>,
    {
        let cache = QueryCache::new(config.cache.clone(), clock);
        let bus = AuthEventBus::new();
        persist::restore(&cache, store.as_ref(), config.persistence.max_age).await;

        let session = SessionHolder::new(store.clone(), cache.clone(), bus.clone());
        if session.init().await != SessionPhase::Authenticated {
            cache.remove_matching(&KeyFilter::UserScoped);
        }
        let api = make_api(&session, &bus)?;

        let persister = CachePersister::spawn(cache.clone(), store, config.persistence.clone());
        let gc_task = cache.spawn_gc(config.gc_interval);
        Ok(Self {
            api,
            cache,
            session,
            bus,
            persister,
            gc_task,
        })
    }

    /// Production wiring: file-backed storage under `data_dir` and the HTTP API.
    pub async fn with_http(config: &ClientConfig, clock: Arc<dyn Clock>) -> Result<Self, LiftError> {
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(config.data_dir.clone()));
        let api_settings = config.api.clone();
        Self::start(config, store, clock, move |session, bus| {
            let api = HttpLiftApi::new(&api_settings, session.clone(), bus.clone())?;
            Ok(Arc::new(api) as Arc<dyn LiftApi>)
        })
        .await
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn session(&self) -> &SessionHolder {
        &self.session
    }

    pub fn bus(&self) -> &AuthEventBus {
        &self.bus
    }

    pub fn api(&self) -> &Arc<dyn LiftApi> {
        &self.api
    }

    fn profile_fetcher(&self) -> Fetcher {
        let api = self.api.clone();
        let session = self.session.clone();
        fetcher(move || {
            let api = api.clone();
            let session = session.clone();
            async move {
                let profile = api.get_profile().await?;
                session
                    .apply_profile(profile.id.clone(), profile.onboarding_complete)
                    .await;
                Ok::<_, LiftError>(profile)
            }
        })
    }

    fn profile_options(&self) -> QueryOptions {
        self.cache
            .options()
            .enabled(self.session.is_authenticated())
    }

    /// The signed-in user's profile; idle while signed out.
    pub fn profile(&self) -> QueryState<Profile> {
        self.cache.query(
            QueryKey::UserProfile,
            self.profile_fetcher(),
            &self.profile_options(),
        )
    }

    pub async fn fetch_profile(&self) -> Result<Profile, LiftError> {
        self.cache
            .fetch(
                QueryKey::UserProfile,
                self.profile_fetcher(),
                &self.profile_options(),
            )
            .await
    }

    pub fn observe_profile(&self) -> QueryObserver {
        self.cache.observe(
            QueryKey::UserProfile,
            self.profile_fetcher(),
            self.profile_options(),
        )
    }

    fn interests_fetcher(&self) -> Fetcher {
        let api = self.api.clone();
        fetcher(move || {
            let api = api.clone();
            async move { api.get_interests().await }
        })
    }

    pub fn interests(&self) -> QueryState<Vec<Interest>> {
        self.cache.query(
            QueryKey::Interests,
            self.interests_fetcher(),
            &self.cache.options(),
        )
    }

    pub async fn fetch_interests(&self) -> Result<Vec<Interest>, LiftError> {
        self.cache
            .fetch(
                QueryKey::Interests,
                self.interests_fetcher(),
                &self.cache.options(),
            )
            .await
    }

    fn username_check(&self, username: &str) -> (QueryKey, Fetcher, QueryOptions) {
        let username = username.trim().to_lowercase();
        let enabled = !username.is_empty();
        let api = self.api.clone();
        let key = QueryKey::UsernameAvailability {
            username: username.clone(),
        };
        let load = fetcher(move || {
            let api = api.clone();
            let username = username.clone();
            async move { api.check_username(&username).await }
        });
        let options = self
            .cache
            .options()
            .stale_time(USERNAME_STALE_TIME)
            .enabled(enabled);
        (key, load, options)
    }

    pub fn username_available(&self, username: &str) -> QueryState<UsernameAvailability> {
        let (key, load, options) = self.username_check(username);
        self.cache.query(key, load, &options)
    }

    pub async fn fetch_username_available(
        &self,
        username: &str,
    ) -> Result<UsernameAvailability, LiftError> {
        let (key, load, options) = self.username_check(username);
        self.cache.fetch(key, load, &options).await
    }

    fn suggestions(&self, seed: &str) -> (QueryKey, Fetcher, QueryOptions) {
        let seed = seed.trim().to_lowercase();
        let api = self.api.clone();
        let key = QueryKey::UsernameSuggestions { seed: seed.clone() };
        let enabled = !seed.is_empty();
        let load = fetcher(move || {
            let api = api.clone();
            let seed = seed.clone();
            async move { api.username_suggestions(&seed).await }
        });
        (key, load, self.cache.options().enabled(enabled))
    }

    pub fn username_suggestions(&self, seed: &str) -> QueryState<Vec<String>> {
        let (key, load, options) = self.suggestions(seed);
        self.cache.query(key, load, &options)
    }

    pub async fn fetch_username_suggestions(&self, seed: &str) -> Result<Vec<String>, LiftError> {
        let (key, load, options) = self.suggestions(seed);
        self.cache.fetch(key, load, &options).await
    }

    fn account_lookup(&self, account_number: &str, bank_code: &str) -> (QueryKey, Fetcher, QueryOptions) {
        let account_number = account_number.trim().to_string();
        let bank_code = bank_code.trim().to_string();
        let enabled = self.session.is_authenticated()
            && account_number.len() == 10
            && !bank_code.is_empty();
        let key = QueryKey::AccountName {
            account_number: account_number.clone(),
            bank_code: bank_code.clone(),
        };
        let api = self.api.clone();
        let load = fetcher(move || {
            let api = api.clone();
            let account_number = account_number.clone();
            let bank_code = bank_code.clone();
            async move { api.resolve_account_name(&account_number, &bank_code).await }
        });
        (key, load, self.cache.options().enabled(enabled))
    }

    /// Name on a bank account, resolved once the number is complete.
    pub fn account_name(&self, account_number: &str, bank_code: &str) -> QueryState<AccountName> {
        let (key, load, options) = self.account_lookup(account_number, bank_code);
        self.cache.query(key, load, &options)
    }

    pub async fn fetch_account_name(
        &self,
        account_number: &str,
        bank_code: &str,
    ) -> Result<AccountName, LiftError> {
        let (key, load, options) = self.account_lookup(account_number, bank_code);
        self.cache.fetch(key, load, &options).await
    }

    pub async fn login(&self, request: LoginRequest) -> Result<AuthResponse, LiftError> {
        let api = self.api.clone();
        let response = self
            .cache
            .mutate(
                move |request: LoginRequest| {
                    let api = api.clone();
                    async move { api.login(&request).await }
                },
                request,
                self.cache.mutation_options("login"),
            )
            .await?;
        self.sign_in(&response).await?;
        Ok(response)
    }

    /// Registration is never retried so a flaky network cannot create two accounts.
    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, LiftError> {
        let api = self.api.clone();
        self.cache
            .mutate(
                move |request: RegisterRequest| {
                    let api = api.clone();
                    async move { api.register(&request).await }
                },
                request,
                self.cache.mutation_options("register").no_retry(),
            )
            .await
    }

    pub async fn verify_otp(&self, request: VerifyOtpRequest) -> Result<AuthResponse, LiftError> {
        let api = self.api.clone();
        let response = self
            .cache
            .mutate(
                move |request: VerifyOtpRequest| {
                    let api = api.clone();
                    async move { api.verify_otp(&request).await }
                },
                request,
                self.cache.mutation_options("verify_otp").no_retry(),
            )
            .await?;
        self.sign_in(&response).await?;
        Ok(response)
    }

    pub async fn resend_otp(&self, request: ResendOtpRequest) -> Result<MessageResponse, LiftError> {
        let api = self.api.clone();
        self.cache
            .mutate(
                move |request: ResendOtpRequest| {
                    let api = api.clone();
                    async move { api.resend_otp(&request).await }
                },
                request,
                self.cache.mutation_options("resend_otp").no_retry(),
            )
            .await
    }

    pub async fn update_profile(&self, request: UpdateProfileRequest) -> Result<Profile, LiftError> {
        let api = self.api.clone();
        let onboarding = request.onboarding_complete;
        let profile = self
            .cache
            .mutate(
                move |request: UpdateProfileRequest| {
                    let api = api.clone();
                    async move { api.update_profile(&request).await }
                },
                request,
                self.cache
                    .mutation_options("update_profile")
                    .invalidates([QueryKey::UserProfile]),
            )
            .await?;
        if let Some(complete) = onboarding {
            self.session.set_onboarding_complete(complete).await;
        }
        Ok(profile)
    }

    pub async fn upload_avatar(&self, upload: AvatarUpload) -> Result<AvatarResponse, LiftError> {
        let api = self.api.clone();
        self.cache
            .mutate(
                move |upload: AvatarUpload| {
                    let api = api.clone();
                    async move { api.upload_avatar(&upload).await }
                },
                upload,
                self.cache
                    .mutation_options("upload_avatar")
                    .invalidates([QueryKey::UserProfile]),
            )
            .await
    }

    pub async fn raise_lift(&self, request: RaiseLiftRequest) -> Result<Lift, LiftError> {
        let api = self.api.clone();
        self.cache
            .mutate(
                move |request: RaiseLiftRequest| {
                    let api = api.clone();
                    async move { api.raise_lift(&request).await }
                },
                request,
                self.cache
                    .mutation_options("raise_lift")
                    .invalidates([QueryKey::UserProfile])
                    .on_success(|lift: &Lift, cache| {
                        let key = QueryKey::Lift {
                            id: lift.id.clone(),
                        };
                        if let Err(err) = cache.set_query_data(key, lift) {
                            tracing::warn!(%err, "failed to cache new lift");
                        }
                    }),
            )
            .await
    }

    pub async fn logout(&self) -> bool {
        self.session.logout().await
    }

    /// The app returned to the foreground.
    pub fn on_focus(&self) -> usize {
        self.cache.on_focus()
    }

    pub fn set_online(&self, online: bool) -> usize {
        self.cache.set_online(online)
    }

    /// Flush the cache to storage and stop background work.
    pub async fn shutdown(self) {
        self.gc_task.abort();
        self.session.teardown();
        self.persister.shutdown().await;
    }

    /// Establish the session, then start loading the profile in the background.
    async fn sign_in(&self, response: &AuthResponse) -> Result<(), LiftError> {
        self.session
            .login(
                response.tokens(),
                Some(response.user_id.clone()),
                response.onboarding_complete,
            )
            .await?;
        let _: QueryState<Profile> = self.profile();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockLiftApi;
    use crate::cache::QueryStatus;
    use crate::clock::ManualClock;
    use crate::persist::SNAPSHOT_KEY;
    use crate::session::SESSION_KEY;
    use crate::clock::SystemClock;
    use crate::store::MemoryStore;
    use serde_json::json;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn start_client(store: MemoryStore) -> (LiftClient, Arc<MockLiftApi>) {
        let mut mock = None;
        let client = LiftClient::start(
            &ClientConfig::default(),
            Arc::new(store),
            Arc::new(ManualClock::default()),
            |_, bus| {
                let api = Arc::new(MockLiftApi::new(bus.clone()));
                mock = Some(api.clone());
                Ok(api as Arc<dyn LiftApi>)
            },
        )
        .await
        .expect("client starts");
        (client, mock.expect("api constructed"))
    }

    fn credentials() -> LoginRequest {
        LoginRequest {
            identifier: "ada@example.com".into(),
            password: "hunter22".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn profile_waits_for_sign_in() {
        let (client, api) = start_client(MemoryStore::new()).await;
        let state = client.profile();
        assert_eq!(state.status, QueryStatus::Idle);
        assert_eq!(api.calls("get_profile"), 0);

        client.login(credentials()).await.unwrap();
        let profile = client.fetch_profile().await.unwrap();
        assert_eq!(profile.username, "ada");
        assert_eq!(client.session().snapshot().user_id.as_deref(), Some("user-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_signs_out_once() {
        let (client, api) = start_client(MemoryStore::new()).await;
        client.login(credentials()).await.unwrap();
        client.fetch_profile().await.unwrap();
        client.cache().invalidate(&[QueryKey::UserProfile]);
        api.fail_next("get_profile", LiftError::Auth("token expired".into()));

        let err = client.fetch_profile().await.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(api.calls("get_profile"), 2);
        assert!(!client.session().is_authenticated());
        assert!(!client.logout().await);
    }

    #[tokio::test(start_paused = true)]
    async fn profile_update_serves_stale_data_while_refetching() {
        let (client, api) = start_client(MemoryStore::new()).await;
        client.login(credentials()).await.unwrap();
        client.fetch_profile().await.unwrap();

        client
            .update_profile(UpdateProfileRequest {
                full_name: Some("Ada Lovelace".into()),
                ..UpdateProfileRequest::default()
            })
            .await
            .unwrap();

        let state = client.profile();
        assert_eq!(state.data.as_ref().map(|p| p.full_name.as_str()), Some("Ada Obi"));
        assert!(state.is_stale);
        assert!(state.is_fetching());

        let fresh = client.fetch_profile().await.unwrap();
        assert_eq!(fresh.full_name, "Ada Lovelace");
        assert_eq!(api.calls("get_profile"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn login_retries_a_network_blip() {
        let (client, api) = start_client(MemoryStore::new()).await;
        api.fail_next("login", LiftError::network("connection reset"));
        client.login(credentials()).await.unwrap();
        assert_eq!(api.calls("login"), 2);
        assert!(client.session().is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn registration_is_not_retried() {
        let (client, api) = start_client(MemoryStore::new()).await;
        api.fail_next("register", LiftError::network("connection reset"));
        let err = client
            .register(RegisterRequest {
                full_name: "Ada Obi".into(),
                email: "ada@example.com".into(),
                phone_number: Some("08030000000".into()),
                password: "hunter22".into(),
            })
            .await
            .unwrap_err();
        assert!(err.is_network());
        assert_eq!(api.calls("register"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn raised_lift_is_cached_by_id() {
        let (client, _api) = start_client(MemoryStore::new()).await;
        client.login(credentials()).await.unwrap();
        let lift = client
            .raise_lift(RaiseLiftRequest {
                title: "School fees".into(),
                description: "Second term".into(),
                kind: LiftKind::Monetary {
                    amount: 50_000,
                    currency: "NGN".into(),
                },
                anonymous: false,
            })
            .await
            .unwrap();
        let cached: Option<Lift> = client
            .cache()
            .get_query_data(&QueryKey::Lift { id: lift.id.clone() });
        assert_eq!(cached, Some(lift));
    }

    #[tokio::test(start_paused = true)]
    async fn account_lookup_needs_a_full_number() {
        let (client, api) = start_client(MemoryStore::new()).await;
        client.login(credentials()).await.unwrap();
        let state = client.account_name("01234", "058");
        assert_eq!(state.status, QueryStatus::Idle);
        let account = client.fetch_account_name("0123456789", "058").await.unwrap();
        assert_eq!(account.account_name, "ADA OBI");
        assert_eq!(api.calls("resolve_account_name"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_restores_cache_from_storage() {
        let store = MemoryStore::new();
        let (client, _api) = start_client(store.clone()).await;
        client.fetch_interests().await.unwrap();
        client.shutdown().await;
        assert!(store.contains(SNAPSHOT_KEY));

        let (client, api) = start_client(store).await;
        let interests = client.fetch_interests().await.unwrap();
        assert_eq!(interests.len(), 4);
        assert_eq!(api.calls("get_interests"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_without_session_drops_user_data() {
        let store = MemoryStore::new();
        let (client, _api) = start_client(store.clone()).await;
        client.login(credentials()).await.unwrap();
        client.fetch_profile().await.unwrap();
        client.shutdown().await;

        store.remove(SESSION_KEY).await.unwrap();
        let (client, _api) = start_client(store).await;
        assert!(!client.session().is_authenticated());
        assert!(!client.cache().contains(&QueryKey::UserProfile));
    }

    #[tokio::test]
    async fn http_wiring_reads_from_the_configured_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/interests"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"id": "i-1", "name": "Rent"}])),
            )
            .expect(1)
            .mount(&server)
            .await;
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut config = ClientConfig::default();
        config.api.base_url = Url::parse(&format!("{}/v1/", server.uri())).unwrap();
        config.data_dir = temp_dir.path().to_path_buf();

        let client = LiftClient::with_http(&config, Arc::new(SystemClock))
            .await
            .unwrap();
        assert!(!client.session().is_authenticated());
        let interests = client.fetch_interests().await.unwrap();
        assert_eq!(interests[0].name, "Rent");
        client.shutdown().await;

        assert!(temp_dir
            .path()
            .join(format!("{SNAPSHOT_KEY}.json"))
            .exists());
    }
}
