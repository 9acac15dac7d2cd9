use crate::cache::QueryCache;
use crate::error::LiftError;
use crate::events::{AuthEventBus, Subscription};
use crate::key::KeyFilter;
use crate::store::KeyValueStore;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex as AsyncMutex};

pub const SESSION_KEY: &str = "liftsync.session";
pub const ONBOARDING_KEY: &str = "liftsync.onboarding-complete";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
}

impl AuthTokens {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    pub fn is_well_formed(&self) -> bool {
        !self.access_token.trim().is_empty() && !self.refresh_token.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Uninitialized,
    Anonymous,
    Authenticated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user_id: Option<String>,
    pub onboarding_complete: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSession {
    #[serde(flatten)]
    tokens: AuthTokens,
    #[serde(default)]
    user_id: Option<String>,
}

struct InnerSession {
    phase: SessionPhase,
    state: SessionState,
    /// Bumped on every sign-in and sign-out. Deferred storage writes carry
    /// the generation they belong to and are dropped once it has moved on.
    generation: u64,
}

struct SessionShared {
    inner: RwLock<InnerSession>,
    store: Arc<dyn KeyValueStore>,
    cache: QueryCache,
    bus: AuthEventBus,
    subscription: Mutex<Option<Subscription>>,
    phase_tx: watch::Sender<SessionPhase>,
    persist_lock: AsyncMutex<()>,
}

/// Holds the signed-in identity for the running process.
///
/// Construct one per application (or per test), call [`SessionHolder::init`]
/// to hydrate it and [`SessionHolder::teardown`] to detach it from the bus.
#[derive(Clone)]
pub struct SessionHolder {
    shared: Arc<SessionShared>,
}

impl SessionHolder {
    pub fn new(store: Arc<dyn KeyValueStore>, cache: QueryCache, bus: AuthEventBus) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::Uninitialized);
        Self {
            shared: Arc::new(SessionShared {
                inner: RwLock::new(InnerSession {
                    phase: SessionPhase::Uninitialized,
                    state: SessionState::default(),
                    generation: 0,
                }),
                store,
                cache,
                bus,
                subscription: Mutex::new(None),
                phase_tx,
                persist_lock: AsyncMutex::new(()),
            }),
        }
    }

    /// Hydrate from storage and start listening for auth invalidation.
    pub async fn init(&self) -> SessionPhase {
        let onboarding_complete = self.read_onboarding_flag().await;
        let persisted = self.read_persisted_session().await;
        let phase = {
            let mut inner = self.shared.inner.write();
            inner.state.onboarding_complete = onboarding_complete;
            match persisted {
                Some(session) => {
                    inner.state.access_token = Some(session.tokens.access_token);
                    inner.state.refresh_token = Some(session.tokens.refresh_token);
                    inner.state.user_id = session.user_id;
                    inner.phase = SessionPhase::Authenticated;
                }
                None => inner.phase = SessionPhase::Anonymous,
            }
            inner.phase
        };
        self.shared.phase_tx.send_replace(phase);
        self.attach_to_bus();
        tracing::info!(?phase, "session initialized");
        phase
    }

    /// Stop reacting to auth invalidation events.
    pub fn teardown(&self) {
        if let Some(subscription) = self.shared.subscription.lock().take() {
            subscription.unsubscribe();
        }
    }

    pub async fn login(
        &self,
        tokens: AuthTokens,
        user_id: Option<String>,
        onboarding_complete: bool,
    ) -> Result<(), LiftError> {
        if !tokens.is_well_formed() {
            return Err(LiftError::Validation("login returned empty tokens".into()));
        }
        let guard = self.shared.persist_lock.lock().await;
        self.write_session(&tokens, user_id.clone()).await;
        self.persist_onboarding_flag(onboarding_complete).await;
        {
            let mut inner = self.shared.inner.write();
            inner.state = SessionState {
                access_token: Some(tokens.access_token),
                refresh_token: Some(tokens.refresh_token),
                user_id,
                onboarding_complete,
            };
            inner.phase = SessionPhase::Authenticated;
            inner.generation += 1;
        }
        drop(guard);
        self.shared
            .phase_tx
            .send_replace(SessionPhase::Authenticated);
        tracing::info!("session authenticated");
        Ok(())
    }

    /// Sign out: forget tokens, drop user data from the cache and clear the
    /// persisted session. Returns `false` if nobody was signed in.
    pub async fn logout(&self) -> bool {
        let Some(generation) = self.sign_out_local() else {
            return false;
        };
        self.clear_persisted_session(generation).await;
        true
    }

    /// Store tokens obtained from a refresh.
    pub async fn update_tokens(&self, tokens: AuthTokens) -> Result<(), LiftError> {
        if !tokens.is_well_formed() {
            return Err(LiftError::Validation("refresh returned empty tokens".into()));
        }
        let (generation, user_id) = {
            let mut inner = self.shared.inner.write();
            if inner.phase != SessionPhase::Authenticated {
                return Err(LiftError::Auth("no active session to refresh".into()));
            }
            inner.state.access_token = Some(tokens.access_token.clone());
            inner.state.refresh_token = Some(tokens.refresh_token.clone());
            (inner.generation, inner.state.user_id.clone())
        };
        self.persist_session(generation, &tokens, user_id).await;
        Ok(())
    }

    /// Record what the profile endpoint says about the current user.
    pub async fn apply_profile(&self, user_id: String, onboarding_complete: bool) {
        let (generation, changed_onboarding, tokens) = {
            let mut inner = self.shared.inner.write();
            if inner.phase != SessionPhase::Authenticated {
                return;
            }
            inner.state.user_id = Some(user_id.clone());
            let changed = inner.state.onboarding_complete != onboarding_complete;
            inner.state.onboarding_complete = onboarding_complete;
            let tokens = match (&inner.state.access_token, &inner.state.refresh_token) {
                (Some(access), Some(refresh)) => Some(AuthTokens::new(access, refresh)),
                _ => None,
            };
            (inner.generation, changed, tokens)
        };
        if let Some(tokens) = tokens {
            self.persist_session(generation, &tokens, Some(user_id)).await;
        }
        if changed_onboarding {
            self.persist_onboarding_flag(onboarding_complete).await;
        }
    }

    pub async fn set_onboarding_complete(&self, complete: bool) {
        self.shared.inner.write().state.onboarding_complete = complete;
        self.persist_onboarding_flag(complete).await;
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.inner.read().phase
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase() == SessionPhase::Authenticated
    }

    pub fn snapshot(&self) -> SessionState {
        self.shared.inner.read().state.clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.shared.inner.read().state.access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.shared.inner.read().state.refresh_token.clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionPhase> {
        self.shared.phase_tx.subscribe()
    }

    fn attach_to_bus(&self) {
        let mut slot = self.shared.subscription.lock();
        if slot.is_some() {
            return;
        }
        let weak: Weak<SessionShared> = Arc::downgrade(&self.shared);
        *slot = Some(self.shared.bus.subscribe(move || {
            if let Some(shared) = weak.upgrade() {
                SessionHolder { shared }.handle_auth_invalidated();
            }
        }));
    }

    fn handle_auth_invalidated(&self) {
        let Some(generation) = self.sign_out_local() else {
            tracing::debug!("auth invalidation while signed out; ignoring");
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let holder = self.clone();
                runtime.spawn(async move { holder.clear_persisted_session(generation).await });
            }
            Err(_) => tracing::warn!("no runtime available to clear persisted session"),
        }
    }

    /// Returns the generation that began with this sign-out, or `None` if
    /// nobody was signed in.
    fn sign_out_local(&self) -> Option<u64> {
        let generation = {
            let mut inner = self.shared.inner.write();
            if inner.phase != SessionPhase::Authenticated {
                return None;
            }
            let onboarding_complete = inner.state.onboarding_complete;
            inner.state = SessionState {
                onboarding_complete,
                ..SessionState::default()
            };
            inner.phase = SessionPhase::Anonymous;
            inner.generation += 1;
            inner.generation
        };
        self.shared.phase_tx.send_replace(SessionPhase::Anonymous);
        let dropped = self.shared.cache.remove_matching(&KeyFilter::UserScoped);
        tracing::info!(dropped, "session signed out");
        Some(generation)
    }

    fn generation(&self) -> u64 {
        self.shared.inner.read().generation
    }

    async fn read_onboarding_flag(&self) -> bool {
        match self.shared.store.get(ONBOARDING_KEY).await {
            Ok(Some(bytes)) => serde_json::from_slice::<bool>(&bytes).unwrap_or(false),
            Ok(None) => false,
            Err(err) => {
                tracing::warn!(%err, "failed to read onboarding flag");
                false
            }
        }
    }

    async fn read_persisted_session(&self) -> Option<PersistedSession> {
        let bytes = match self.shared.store.get(SESSION_KEY).await {
            Ok(bytes) => bytes?,
            Err(err) => {
                tracing::warn!(%err, "failed to read persisted session");
                return None;
            }
        };
        match serde_json::from_slice::<PersistedSession>(&bytes) {
            Ok(session) if session.tokens.is_well_formed() => Some(session),
            _ => {
                tracing::warn!("discarding malformed persisted session");
                self.remove_session_blob().await;
                None
            }
        }
    }

    /// Write tokens unless the session they came from has already ended.
    async fn persist_session(
        &self,
        generation: u64,
        tokens: &AuthTokens,
        user_id: Option<String>,
    ) {
        let _guard = self.shared.persist_lock.lock().await;
        if self.generation() != generation {
            tracing::debug!(generation, "skipping session write for an ended session");
            return;
        }
        self.write_session(tokens, user_id).await;
    }

    async fn write_session(&self, tokens: &AuthTokens, user_id: Option<String>) {
        let session = PersistedSession {
            tokens: tokens.clone(),
            user_id,
        };
        let result = match serde_json::to_vec(&session) {
            Ok(bytes) => self.shared.store.set(SESSION_KEY, &bytes).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = result {
            tracing::warn!(%err, "failed to persist session; continuing in memory");
        }
    }

    async fn persist_onboarding_flag(&self, complete: bool) {
        let bytes = if complete { b"true".as_slice() } else { b"false".as_slice() };
        if let Err(err) = self.shared.store.set(ONBOARDING_KEY, bytes).await {
            tracing::warn!(%err, "failed to persist onboarding flag");
        }
    }

    /// Remove stored tokens unless a newer sign-in has replaced them.
    async fn clear_persisted_session(&self, generation: u64) {
        let _guard = self.shared.persist_lock.lock().await;
        if self.generation() != generation {
            tracing::debug!(generation, "newer session persisted; keeping stored tokens");
            return;
        }
        self.remove_session_blob().await;
    }

    async fn remove_session_blob(&self) {
        if let Err(err) = self.shared.store.remove(SESSION_KEY).await {
            tracing::warn!(%err, "failed to clear persisted session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheDefaults;
    use crate::clock::ManualClock;
    use crate::key::QueryKey;
    use crate::store::MemoryStore;

    fn holder(store: MemoryStore) -> (SessionHolder, QueryCache, AuthEventBus) {
        let cache = QueryCache::new(CacheDefaults::default(), Arc::new(ManualClock::default()));
        let bus = AuthEventBus::new();
        let holder = SessionHolder::new(Arc::new(store), cache.clone(), bus.clone());
        (holder, cache, bus)
    }

    #[tokio::test]
    async fn init_without_tokens_is_anonymous() {
        let (session, _, _) = holder(MemoryStore::new());
        assert_eq!(session.phase(), SessionPhase::Uninitialized);
        assert_eq!(session.init().await, SessionPhase::Anonymous);
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn init_restores_persisted_tokens_and_flag() {
        let store = MemoryStore::new();
        store
            .set(
                SESSION_KEY,
                br#"{"accessToken":"a1","refreshToken":"r1","userId":"u-7"}"#,
            )
            .await
            .unwrap();
        store.set(ONBOARDING_KEY, b"true").await.unwrap();
        let (session, _, _) = holder(store);

        assert_eq!(session.init().await, SessionPhase::Authenticated);
        let state = session.snapshot();
        assert_eq!(state.access_token.as_deref(), Some("a1"));
        assert_eq!(state.user_id.as_deref(), Some("u-7"));
        assert!(state.onboarding_complete);
    }

    #[tokio::test]
    async fn malformed_tokens_are_discarded() {
        let store = MemoryStore::new();
        store
            .set(SESSION_KEY, br#"{"accessToken":"","refreshToken":"r1"}"#)
            .await
            .unwrap();
        let (session, _, _) = holder(store.clone());
        assert_eq!(session.init().await, SessionPhase::Anonymous);
        assert!(!store.contains(SESSION_KEY));
    }

    #[tokio::test]
    async fn logout_clears_tokens_and_user_data() {
        let store = MemoryStore::new();
        let (session, cache, _) = holder(store.clone());
        session.init().await;
        session
            .login(AuthTokens::new("a", "r"), Some("u-1".into()), false)
            .await
            .unwrap();
        assert!(store.contains(SESSION_KEY));
        cache.set_query_data(QueryKey::UserProfile, &"me").unwrap();
        cache.set_query_data(QueryKey::Interests, &"public").unwrap();

        assert!(session.logout().await);
        assert!(!session.logout().await);
        assert_eq!(session.phase(), SessionPhase::Anonymous);
        assert!(!store.contains(SESSION_KEY));
        assert!(!cache.contains(&QueryKey::UserProfile));
        assert!(cache.contains(&QueryKey::Interests));
    }

    #[tokio::test]
    async fn bus_event_signs_out_once() {
        let store = MemoryStore::new();
        let (session, _, bus) = holder(store.clone());
        session.init().await;
        session
            .login(AuthTokens::new("a", "r"), None, true)
            .await
            .unwrap();
        let mut phases = session.watch();
        phases.borrow_and_update();

        bus.publish();
        bus.publish();
        tokio::task::yield_now().await;

        assert!(phases.has_changed().unwrap());
        assert_eq!(*phases.borrow_and_update(), SessionPhase::Anonymous);
        assert!(!phases.has_changed().unwrap());
        assert!(!store.contains(SESSION_KEY));
        assert!(session.snapshot().onboarding_complete);
    }

    #[tokio::test]
    async fn sign_in_right_after_invalidation_keeps_new_tokens() {
        let store = MemoryStore::new();
        let (session, _, bus) = holder(store.clone());
        session.init().await;
        session
            .login(AuthTokens::new("a1", "r1"), Some("u-1".into()), false)
            .await
            .unwrap();

        bus.publish();
        session
            .login(AuthTokens::new("a2", "r2"), Some("u-1".into()), false)
            .await
            .unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(session.is_authenticated());
        let stored = store.raw(SESSION_KEY).expect("tokens persisted");
        let persisted: PersistedSession = serde_json::from_slice(&stored).unwrap();
        assert_eq!(persisted.tokens, AuthTokens::new("a2", "r2"));
    }

    #[tokio::test]
    async fn profile_arriving_after_sign_out_does_not_restore_tokens() {
        let store = MemoryStore::new();
        let (session, _, _) = holder(store.clone());
        session.init().await;
        session
            .login(AuthTokens::new("a", "r"), Some("u-1".into()), false)
            .await
            .unwrap();
        let generation = session.generation();
        assert!(session.logout().await);

        session
            .persist_session(generation, &AuthTokens::new("a", "r"), Some("u-1".into()))
            .await;
        assert!(!store.contains(SESSION_KEY));
    }

    #[tokio::test]
    async fn teardown_detaches_from_bus() {
        let (session, _, bus) = holder(MemoryStore::new());
        session.init().await;
        assert_eq!(bus.listener_count(), 1);
        session.init().await;
        assert_eq!(bus.listener_count(), 1);
        session.teardown();
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn empty_login_tokens_are_rejected() {
        let (session, _, _) = holder(MemoryStore::new());
        session.init().await;
        let result = session.login(AuthTokens::new("", "r"), None, false).await;
        assert!(matches!(result, Err(LiftError::Validation(_))));
        assert!(!session.is_authenticated());
    }
}
