use super::support::{credentials, start_client};
use liftsync_core::api::types::UpdateProfileRequest;
use liftsync_core::session::SESSION_KEY;
use liftsync_core::{ClientConfig, KeyValueStore, LiftError, MemoryStore, QueryKey};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn concurrent_auth_failures_sign_out_once() {
    let store = MemoryStore::new();
    let (client, api) = start_client(&ClientConfig::default(), Arc::new(store.clone())).await;
    client.login(credentials()).await.expect("login");
    client.fetch_profile().await.expect("profile");
    client
        .update_profile(UpdateProfileRequest {
            onboarding_complete: Some(true),
            ..UpdateProfileRequest::default()
        })
        .await
        .expect("finish onboarding");
    assert!(store.contains(SESSION_KEY));

    let published = Arc::new(AtomicUsize::new(0));
    let counter = published.clone();
    let _subscription = client.bus().subscribe(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let mut phase = client.session().watch();
    phase.borrow_and_update();

    api.fail_next("get_profile", LiftError::Auth("token expired".into()));
    api.fail_next("resolve_account_name", LiftError::Auth("token expired".into()));
    let (profile, account) = tokio::join!(
        client.fetch_profile(),
        client.fetch_account_name("0123456789", "058"),
    );
    assert!(profile.unwrap_err().is_auth());
    assert!(account.unwrap_err().is_auth());
    assert_eq!(published.load(Ordering::SeqCst), 2);

    assert!(phase.has_changed().expect("session alive"));
    assert!(!client.session().is_authenticated());
    assert!(!client.logout().await);
    assert!(client.session().snapshot().onboarding_complete);

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(!store.contains(SESSION_KEY));
}

#[tokio::test(start_paused = true)]
async fn concurrent_reads_share_one_request() {
    let (client, api) =
        start_client(&ClientConfig::default(), Arc::new(MemoryStore::new())).await;
    let (a, b, c) = tokio::join!(
        client.fetch_interests(),
        client.fetch_interests(),
        client.fetch_interests(),
    );
    assert_eq!(a.expect("first"), b.expect("second"));
    assert_eq!(c.expect("third").len(), 4);
    assert_eq!(api.calls("get_interests"), 1);
}

#[tokio::test(start_paused = true)]
async fn logout_drops_only_user_scoped_queries() {
    let store = MemoryStore::new();
    let (client, _api) = start_client(&ClientConfig::default(), Arc::new(store.clone())).await;
    client.login(credentials()).await.expect("login");
    client.fetch_profile().await.expect("profile");
    client.fetch_interests().await.expect("interests");

    assert!(client.logout().await);
    assert!(!client.cache().contains(&QueryKey::UserProfile));
    assert!(client.cache().contains(&QueryKey::Interests));
    assert_eq!(store.get(SESSION_KEY).await.expect("read"), None);
}

#[tokio::test(start_paused = true)]
async fn failed_first_load_keeps_retrying_transient_errors() {
    let (client, api) =
        start_client(&ClientConfig::default(), Arc::new(MemoryStore::new())).await;
    api.fail_next("get_interests", LiftError::Server("bad gateway".into()));
    api.fail_next("get_interests", LiftError::network("timeout"));
    let interests = client.fetch_interests().await.expect("third attempt succeeds");
    assert_eq!(interests.len(), 4);
    assert_eq!(api.calls("get_interests"), 3);
}
