use super::support::{credentials, start_client, BrokenStore};
use liftsync_core::persist::SNAPSHOT_KEY;
use liftsync_core::{ClientConfig, FileStore, KeyValueStore, QueryKey};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("runtime")
}

#[test]
fn session_and_cache_survive_a_restart_on_disk() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let config = ClientConfig::default();

    runtime.block_on(async {
        let store = Arc::new(FileStore::new(temp_dir.path()));
        let (client, _api) = start_client(&config, store).await;
        client.login(credentials()).await.expect("login");
        client.fetch_profile().await.expect("profile");
        client.fetch_interests().await.expect("interests");
        client.shutdown().await;
    });
    assert!(temp_dir.path().read_dir().expect("list").count() >= 2);

    runtime.block_on(async {
        let store = Arc::new(FileStore::new(temp_dir.path()));
        let (client, api) = start_client(&config, store).await;
        assert!(client.session().is_authenticated());
        assert!(client.cache().contains(&QueryKey::UserProfile));
        let profile = client.fetch_profile().await.expect("cached profile");
        assert_eq!(profile.username, "ada");
        assert_eq!(api.calls("get_profile"), 0);
        client.shutdown().await;
    });
}

#[test]
fn corrupt_snapshot_starts_an_empty_cache() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");

    runtime.block_on(async {
        let store = Arc::new(FileStore::new(temp_dir.path()));
        store
            .set(SNAPSHOT_KEY, b"{\"entries\": [")
            .await
            .expect("write garbage");
        let (client, api) = start_client(&ClientConfig::default(), store).await;
        assert!(client.cache().is_empty());
        client.fetch_interests().await.expect("interests");
        assert_eq!(api.calls("get_interests"), 1);
        client.shutdown().await;
    });
}

#[tokio::test(start_paused = true)]
async fn storage_failures_are_not_fatal() {
    let store = Arc::new(BrokenStore::default());
    let (client, _api) = start_client(&ClientConfig::default(), store.clone()).await;

    client.login(credentials()).await.expect("login despite storage");
    assert!(client.session().is_authenticated());
    client.fetch_interests().await.expect("interests");
    assert!(client.logout().await);
    client.shutdown().await;

    assert!(store.writes.load(Ordering::SeqCst) > 0);
}
