use async_trait::async_trait;
use liftsync_core::api::types::LoginRequest;
use liftsync_core::{
    ClientConfig, KeyValueStore, LiftApi, LiftClient, LiftError, ManualClock, MockLiftApi,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub async fn start_client(
    config: &ClientConfig,
    store: Arc<dyn KeyValueStore>,
) -> (LiftClient, Arc<MockLiftApi>) {
    let mut mock = None;
    let client = LiftClient::start(config, store, Arc::new(ManualClock::default()), |_, bus| {
        let api = Arc::new(MockLiftApi::new(bus.clone()));
        mock = Some(api.clone());
        Ok(api as Arc<dyn LiftApi>)
    })
    .await
    .expect("client starts");
    (client, mock.expect("api constructed"))
}

pub fn credentials() -> LoginRequest {
    LoginRequest {
        identifier: "ada@example.com".into(),
        password: "hunter22".into(),
    }
}

/// Storage whose writes always fail; reads find nothing.
#[derive(Default)]
pub struct BrokenStore {
    pub writes: AtomicUsize,
}

#[async_trait]
impl KeyValueStore for BrokenStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, LiftError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &[u8]) -> Result<(), LiftError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(LiftError::storage("disk full"))
    }

    async fn remove(&self, _key: &str) -> Result<(), LiftError> {
        Err(LiftError::storage("disk full"))
    }
}
