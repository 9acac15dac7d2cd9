pub mod api;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod key;
pub mod mutation;
pub mod persist;
pub mod retry;
pub mod session;
pub mod store;
pub mod telemetry;

pub use api::{HttpLiftApi, LiftApi, MockLiftApi};
pub use cache::{QueryCache, QueryObserver, QueryOptions, QueryState, QueryStatus};
pub use client::LiftClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClientConfig, ConfigError};
pub use error::{LiftError, LiftResult};
pub use events::{AuthEventBus, Subscription};
pub use key::{KeyFilter, QueryKey};
pub use persist::{CachePersister, PersistOptions};
pub use session::{AuthTokens, SessionHolder, SessionPhase, SessionState};
pub use store::{FileStore, KeyValueStore, MemoryStore};
