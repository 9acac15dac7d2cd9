use anyhow::Result;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

static SUBSCRIBER_GUARD: OnceLock<()> = OnceLock::new();

/// Log target of every event emitted by this crate (cache fetches, snapshot
/// writes, session transitions, bus listener panics).
pub const LOG_TARGET: &str = "liftsync_core";

/// Install the global tracing subscriber for a liftsync process.
///
/// Safe to call repeatedly; only the first call installs anything, so the
/// xtask binary and tests can both call it.
pub fn init_tracing(filter: EnvFilter) -> Result<()> {
    if SUBSCRIBER_GUARD.get().is_some() {
        return Ok(());
    }

    let subscriber = Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(true));
    tracing::subscriber::set_global_default(subscriber)?;
    SUBSCRIBER_GUARD.set(()).ok();

    Ok(())
}

/// `RUST_LOG` when set. Otherwise liftsync events at `level` and everything
/// else (reqwest, hyper) at `warn`.
pub fn default_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,{LOG_TARGET}={level}")))
}
