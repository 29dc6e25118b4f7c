use std::env;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::CoreResult;

/// Initialize process-wide logging. Honors `LOG_FORMAT=json` and the
/// standard `RUST_LOG`/`EnvFilter` conventions.
pub fn init_tracing() -> CoreResult<()> {
    let subscriber = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "acheck_core=info".into()),
    );

    if env::var("LOG_FORMAT").unwrap_or_default() == "json" {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }

    Ok(())
}
