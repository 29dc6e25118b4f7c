use anyhow::Result;
use tracing::info;

use acheck_core::config::Config;
use acheck_core::evaluator::DefaultEvaluator;
use acheck_core::scheduler::Endpoint;
use acheck_core::tracing as trace_mod;

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = trace_mod::init_tracing() {
        eprintln!("failed to initialize tracing: {e}");
    }

    let config = Config::initialize()?;
    info!(
        hostname = %config.hostname,
        server = format!("{}:{}", config.server_host, config.server_port),
        "starting active check agent"
    );

    let mut endpoint = Endpoint::new(config, Box::new(DefaultEvaluator));
    endpoint.run().await?;

    Ok(())
}
