use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use portfwd::config::{self, Settings};
use portfwd::shutdown::{ShutdownController, Termination};
use portfwd::Forwarder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings = Settings::load()?;
    if let Some(path) = std::env::args().nth(1) {
        settings = settings.with_rules_path(path);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| settings.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let rules = config::load_rules(&settings.rules_path)
        .with_context(|| format!("loading rules from {}", settings.rules_path.display()))?;
    tracing::info!(
        rules = rules.len(),
        policy = ?settings.shutdown_policy,
        "Configuration loaded"
    );

    // before any port opens, so an early SIGTERM still shuts down cleanly
    let termination = Termination::register().context("installing signal handlers")?;

    let controller = ShutdownController::new();
    let forwarder = Forwarder::bind(&rules, &settings, &controller).await?;
    let running = tokio::spawn(forwarder.run(controller.clone()));

    let waited = termination.wait().await;
    controller.stop();
    running.await.context("forwarder task failed")?;
    waited.context("waiting for termination signal")?;

    Ok(())
}
