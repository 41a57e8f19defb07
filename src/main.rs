use anyhow::Result;
use resilient_db::config::{self, ObservabilityConfig};
use resilient_db::database::Session;
use resilient_db::{AppMetrics, DataLayer, Operation, Outcome};
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Probe the datastore once through the retry policy and print every statistic
#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load()?;
    init_tracing(&config.observability);

    let metrics = AppMetrics::with_config(Some(&config))?;
    let layer = DataLayer::from_config(config);

    if let Err(e) = layer.initialize().await {
        tracing::warn!(error = %e, "Initialization failed, probing anyway");
    }

    let probe = Operation::<u64>::read("get_liveness").default_value(0);
    let outcome = layer
        .policy()
        .execute_tagged(&probe, |session| Box::pin(async move { session.execute("SELECT 1").await }))
        .await;

    match &outcome {
        Ok(Outcome::Applied(_)) => tracing::info!("Datastore reachable"),
        Ok(other) => tracing::warn!(outcome = ?other, "Datastore unreachable, answered from fallback"),
        Err(e) => tracing::error!(error = %e, "Datastore unreachable"),
    }

    layer.record_metrics(&metrics);
    println!("{}", serde_json::to_string_pretty(&layer.stats())?);
    if std::env::args().any(|arg| arg == "--metrics") {
        println!("{}", metrics.render());
    }

    layer.shutdown().await;
    outcome?;
    Ok(())
}
