use clap::Parser;
use spancheck_core::{HarnessConfig, SpanSink, SystemClock};
use spancheck_harness::{Backends, Harness};
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "spancheck.toml")]
    config: String,

    /// Correlation marker for this run (random UUID if omitted)
    #[arg(long)]
    marker: Option<String>,

    /// Seconds to wait before the first ClickHouse poll
    #[arg(long)]
    settle_seconds: Option<u64>,

    /// Postgres wait budget in seconds
    #[arg(long)]
    row_wait: Option<u64>,

    /// ClickHouse wait budget in seconds, settle included
    #[arg(long)]
    column_wait: Option<u64>,

    #[arg(long)]
    skip_health: bool,
}

impl Args {
    fn apply(&self, config: &mut HarnessConfig) {
        if let Some(s) = self.settle_seconds {
            config.harness.column_settle_seconds = s;
        }
        if let Some(s) = self.row_wait {
            config.harness.row_max_wait_seconds = s;
        }
        if let Some(s) = self.column_wait {
            config.harness.column_max_wait_seconds = s;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, CI sets real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let mut config = match HarnessConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };
    args.apply(&mut config);

    // Init logging; RUST_LOG wins over the configured level
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level)),
        )
        .init();

    let backends = match Backends::from_config(&config) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Failed to set up the harness: {}", e);
            std::process::exit(1);
        }
    };
    tracing::debug!(mode = ?backends.exporter.mode(), "OTLP exporter ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let marker = args
        .marker
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let clock = SystemClock;
    let harness = Harness::new(
        &config,
        &backends.exporter,
        &backends.rows,
        &backends.columns,
        &clock,
    )
    .with_shutdown(shutdown_rx)
    .with_health_check(!args.skip_health);

    let report = harness.run(&marker).await;

    if let Err(e) = backends.exporter.shutdown(config.harness.flush_timeout()).await {
        tracing::warn!(error = %e, "Exporter shutdown failed");
    }

    println!("\n{}", report.render());
    std::process::exit(report.exit_code());
}
