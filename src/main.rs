use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use securewatch::config::Config;
use securewatch::{Runtime, db};

// Process exit codes: 0 normal, 1 startup failure, 2 config validation
// failure, 3 unrecoverable backend loss
const EXIT_STARTUP_FAILURE: u8 = 1;
const EXIT_CONFIG_FAILURE: u8 = 2;
const EXIT_BACKEND_LOSS: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration error: {}", err);
            return ExitCode::from(EXIT_CONFIG_FAILURE);
        }
    };

    let _log_guard = match init_tracing(&config) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Failed to initialize logging: {}", err);
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    tracing::info!("SecureWatch starting up");
    tracing::info!("Configuration loaded successfully");

    let pool = match db::create_pool(&config.stores.relational_url).await {
        Ok(pool) => pool,
        Err(err) => {
            tracing::error!("Failed to connect to the relational store: {}", err);
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };
    tracing::info!("Relational store pool created");

    if let Err(err) = db::run_migrations(&pool).await {
        tracing::error!("Migration failure: {}", err);
        return ExitCode::from(EXIT_STARTUP_FAILURE);
    }
    tracing::info!("Schema migrations applied");

    let runtime = match Runtime::new(config, pool).await {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!("Failed to wire the runtime: {}", err);
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    let scheduler = runtime.spawn_background_tasks();
    tracing::info!(
        "Started {} background tasks, {} correlation workers",
        scheduler.task_count(),
        runtime.config.correlation.concurrency
    );
    tracing::info!("SecureWatch is ready");

    // Health relay loop doubles as the unrecoverable-loss watchdog:
    // losing both backends for several consecutive checks ends the
    // process with the dedicated exit code.
    let mut lost_checks = 0u32;
    let exit_code = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break ExitCode::SUCCESS;
            }
            _ = tokio::time::sleep(Duration::from_secs(5)) => {
                if runtime.relay_health() {
                    lost_checks = 0;
                } else {
                    lost_checks += 1;
                    tracing::error!(
                        "Both backends unhealthy ({} consecutive checks)",
                        lost_checks
                    );
                    if lost_checks >= 6 {
                        tracing::error!("Unrecoverable backend loss, exiting");
                        break ExitCode::from(EXIT_BACKEND_LOSS);
                    }
                }
            }
        }
    };

    scheduler.shutdown();
    for (name, stats) in scheduler.stats() {
        tracing::debug!(
            "Maintenance task '{}' ran {} times ({} failures)",
            name,
            stats.runs,
            stats.failures
        );
    }
    runtime.dual_writer.flush_search().await;
    tracing::info!("SecureWatch stopped");
    exit_code
}

fn init_tracing(
    config: &Config,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, anyhow::Error> {
    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("securewatch.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
        Ok(Some(guard))
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
        Ok(None)
    }
}
