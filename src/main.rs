use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod credentials;
mod git;
mod models;
mod sync;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "reposyncd=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    std::fs::create_dir_all(&config.git_clone_path)?;

    // Database
    let connect_opts = config
        .database_url
        .parse::<sqlx::postgres::PgConnectOptions>()?
        .statement_cache_capacity(0);
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect_with(connect_opts)
        .await?;

    tracing::info!("Connected to database");

    // ── Migration tracking ─────────────────────────────
    sqlx::raw_sql("CREATE TABLE IF NOT EXISTS _migrations (version INT PRIMARY KEY, applied_at TIMESTAMPTZ DEFAULT now())")
        .execute(&pool)
        .await?;

    let migrations: &[(i32, &str)] = &[(1, include_str!("../migrations/001_init.sql"))];

    for &(version, sql) in migrations {
        let applied: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM _migrations WHERE version = $1)")
            .bind(version)
            .fetch_one(&pool)
            .await
            .unwrap_or(false);
        if !applied {
            sqlx::raw_sql(sql).execute(&pool).await?;
            sqlx::query("INSERT INTO _migrations (version) VALUES ($1)")
                .bind(version)
                .execute(&pool)
                .await?;
            tracing::info!("Applied migration {}", version);
        }
    }
    tracing::info!("Migrations applied");

    // ── Shutdown signal ────────────────────────────────
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            tracing::info!("shutdown signal received, draining");
            shutdown.cancel();
        });
    }

    // ── Background components ──────────────────────────
    let scheduler = tokio::spawn(sync::scheduler::run(
        pool.clone(),
        config.scheduler_interval,
        shutdown.clone(),
    ));
    let reaper = tokio::spawn(sync::reaper::run(
        pool.clone(),
        config.reaper_interval,
        shutdown.clone(),
    ));
    let dispatcher = tokio::spawn(sync::dispatcher::run(
        pool.clone(),
        config.clone(),
        shutdown.clone(),
    ));

    tracing::info!(
        workers = config.sync_workers,
        clone_path = %config.git_clone_path.display(),
        "reposyncd running"
    );

    let _ = tokio::join!(scheduler, reaper, dispatcher);
    tracing::info!("reposyncd stopped");

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
