use cronflow::api;
use cronflow::config::{Config, LogFormat};
use cronflow::db;
use cronflow::jobs::Manager;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod handlers;
use handlers::build_registry;

fn init_tracing(format: &LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;
    init_tracing(&cfg.log_format);

    tracing::info!(
        database_url = %cfg.database_url,
        worker_id = %cfg.worker_id,
        workers = cfg.workers,
        tick_ms = cfg.tick_interval_ms,
        api = cfg.admin_addr.as_deref().unwrap_or("disabled"),
        "cronflow starting"
    );

    let pool = db::make_pool(&cfg.database_url, &cfg.pool()).await?;
    let manager = Manager::open(pool, build_registry(&cfg), cfg.manager()).await?;
    manager.start()?;

    // ---- API task ----
    let api_shutdown = CancellationToken::new();
    let api_handle = cfg.admin_addr.clone().map(|addr| {
        let app = api::router(api::ApiState {
            manager: manager.clone(),
        });
        let stop = api_shutdown.clone();
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!("api listening on http://{addr}");
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await?;
            Ok::<(), anyhow::Error>(())
        })
    });

    // ---- wait for Ctrl-C or the API dying ----
    match api_handle {
        Some(mut handle) => {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res?;
                    api_shutdown.cancel();
                    manager.close().await;
                    handle.await??;
                }
                res = &mut handle => {
                    manager.close().await;
                    res??;
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            manager.close().await;
        }
    }

    tracing::info!("cronflow stopped");
    Ok(())
}
