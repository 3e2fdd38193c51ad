mod cli;
mod config;
mod error;
mod logging;
mod runner;
mod signals;
mod supervisor;

use std::future::ready;

use axum::routing::get;
use axum::Router;
use cmdq_common::metrics::{serve, setup_metrics_router};
use envconfig::Envconfig;
use health::HealthRegistry;
use time::Duration as TimeDuration;
use tokio_util::sync::CancellationToken;

use cli::{Cli, CliError};
use config::Config;

const SUPERVISOR_HEALTH_DEADLINE_SECS: i64 = 60;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match Cli::parse(args) {
        Ok(cli) => cli,
        Err(e @ CliError::Help) => {
            println!("{e}");
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("pg_cmdqd: {e}");
            std::process::exit(2);
        }
    };

    let config = Config::init_from_env().expect("invalid configuration");
    let log_level = cli.log_level.clone().unwrap_or(config.log_level.clone());
    let log_times = cli.log_times.unwrap_or(config.log_times.0);
    let _guard = logging::init(&log_level, log_times);

    let conn_str = match cli.connection_string.clone() {
        Some(s) => s,
        None => String::new(), // falls back to libpq PG* env vars via tokio_postgres's parser
    };

    let liveness = HealthRegistry::new("liveness");
    let supervisor_health = liveness
        .register(
            "supervisor".to_string(),
            TimeDuration::seconds(SUPERVISOR_HEALTH_DEADLINE_SECS),
        )
        .await;

    let root_cancel = CancellationToken::new();
    let shutdown_flag = signals::install(root_cancel.clone());

    let router_liveness = liveness.clone();
    let router_shutdown = shutdown_flag.clone();
    let router = Router::new()
        .route("/", get(|| ready("pg_cmdqd")))
        .route(
            "/_readiness",
            get(move || {
                ready(if router_shutdown.is_stopping() {
                    "draining"
                } else {
                    "pg_cmdqd"
                })
            }),
        )
        .route(
            "/_liveness",
            get(move || ready(router_liveness.get_status())),
        );
    let router = router.merge(setup_metrics_router());
    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            tracing::error!(error = %e, "metrics server exited");
        }
    });

    supervisor_health.report_healthy().await;
    let supervisor = supervisor::Supervisor::new(
        conn_str,
        cli.cmd_queues.clone(),
        root_cancel,
        liveness,
        cli.emit_sigusr1_when_ready,
    );
    supervisor.run().await;
}
