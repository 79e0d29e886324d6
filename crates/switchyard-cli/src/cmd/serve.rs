//! `switchyard serve`: run a router in the foreground.

use crate::cli::ServeArgs;
use crate::ui;
use std::path::PathBuf;
use switchyard_router::config::{default_config_path, load_config, try_load_config};
use switchyard_router::Router;
use switchyard_types::RouterConfig;

pub fn cmd_serve(config_path: Option<PathBuf>, args: ServeArgs) {
    // An explicit --config must load cleanly; the default location may be
    // absent.
    let (config, reload_path) = match config_path {
        Some(path) => match try_load_config(&path) {
            Ok(config) => (config, Some(path)),
            Err(e) => {
                ui::error_with_fix(&e.to_string(), "Fix the file or drop --config");
                std::process::exit(1);
            }
        },
        None => {
            let path = default_config_path();
            let reload_path = path.exists().then_some(path);
            (load_config(None), reload_path)
        }
    };

    let config = apply_overrides(config, &args);
    if let Err(e) = config.validate() {
        ui::error_with_fix(
            &e.to_string(),
            "Check --heartbeat-timeout and --eviction-timeout against the config file",
        );
        std::process::exit(1);
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to start runtime: {e}"));
            std::process::exit(1);
        }
    };

    rt.block_on(async move {
        let heartbeat = config.heartbeat_timeout_ms;
        let eviction = config.client_eviction_timeout_ms;
        let workers = config.worker_threads;
        let reserved = config.reserved.len();

        let (router, task) = match Router::start(config, reload_path).await {
            Ok(started) => started,
            Err(e) => {
                ui::error(&format!("Router failed to start: {e}"));
                std::process::exit(1);
            }
        };

        ui::section("Switchyard router");
        ui::kv("Listening", &router.local_addr().to_string());
        ui::kv("Router id", &router.router_id().to_string());
        ui::kv("Heartbeat", &format!("{heartbeat} ms"));
        ui::kv("Eviction", &format!("{eviction} ms"));
        ui::kv("Workers", &workers.to_string());
        if reserved > 0 {
            ui::kv("Reserved", &reserved.to_string());
        }
        ui::blank();
        ui::hint("Press Ctrl+C to stop");

        if let Err(e) = tokio::signal::ctrl_c().await {
            ui::error(&format!("Failed to listen for Ctrl+C: {e}"));
        }
        router.shutdown();
        let _ = task.await;
        ui::success("Router stopped");
    });
}

/// Apply command-line overrides on top of file values.
pub fn apply_overrides(mut config: RouterConfig, args: &ServeArgs) -> RouterConfig {
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(ms) = args.heartbeat_timeout {
        config.heartbeat_timeout_ms = ms;
    }
    if let Some(ms) = args.eviction_timeout {
        config.client_eviction_timeout_ms = ms;
    }
    if let Some(n) = args.workers {
        config.worker_threads = n;
    }
    if let Some(n) = args.max_connections {
        config.max_connections = n;
    }
    config
}
