// Copyright 2024 The Warmgate Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mimalloc::MiMalloc;
use tokio::net::TcpListener;
#[cfg(target_family = "unix")]
use tokio::signal::unix::{SignalKind, signal};
use tracing::{Level, event};
use warmgate_config::GatewayConfig;
use warmgate_error::{Error, ResultExt};
use warmgate_pool::pool_registry::PoolRegistry;
use warmgate_service::{GatewayState, gateway_server, worker_socket_server};
use warmgate_store::user_dir_store::UserDirStore;
use warmgate_util::init_tracing;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Gateway brokering pre-warmed workers to user sessions.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Port to listen on. Overrides GATEWAY_PORT.
    #[clap(long)]
    port: Option<u16>,

    /// Mount path for user directories. Overrides STORE_MOUNT_PATH.
    #[clap(long)]
    mount_path: Option<PathBuf>,

    /// Deployment environment tag. Overrides ENVIRONMENT.
    #[clap(long)]
    environment: Option<String>,
}

async fn inner_main(config: GatewayConfig) -> Result<(), Error> {
    let registry = Arc::new(PoolRegistry::new(config.environment.clone()));
    let store = Arc::new(UserDirStore::new(
        config.mount_path.clone(),
        config.environment.clone(),
    ));
    if !store.is_mounted().await {
        event!(
            Level::WARN,
            mount_path = ?store.mount_path(),
            "User directory mount is not present, provisioning will fail until it appears"
        );
    }

    let state = GatewayState {
        registry: registry.clone(),
        store,
    };
    let router =
        gateway_server::routes(state.clone()).merge(worker_socket_server::routes(state));

    // Keep the guard alive for the lifetime of the server.
    let _timeout_sweeper = (config.worker_timeout_s > 0).then(|| {
        worker_socket_server::spawn_timeout_sweeper(
            &registry,
            Duration::from_secs(config.worker_timeout_s),
        )
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = TcpListener::bind(addr)
        .await
        .err_tip(|| format!("Failed to bind {addr}"))?;
    event!(
        Level::INFO,
        port = config.listen_port,
        environment = config.environment,
        worker_timeout_s = config.worker_timeout_s,
        "Gateway listening"
    );
    axum::serve(listener, router)
        .await
        .err_tip(|| "Gateway server failed")
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;
    let args = Args::parse();
    let mut config = GatewayConfig::from_env()?;
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if let Some(mount_path) = args.mount_path {
        config.mount_path = mount_path;
    }
    if let Some(environment) = args.environment {
        config.environment = environment;
    }

    #[allow(clippy::disallowed_methods)]
    {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;

        runtime.spawn(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen to SIGINT");
            event!(Level::WARN, "Process terminated via SIGINT");
            std::process::exit(130);
        });

        #[cfg(target_family = "unix")]
        runtime.spawn(async move {
            signal(SignalKind::terminate())
                .expect("Failed to listen to SIGTERM")
                .recv()
                .await;
            event!(Level::WARN, "Process terminated via SIGTERM");
            std::process::exit(143);
        });

        runtime
            .block_on(inner_main(config))
            .err_tip(|| "main() function failed")?;
    }
    Ok(())
}
