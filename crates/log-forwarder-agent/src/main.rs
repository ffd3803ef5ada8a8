// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;

use log_forwarder::{LogForwarder, LogForwarderConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
pub async fn main() {
    let debug = env::var("BS_DEBUG")
        .ok()
        .and_then(|value| value.parse::<bool>().ok())
        .unwrap_or(false);
    let log_level = if debug { "debug" } else { "info" };
    let env_filter = format!("hyper=off,reqwest=off,tungstenite=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = LogForwarderConfig::from_env();
    let forwarder = match LogForwarder::start(config).await {
        Ok(forwarder) => forwarder,
        Err(err) => {
            error!("unable to start log forwarder: {err}");
            std::process::exit(1);
        }
    };
    info!("log forwarder listening on {}", forwarder.bind_addr());

    wait_for_shutdown().await;
    info!("shutting down log forwarder");
    forwarder.stop().await;
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                error!("unable to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
