use std::{sync::Arc, time::Duration};

use clap::Parser;
use edge_relay::{
    config::{Config, resolve_config_path},
    dialer::DialerRegistry,
    http_forward::HttpForwardHandler,
    listener::{self, DynConnHandler, ListenerSpec},
    socks::SocksHandler,
    stream_proxy::StreamHandler,
    tunnel::{MemoryListeners, TunnelClient},
};
use n0_error::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// edge-relay: multi-protocol edge proxy.
#[derive(Parser)]
#[command(name = "edge-relay", version, about)]
struct Cli {
    /// Configuration file (YAML or JSON). Defaults to `$ENV.json` or
    /// `$ENV.yaml` in the working directory.
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let path = match resolve_config_path(cli.config) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("edge-relay: {err:#}");
            std::process::exit(1);
        }
    };
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("edge-relay: {path}: {err:#}");
            std::process::exit(1);
        }
    };

    let default_level = if config.global.log_level.is_empty() {
        "info".to_string()
    } else {
        config.global.log_level.clone()
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if let Err(err) = run(config).await {
        error!("fatal: {err:#}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    let keepalive = (config.global.tcp_keepalive > 0)
        .then(|| Duration::from_secs(config.global.tcp_keepalive));
    let local_dialer = edge_relay::dialer::DirectDialer {
        timeout: (config.global.dial_timeout > 0)
            .then(|| Duration::from_secs(config.global.dial_timeout)),
        read_buffer: config.global.dial_read_buffer,
        write_buffer: config.global.dial_write_buffer,
        ..Default::default()
    };
    let dialers = Arc::new(DialerRegistry::from_config(&config.dialer, local_dialer)?);
    let memory_listeners = Arc::new(MemoryListeners::new());
    let shutdown = CancellationToken::new();

    let mut tasks = tokio::task::JoinSet::new();

    for section in &config.http {
        let handler = DynConnHandler::new_arc(HttpForwardHandler::new(section, dialers.clone())?);
        for addr in &section.listen {
            tasks.spawn(listener::serve(
                ListenerSpec {
                    addr: addr.clone(),
                    proto: "http",
                    tls: None,
                    keepalive,
                    handler: handler.clone(),
                },
                shutdown.clone(),
            ));
        }
    }

    for section in &config.https {
        let handler = DynConnHandler::new_arc(HttpForwardHandler::new(section, dialers.clone())?);
        let tls = edge_relay::dialer::tls::server_config(
            &section.keyfile,
            &section.certfile,
            &[b"h2", b"http/1.1"],
        )?;
        for addr in &section.listen {
            tasks.spawn(listener::serve(
                ListenerSpec {
                    addr: addr.clone(),
                    proto: "https",
                    tls: Some(tls.clone()),
                    keepalive,
                    handler: handler.clone(),
                },
                shutdown.clone(),
            ));
        }
    }

    for section in &config.socks {
        let handler = DynConnHandler::new_arc(SocksHandler::new(section, dialers.clone())?);
        for addr in &section.listen {
            tasks.spawn(listener::serve(
                ListenerSpec {
                    addr: addr.clone(),
                    proto: "socks5",
                    tls: None,
                    keepalive,
                    handler: handler.clone(),
                },
                shutdown.clone(),
            ));
        }
    }

    for section in &config.stream {
        let handler = DynConnHandler::new_arc(StreamHandler::new(section, dialers.clone())?);
        let tls = if section.keyfile.is_empty() {
            None
        } else {
            Some(edge_relay::dialer::tls::server_config(
                &section.keyfile,
                &section.certfile,
                &[],
            )?)
        };
        for addr in &section.listen {
            tasks.spawn(listener::serve(
                ListenerSpec {
                    addr: addr.clone(),
                    proto: "stream",
                    tls: tls.clone(),
                    keepalive,
                    handler: handler.clone(),
                },
                shutdown.clone(),
            ));
        }
    }

    for section in &config.tunnel {
        let client = TunnelClient::new(section.clone(), dialers.clone(), memory_listeners.clone())?;
        let token = shutdown.clone();
        tasks.spawn(async move {
            client.run(token).await;
            Ok(())
        });
    }

    if tasks.is_empty() {
        return Err(n0_error::anyerr!("no listeners or tunnels configured"));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            shutdown.cancel();
        }
        Some(result) = tasks.join_next() => {
            shutdown.cancel();
            result.map_err(|err| n0_error::anyerr!(err))??;
        }
    }

    while tasks.join_next().await.is_some() {}
    Ok(())
}
