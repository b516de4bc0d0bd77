//! SRv6 mobile user-plane gateway daemon.
//!
//! Wires the configured network functions to their tunnel devices, hosts
//! the rules registry and exposes the HTTP control plane over it.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod control;

use crate::config::{Behavior, Config, Endpoint, Headend, Provider};
use anyhow::{Context as _, Result, bail};
use clap::Parser;
use netfunc::{
    EndpointGtp4, EndpointGtp6, HeadendGtp4, HeadendGtp6, NetFunc, PolicySource, RegistryKey,
    Runner,
};
use rules::{MemoryStore, RulesRegistry};
use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tun::TunDevice;

/// How long the control plane gets to drain on shutdown.
const HTTP_SHUTDOWN: Duration = Duration::from_secs(1);

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create tokio runtime");

    match runtime.block_on(try_main(cli)) {
        Ok(()) => {
            tracing::info!("Goodbye!");

            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e:#}");

            ExitCode::FAILURE
        }
    }
}

async fn try_main(cli: Cli) -> Result<()> {
    setup_logging(cli.log_format)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "srgwd starting"
    );

    let config = config::load(&cli.config)?;

    let registry = Arc::new(
        RulesRegistry::from_store(Arc::new(MemoryStore::new()))
            .context("Failed to hydrate the rules registry")?,
    );

    let mut runners = Vec::new();

    for headend in &config.headends {
        if headend.provider == Provider::Linux {
            tracing::info!(name = %headend.name, "Leaving Linux-provided headend to the kernel");
            continue;
        }

        let behavior = build_headend(headend, &config, &registry)
            .with_context(|| format!("Failed to set up headend {}", headend.name))?;

        runners.push(start_runner(behavior, &headend.name, config.mtu)?);
    }

    for endpoint in &config.endpoints {
        if endpoint.provider == Provider::Linux {
            tracing::info!(name = %endpoint.name, "Leaving Linux-provided endpoint to the kernel");
            continue;
        }

        let behavior = build_endpoint(endpoint, &config, &registry)
            .with_context(|| format!("Failed to set up endpoint {}", endpoint.name))?;

        runners.push(start_runner(behavior, &endpoint.name, config.mtu)?);
    }

    let listener = TcpListener::bind(config.http_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.http_address))?;

    tracing::info!(addr = %config.http_address, "Control plane listening");

    let http_cancel = CancellationToken::new();
    let server = axum::serve(listener, control::router(Arc::clone(&registry)))
        .with_graceful_shutdown({
            let cancel = http_cancel.clone();

            async move { cancel.cancelled().await }
        });
    let mut http = tokio::spawn(async move { server.await });

    shutdown_signal().await;
    tracing::info!("Shutting down");

    for runner in &mut runners {
        runner.stop().await;
    }

    http_cancel.cancel();

    match tokio::time::timeout(HTTP_SHUTDOWN, &mut http).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!("Control plane error: {e}"),
        Ok(Err(e)) => tracing::warn!("Control plane task failed: {e}"),
        Err(_elapsed) => {
            tracing::warn!("Control plane did not drain in time, dropping connections");
            http.abort();
        }
    }

    Ok(())
}

fn build_headend(
    headend: &Headend,
    config: &Config,
    registry: &Arc<RulesRegistry>,
) -> Result<NetFunc> {
    match headend.behavior {
        Behavior::HMGtp4D => {
            let source_prefix = headend
                .source_prefix
                .context("H.M.GTP4.D requires set-source-prefix")?;
            let (policy, endpoint_prefix_len) = policy_source(headend, registry)?;

            Ok(NetFunc::HeadendGtp4(HeadendGtp4::new(
                headend.to,
                policy,
                endpoint_prefix_len,
                source_prefix,
                config.hop_limit,
            )?))
        }
        Behavior::EndMGtp6D => {
            let source = headend
                .source_address
                .context("End.M.GTP6.D requires set-source-address")?;
            let (policy, endpoint_prefix_len) = policy_source(headend, registry)?;

            Ok(NetFunc::HeadendGtp6(HeadendGtp6::new(
                headend.to,
                policy,
                endpoint_prefix_len,
                source,
                config.hop_limit,
            )?))
        }
        Behavior::EndMGtp4E | Behavior::EndMGtp6E => bail!(
            "unsupported headend behavior ({}) with this provider ({})",
            headend.behavior,
            headend.provider
        ),
    }
}

fn build_endpoint(
    endpoint: &Endpoint,
    config: &Config,
    registry: &Arc<RulesRegistry>,
) -> Result<NetFunc> {
    match endpoint.behavior {
        Behavior::EndMGtp4E => Ok(NetFunc::EndpointGtp4(EndpointGtp4::new(
            endpoint.to,
            config.ttl,
        )?)),
        Behavior::EndMGtp6E => {
            let source = endpoint
                .source_address
                .context("End.M.GTP6.E requires set-source-address")?;

            Ok(NetFunc::EndpointGtp6(EndpointGtp6::new(
                endpoint.to,
                source,
                config.hop_limit,
                Arc::clone(registry),
            )?))
        }
        Behavior::HMGtp4D | Behavior::EndMGtp6D => bail!(
            "unsupported endpoint behavior ({}) with this provider ({})",
            endpoint.behavior,
            endpoint.provider
        ),
    }
}

fn policy_source(
    headend: &Headend,
    registry: &Arc<RulesRegistry>,
) -> Result<(PolicySource, u8)> {
    let endpoint_prefix_len = headend
        .policy
        .as_ref()
        .map(|p| p.endpoint_prefix_len)
        .unwrap_or(64);

    let source = match headend.provider {
        Provider::NextMnWithController => PolicySource::Registry {
            registry: Arc::clone(registry),
            key: RegistryKey::InnerSource,
        },
        Provider::NextMn | Provider::Linux => {
            let policy = headend
                .policy
                .as_ref()
                .context("a static policy is required without a controller")?;

            tracing::info!(
                bsid = %policy.bsid,
                segments = policy.segments.len(),
                "Installing static SR policy"
            );

            if let Some(matcher) = &policy.matcher {
                tracing::debug!(prefix = %matcher.prefix, "Policy is scoped to a match prefix");
            }

            PolicySource::Static(policy.segments.clone())
        }
    };

    Ok((source, endpoint_prefix_len))
}

fn start_runner(behavior: NetFunc, iface: &str, mtu: Option<u32>) -> Result<Runner> {
    let device = TunDevice::open(iface)
        .with_context(|| format!("Failed to attach to TUN device {iface}"))?;

    if let Some(mtu) = mtu {
        device
            .set_mtu(mtu)
            .with_context(|| format!("Failed to set MTU on {iface}"))?;
    }

    device
        .set_up(true)
        .with_context(|| format!("Failed to bring {iface} up"))?;

    let mut runner = Runner::new(behavior);
    runner.start(device);

    Ok(runner)
}

fn setup_logging(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
        LogFormat::Human => builder.try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to set up logging: {e}"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration.
    #[arg(short = 'c', long, env = "SRGWD_CONFIG")]
    config: PathBuf,

    #[arg(long, env = "SRGWD_LOG_FORMAT", default_value_t = LogFormat::Human)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum LogFormat {
    Json,
    Human,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Json => write!(f, "json"),
            LogFormat::Human => write!(f, "human"),
        }
    }
}
