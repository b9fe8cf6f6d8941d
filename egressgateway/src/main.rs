use std::future::Future;
use std::net::SocketAddr;

use clap::Parser;
use egressgateway::config::{Cli, Commands};
use egressgateway::{Error, Result, http};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_subscriber();
    let cancel = CancellationToken::new();
    let ready = CancellationToken::new();
    match cli.command {
        Commands::Controller(args) => {
            let client = kube::Client::try_default().await?;
            let config = args.to_config();
            let component = egress_controller::start_controllers(
                client,
                config,
                ready.clone(),
                cancel.child_token(),
            );
            run(
                "controller",
                args.common.metrics_address,
                ready,
                cancel,
                async move { component.await.map_err(Error::from) },
            )
            .await;
        }
        Commands::Agent(args) => {
            let client = kube::Client::try_default().await?;
            let config = args.to_config();
            let component =
                egress_agent::start_agent(client, config, ready.clone(), cancel.child_token());
            run(
                "agent",
                args.common.metrics_address,
                ready,
                cancel,
                async move { component.await.map_err(Error::from) },
            )
            .await;
        }
        Commands::Crdgen => egress_crds::crd_gen_all()?,
    }
    Ok(())
}

/// Runs `component` next to the metrics server until either exits or a
/// shutdown signal arrives.
async fn run<F>(
    name: &str,
    metrics_address: SocketAddr,
    ready: CancellationToken,
    cancel: CancellationToken,
    component: F,
) where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let mut metrics_handle = tokio::spawn(http::serve_metrics(
        metrics_address,
        ready.child_token(),
        cancel.child_token(),
    ));
    let mut component_handle = tokio::spawn(component);
    let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
    // watch for shutdown and errors
    tokio::select! {
        h = &mut metrics_handle => exit("metrics", h),
        h = &mut component_handle => exit(name, h),
        _ = &mut shutdown_handle => {
            cancel.cancel();
            let (metrics, component) = tokio::join!(metrics_handle, component_handle);
            exit("metrics", metrics);
            exit(name, component);
        },
    };
    cancel.cancel();
    info!("Exiting...");
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "egressgateway=info,egress_controller=info,egress_agent=info,egress_iptables=info,egress_layer2=info"
                .into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl_c: {e}");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {
          info!("captured SIGTERM signal");
        },
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
