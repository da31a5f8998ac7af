mod args;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use sonic_controller::backend::kube::{KubeLabelApi, KubePodDirectory, KubeServiceApi};
use sonic_controller::backend::pools::StorePoolApi;
use sonic_controller::backend::triton::TritonClient;
use sonic_controller::backend::{ServerDirectory, StaticDirectory};
use sonic_controller::config::ControllerConfig;
use sonic_controller::controller::{self, Backends};
use sonic_controller::handlers;
use sonic_meta::{EtcdMetaStore, MemoryMetaStore, MetaStore};

use crate::args::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let tracer = sonic_common::telemetry::init_tracing(
        "sonic-controller",
        args.otlp_url.as_deref(),
        args.otlp_token.as_deref(),
        &args.log_format,
    );

    let mut cfg = ControllerConfig::load(&args.config)?;
    if let Some(ns) = &args.namespace {
        cfg.namespace = ns.clone();
    }
    let instance_id = uuid::Uuid::new_v4().to_string();
    info!(%instance_id, release = %cfg.release_name, namespace = %cfg.namespace, "sonic-controller starting");

    let store: Arc<dyn MetaStore> = if args.store == "memory" {
        info!("using process-local metadata store");
        Arc::new(MemoryMetaStore::new())
    } else {
        let etcd = EtcdMetaStore::connect(std::slice::from_ref(&args.store)).await?;
        info!(endpoint = %args.store, "connected to etcd");
        Arc::new(etcd)
    };

    let kube = kube::Client::try_default()
        .await
        .context("failed to build kubernetes client")?;

    let triton = Arc::new(TritonClient::new(
        cfg.ports.http,
        cfg.ports.metrics,
        Duration::from_millis(cfg.request_timeout_ms),
    )?);

    let directory: Arc<dyn ServerDirectory> = if cfg.servers.is_empty() {
        let selector = cfg.selector();
        info!(%selector, "discovering servers from pods");
        Arc::new(KubePodDirectory::new(kube.clone(), &cfg.namespace, &selector))
    } else {
        info!(servers = cfg.servers.len(), "using static server list");
        Arc::new(StaticDirectory::new(cfg.servers.clone()))
    };

    let backends = Backends {
        directory,
        metrics_source: triton.clone(),
        control: triton,
        labels: Arc::new(KubeLabelApi::new(kube.clone(), &cfg.namespace)),
        pools: Arc::new(StorePoolApi::new(store.clone())),
        services: Arc::new(KubeServiceApi::new(kube, &cfg.namespace)),
    };

    let (state, decisions) = controller::start(&cfg, store, backends, instance_id).await?;
    tokio::spawn(decisions.run());

    let app = handlers::router(state);
    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    info!(addr = %args.listen_addr, "status server listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await;

    if let Some(provider) = tracer {
        if let Err(e) = provider.shutdown() {
            error!(error = %e, "failed to flush spans");
        }
    }
    served?;
    Ok(())
}
