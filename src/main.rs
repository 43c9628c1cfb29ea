use anyhow::Context;
use clap::Parser;
use std::sync::Arc;

use spotvortex_agent::{
    capacity::{AsgManager, AwsAsgApi, CapacityRouter, KarpenterManager, KubeNodeWatcher},
    cli::Cli,
    config::{self, RuntimeConfigHandle},
    controller::Reconciler,
    model::{manifest, FamilyAllowlist, InferenceEngine, ModelManifest},
    observability,
    telemetry::{LivePriceProvider, PrometheusClient},
};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    // Startup configuration; anything invalid here terminates the process.
    let mut config = config::load_agent_config(cli.config.as_deref())
        .context("failed to load agent configuration")?;
    cli.apply_to(&mut config);
    log::info!(
        "Starting spotvortex-agent v{} (dry_run={}, shadow={})",
        spotvortex_agent::VERSION,
        config.dry_run,
        config.shadow_mode
    );

    observability::install(&config.metrics_listen_addr)
        .context("failed to install metrics exporter")?;

    // Model bundle contract: manifest checksums, cloud binding, family
    // allowlist. Contract failures are fatal.
    let manifest = ModelManifest::load(&config.models_dir)
        .context("failed to read model manifest")?;
    match &manifest {
        Some(m) => {
            m.verify_artifacts(&config.models_dir)
                .context("model bundle failed checksum verification")?;
            let expected = manifest::resolve_expected_cloud("aws");
            m.check_cloud(&expected)
                .context("model bundle cloud mismatch")?;
            log::info!(
                "Model manifest verified: cloud={}, {} families, {} artifacts",
                m.cloud,
                m.supported_instance_families.len(),
                m.artifacts.len()
            );
        }
        None if config.require_model_contract => {
            anyhow::bail!(
                "require_model_contract is set but {} has no manifest",
                config.models_dir.display()
            );
        }
        None => log::warn!("No model manifest found; instance family allowlist disabled"),
    }
    let allowlist = FamilyAllowlist::resolve(manifest.as_ref());

    let engine = InferenceEngine::load(
        &config.models_dir,
        config.forecast.history_steps,
        config.require_model_contract,
    )
    .context("failed to load models")?;

    let runtime = RuntimeConfigHandle::load(&config.runtime_config_path)
        .context("failed to load runtime configuration")?;

    // Clients.
    let kube = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let telemetry = Arc::new(
        PrometheusClient::new(&config.telemetry).context("failed to create metrics client")?,
    );
    if !telemetry.is_available().await {
        log::warn!(
            "Metrics store at {} not reachable yet; ticks will skip until it is",
            config.telemetry.prometheus_url
        );
    }
    let prices = Arc::new(LivePriceProvider::new(
        Arc::clone(&telemetry),
        config.forecast.history_steps,
        60 * 5,
    ));

    // Provisioner backends and the router.
    let karpenter = Arc::new(KarpenterManager::from_client(
        kube.clone(),
        config.karpenter.clone(),
        config.dry_run,
    ));
    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let asg = Arc::new(AsgManager::new(
        Box::new(AwsAsgApi::new(
            aws_sdk_autoscaling::Client::new(&aws_config),
            &config.asg,
        )),
        Box::new(KubeNodeWatcher::new(kube.clone())),
        config.asg.clone(),
        config.dry_run,
    ));
    let router = CapacityRouter::new(Some(karpenter.clone()), Some(asg));

    let reconciler = Arc::new(Reconciler::new(
        kube,
        telemetry,
        prices,
        engine,
        allowlist,
        router,
        Some(karpenter),
        runtime,
        config,
    ));

    // Run until SIGTERM/ctrl-c; the current tick finishes before exit.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown().await;
        let _ = shutdown_tx.send(true);
    });

    reconciler.run(shutdown_rx).await;
    log::info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
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
