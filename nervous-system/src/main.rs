/**
 * NERVOUS SYSTEM - Point d'entrée du binaire
 *
 * Ordre de démarrage : logs, .env, configuration (fatale si invalide),
 * attente du broker, tâches de la ruche, surface HTTP. Ctrl-C annule le
 * jeton partagé et toutes les tâches sont jointes avant la sortie.
 */

use anyhow::Context;
use nervous_system::{http, wait_for_broker, Hive, MqttBroker, NervousConfig, NervousError};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Ok si .env n'existe pas
    dotenvy::dotenv().ok();

    let cfg = NervousConfig::load().await.context("invalid configuration")?;
    let timing = cfg.topology.timing.clone();
    info!(
        broker = %format!("{}:{}", cfg.broker.host, cfg.broker.port),
        health_port = cfg.health_port,
        "starting nervous system"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("ctrl-c received"),
                Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
            }
            cancel.cancel();
        });
    }

    let broker = MqttBroker::start(
        cfg.broker.clone(),
        timing.connect_timeout(),
        timing.connect_retry(),
        cancel.clone(),
    );
    match wait_for_broker(&broker, timing.connect_retry(), &cancel).await {
        Ok(()) => {}
        Err(NervousError::Cancelled) => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    let hive = Hive::new(broker, cfg.topology, cancel.clone())?;

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.health_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind health endpoint on {addr}"))?;
    let app = http::build_router(hive.app_state());

    let server = async {
        let res = http::serve(listener, app, cancel.clone()).await;
        // sans surface HTTP, le process s'arrête
        if res.is_err() {
            cancel.cancel();
        }
        res
    };
    let (_, served) = tokio::join!(hive.run(), server);
    served.context("health endpoint failed")?;

    info!("nervous system stopped");
    Ok(())
}
