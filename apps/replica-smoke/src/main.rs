mod config;
mod logging;

use std::sync::Arc;

use config::SmokeConfig;
use replica_client::{
    Anonymous, CredentialSource, ReqwestTransport, ResourceClient, StaticToken, Synchronizer,
};
use replica_core::{DynamicObject, SyncEvent, notify_sync_failure};
use tokio::{signal, sync::broadcast::error::RecvError};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(2);
        }
    };

    let transport = match ReqwestTransport::with_request_timeout(config.request_timeout()) {
        Ok(transport) => transport,
        Err(err) => {
            eprintln!("Failed to initialize HTTP transport: {err}");
            std::process::exit(1);
        }
    };
    let credentials: Arc<dyn CredentialSource> = match config.token.clone() {
        Some(token) => Arc::new(StaticToken::new(token)),
        None => Arc::new(Anonymous),
    };

    let mut client = ResourceClient::<DynamicObject>::new(
        Arc::new(transport),
        credentials,
        config.server.clone(),
        config.collection(),
    );
    if let Some(namespace) = &config.namespace {
        client = client.with_namespace(namespace.clone());
    }

    let synchronizer = Synchronizer::new(client, config.sync_options());
    info!(
        server = %config.server,
        collection = synchronizer.collection(),
        "starting replica smoke"
    );
    run(&synchronizer).await;

    synchronizer.stop().await;
    info!("replica smoke stopped");
}

async fn run(synchronizer: &Synchronizer<DynamicObject>) {
    let mut events = synchronizer.subscribe();
    let mut snapshots = synchronizer.subscribe_snapshots();
    synchronizer.sync().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Ok(event) => log_event(synchronizer, &event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event observer lagged"),
                Err(RecvError::Closed) => break,
            },
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                debug!(
                    state = ?snapshot.state,
                    resource_version = snapshot.resource_version.as_deref().unwrap_or(""),
                    keys = %serde_json::to_string(&snapshot.keys()).unwrap_or_default(),
                    "replica updated"
                );
            }
        }
    }
}

fn log_event(synchronizer: &Synchronizer<DynamicObject>, event: &SyncEvent) {
    match event {
        SyncEvent::PhaseChanged { collection, phase } => {
            info!(%collection, ?phase, "phase changed");
        }
        SyncEvent::Resynced {
            collection,
            resource_version,
            items,
        } => {
            info!(%collection, ?resource_version, items, "replica resynced");
        }
        SyncEvent::Applied {
            collection,
            kind,
            key,
            outcome,
        } => {
            let snapshot = synchronizer.snapshot();
            let resource_version = snapshot
                .get(key)
                .and_then(|object| object.metadata.resource_version.as_deref())
                .unwrap_or("");
            info!(
                %collection,
                kind = kind.as_wire(),
                %key,
                ?outcome,
                resource_version,
                "event applied"
            );
        }
        SyncEvent::Anomaly {
            collection,
            kind,
            key,
            detail,
        } => {
            warn!(%collection, kind = kind.as_wire(), ?key, "{detail}");
        }
        SyncEvent::Failure {
            collection,
            failure,
            retry_in_ms,
        } => {
            let notification = notify_sync_failure(collection, failure);
            error!(
                code = %failure.code,
                level = ?notification.level,
                retry_in_ms,
                "{}",
                notification.message
            );
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
