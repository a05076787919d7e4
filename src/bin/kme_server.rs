use std::sync::Arc;

use clap::Parser;
use qkd_kme::broker::{self, BrokerMessage};
use qkd_kme::config::{Cli, Settings};
use qkd_kme::discovery::HttpDiscoveryTransport;
use qkd_kme::gateway::{self, AppState};
use qkd_kme::identity::IdentityStore;
use qkd_kme::pool::KeyPool;
use qkd_kme::relay::{HttpPeerClient, RelayStateMachine};
use qkd_kme::sync::PoolSynchronizer;
use qkd_kme::tls;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let settings = match Settings::load(&cli) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            log::error!("could not start: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli, settings).await {
        log::error!("server exited with error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, settings: Arc<Settings>) -> qkd_kme::Result<()> {
    let pool = Arc::new(KeyPool::new());
    let identity = Arc::new(IdentityStore::load(&settings)?);
    let discovery = Arc::new(HttpDiscoveryTransport::new()?);
    let peer = Arc::new(HttpPeerClient::new());
    let relay = Arc::new(RelayStateMachine::new(
        settings.clone(),
        pool.clone(),
        discovery.clone(),
        peer,
    ));

    let broker = Arc::new(broker::connect(&settings).await?);
    let sync = Arc::new(PoolSynchronizer::new(pool.clone(), broker.clone(), settings.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let background = if settings.is_master {
        let sync = sync.clone();
        tokio::spawn(async move {
            if let Err(e) = sync.run_master(shutdown_rx).await {
                log::error!("generation loop stopped: {}", e);
            }
        })
    } else {
        let sync = sync.clone();
        let broker = broker.clone();
        tokio::spawn(async move {
            let result = broker
                .listen(move |message: BrokerMessage| {
                    let sync = sync.clone();
                    async move { sync.apply_bus_message(message).await }
                })
                .await;
            if let Err(e) = result {
                log::error!("broker listener stopped: {}", e);
            }
        })
    };

    let state = Arc::new(AppState {
        settings: settings.clone(),
        pool,
        identity,
        discovery,
        relay,
        sync,
    });

    let app = gateway::build_router(state);
    let acceptor = tls::server_acceptor(&settings).await?;

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], cli.port));
    log::info!("kme {} listening on {}", settings.id, addr);

    let server = axum_server::bind(addr)
        .acceptor(acceptor)
        .serve(app.into_make_service());

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                log::error!("gateway stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("received interrupt signal, shutting down");
        }
    }

    let _ = shutdown_tx.send(true);
    background.abort();

    Ok(())
}
