use clap::Parser;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

use tokmesh::auth::AuthService;
use tokmesh::cli::Args;
use tokmesh::cluster::{
    ClusterServer, LocalConsensus, LocalShardTransport, MeshFsm, PeerMetadata, RebalanceConfig,
    RebalanceManager, StaticDiscovery, TransferReceiver,
};
use tokmesh::config::Config;
use tokmesh::runtime::{self, Supervisor};
use tokmesh::session::SessionService;
use tokmesh::storage::{MemoryApiKeyStore, MemoryStore};
use tokmesh::token::TokenService;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut figment = Figment::new();
    if let Some(path) = &args.config {
        figment = figment.merge(Toml::file(path));
    }
    let config: Config = figment
        .merge(Env::prefixed("TOKMESH_").split("__"))
        .extract()
        .expect("Failed to load config");

    tokmesh::logging::setup_logging(&config, args.tracing);
    info!(node_id = %config.node_id, "starting tokmesh node");

    // Storage collaborators. The in-memory engine backs every repository
    // trait; a persistent engine would be wired here instead.
    let store = Arc::new(MemoryStore::new());
    let key_store = Arc::new(MemoryApiKeyStore::new());

    let sessions = Arc::new(SessionService::new(store.clone(), (&config.sessions).into()));
    // Constructed here so wire adapters layered on this binary can reach
    // them through the library surface.
    let _tokens = Arc::new(TokenService::new(store.clone(), (&config.tokens).into()));
    let _auth = Arc::new(AuthService::new(key_store, (&config.auth).into()));

    // Cluster layer: single-node consensus plus in-process discovery.
    // Multi-node deployments plug a real Raft runtime and gossip layer
    // into the same traits.
    let fsm = Arc::new(MeshFsm::new());
    let consensus = Arc::new(LocalConsensus::new(
        &config.node_id,
        &config.raft_addr,
        fsm.clone(),
        config.bootstrap,
    ));
    let discovery = Arc::new(StaticDiscovery::new(
        &config.node_id,
        &config.gossip_addr,
        PeerMetadata {
            raft_addr: config.raft_addr.clone(),
            cluster_id: config.cluster_id.clone(),
        },
    ));

    let rebalancer = config.rebalance.enabled.then(|| {
        let transport = Arc::new(LocalShardTransport::new());
        transport.register(
            &config.node_id,
            Arc::new(TransferReceiver::new(Some(store.clone()))),
        );
        Arc::new(RebalanceManager::new(
            store.clone(),
            transport,
            RebalanceConfig::from(&config.rebalance),
        ))
    });

    let server = ClusterServer::new(
        config.cluster(),
        fsm,
        consensus,
        discovery,
        rebalancer,
    );

    let mut supervisor = Supervisor::new();
    let shutdown = supervisor.shutdown_token();
    supervisor.spawn("cluster", runtime::run_cluster(server, shutdown.clone()));
    supervisor.spawn(
        "session-gc",
        runtime::run_session_gc(sessions, config.gc_interval, shutdown),
    );

    supervisor.run(config.shutdown_timeout).await
}
