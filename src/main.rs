//! Entry point: wires an [`tektite_rs::agent::Agent`] together from a
//! handful of environment variables and starts it, in the manner of the
//! teacher's `rusty-db-server` binary — a thin `#[tokio::main]` shim, not
//! a configuration framework. Parsing a TOML file or a richer env schema
//! is left to whoever packages this for a real deployment (§1 "Deliberately
//! out of scope ... configuration loading").

use std::net::SocketAddr;
use std::sync::Arc;

use tektite_rs::agent::{Agent, AgentHandles};
use tektite_rs::config::AgentConf;
use tektite_rs::networking::membership::{MemberInfo, ObjectStoreMembership};
use tektite_rs::networking::transport::TcpTransport;
use tektite_rs::objectstore::OpendalObjectStore;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> tektite_rs::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let member_id = env_or("TEKTITE_MEMBER_ID", "m1");
    let data_dir = env_or("TEKTITE_DATA_DIR", "./tektite-data");
    let cluster_listen_address = env_or("TEKTITE_CLUSTER_LISTEN_ADDR", "127.0.0.1:9092");
    let kafka_listen_address = env_or("TEKTITE_KAFKA_LISTEN_ADDR", "127.0.0.1:9093");
    let az = env_or("TEKTITE_AZ", "az1");

    tracing::info!(member_id = %member_id, data_dir = %data_dir, "starting tektite agent");

    std::fs::create_dir_all(&data_dir)?;
    let op = opendal::Operator::new(opendal::services::Fs::default().root(&data_dir))
        .map_err(|e| tektite_rs::TektiteError::fatal(e.to_string()))?
        .finish();
    let store = Arc::new(OpendalObjectStore::new(op));

    let conf = AgentConf::default();

    let self_info = MemberInfo {
        cluster_listen_address: cluster_listen_address.clone(),
        kafka_listen_address,
        az,
    };
    let membership = Arc::new(ObjectStoreMembership::new(
        Arc::clone(&store),
        conf.membership.clone(),
        conf.control.object_store_call_timeout,
        member_id.clone(),
        self_info.clone(),
    ));

    let listen_addr: SocketAddr = cluster_listen_address
        .parse()
        .map_err(|e| tektite_rs::TektiteError::invalid_argument(format!("{e}")))?;
    let transport = Arc::new(TcpTransport::new(listen_addr));

    let handles = AgentHandles {
        this_member_id: member_id.clone(),
        self_info,
        membership,
        transport: Some(transport),
    };

    let agent = Agent::new(conf, store, handles)?;
    agent.start().await?;

    tracing::info!(address = %cluster_listen_address, "tektite agent ready");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| tektite_rs::TektiteError::fatal(e.to_string()))?;

    tracing::info!("shutdown signal received, stopping agent");
    agent.stop().await;
    Ok(())
}
