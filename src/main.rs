extern crate anyhow;
#[macro_use]
extern crate log;

mod args;
mod bridge;
mod command;
mod config;
mod error;
mod ident;
mod irc;
mod matrix;
mod puppet;
mod queue;
mod room;
mod runner;
mod version;

use anyhow::{Context, Result};
use args::args;
use bridge::Bridge;
use config::{ensure_registration_path, BridgeConfig, Registration};
use matrix::{MatrixApi, MatrixClient};
use puppet::PuppetRegistry;
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let level = match args().verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run().await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    if args().generate {
        return generate_registration();
    }

    ensure_registration_path(&args().config)?;
    let registration = Registration::load(&args().config)?;
    let puppet_prefix = registration.puppet_prefix()?;

    let server_name = args()
        .homeserver
        .rsplit('/')
        .next()
        .unwrap_or(&args().homeserver)
        .to_string();
    let matrix: Arc<dyn MatrixApi> = Arc::new(MatrixClient::new(
        args().homeserver.clone(),
        registration.as_token.clone(),
        registration.sender_localpart.clone(),
    ));
    let bot_user_id = format!("@{}:{server_name}", registration.sender_localpart);

    let whoami = matrix.whoami().await.context("verifying homeserver connectivity (whoami)")?;
    info!("connected to homeserver as {}", whoami.user_id);

    if args().reset {
        return reset_bridge(matrix.as_ref(), &bot_user_id).await;
    }

    let puppets = Arc::new(PuppetRegistry::new(matrix.clone(), puppet_prefix, server_name.clone()));

    let mut global_allow = std::collections::HashMap::new();
    if let Some(owner) = &args().owner {
        global_allow.insert(owner.clone(), config::MaskLevel::Admin);
    }

    let bridge = Arc::new(Bridge::new(matrix.clone(), puppets.clone(), bot_user_id, server_name, global_allow));
    bridge.reload_rooms().await.context("reconstructing rooms from joined_rooms")?;

    let txn_router = matrix::txn::router(registration.hs_token.clone(), bridge.clone());
    let listen_addr = SocketAddr::new(args().listen_address, args().listen_port);
    info!("listening for appservice transactions on {listen_addr}");

    let server = axum::Server::bind(&listen_addr).serve(txn_router.into_make_service());

    if args().identd {
        let ident_lookup: Arc<dyn ident::IdentLookup> = Arc::new(BridgeIdentLookup(bridge.clone()));
        tokio::spawn(async move {
            if let Err(e) = ident::listen(ident_lookup).await {
                warn!("ident responder stopped: {e:#}");
            }
        });
    }

    server.await.context("appservice transaction listener")?;
    Ok(())
}

/// Adapts the bridge's live session table (4.F/4.I) to the ident
/// responder's narrow lookup trait.
struct BridgeIdentLookup(Arc<Bridge>);

#[async_trait::async_trait]
impl ident::IdentLookup for BridgeIdentLookup {
    async fn lookup(&self, local_port: u16, remote_port: u16) -> Option<String> {
        self.0.ident_lookup(local_port, remote_port).await
    }
}

fn generate_registration() -> Result<()> {
    let puppet_prefix = "irc";
    let registration = Registration::generate("ircassoc", &args().homeserver, puppet_prefix, "ircassocbot");
    registration.save(&args().config)?;
    info!("wrote fresh registration to {}", args().config);
    Ok(())
}

async fn reset_bridge(matrix: &dyn MatrixApi, bot_user_id: &str) -> Result<()> {
    let joined = matrix.joined_rooms().await?;
    for room_id in joined.joined_rooms {
        let _ = matrix.leave_room(&room_id, None).await;
        let _ = matrix.forget_room(&room_id, None).await;
    }
    let _ = matrix
        .put_account_data(bot_user_id, "irc", &serde_json::to_value(BridgeConfig::default())?)
        .await;
    info!("left and forgot every joined room; persisted config wiped");
    Ok(())
}
