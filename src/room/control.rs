//! ControlRoom (4.G, §6): the bridge's own command console. One per bridge
//! user; hosts bridge-wide administration (masks, networks, servers) plus a
//! few always-available utility commands.

use super::Room;
use crate::bridge::Bridge;
use crate::command::{split, CommandTable};
use crate::config::{MaskLevel, MemberSync, NetworkConfig, ServerConfig};
use crate::error::RoomInvalid;
use crate::version::VERSION;
use clap::{Arg, ArgAction, Command as Clap};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlState {}

fn table() -> CommandTable {
    let mut t = CommandTable::new();
    t.register(Clap::new("help").about("List available commands"));
    t.register(Clap::new("networks").about("List configured networks"));
    t.register(Clap::new("servers").arg(Arg::new("network").required(true)).about("List servers for a network"));
    t.register(
        Clap::new("open")
            .about("Open or create a network room")
            .arg(Arg::new("network").required(true))
            .arg(Arg::new("new").long("new").action(ArgAction::SetTrue)),
    );
    t.register(Clap::new("quit").about("Disconnect and remove this bridge user"));
    t.register(Clap::new("masks").about("List the access mask list"));
    t.register(
        Clap::new("addmask")
            .about("Allow a mxid glob to use the bridge")
            .arg(Arg::new("mask").required(true))
            .arg(Arg::new("admin").long("admin").action(ArgAction::SetTrue)),
    );
    t.register(Clap::new("delmask").about("Remove a mxid glob from the allow-list").arg(Arg::new("mask").required(true)));
    t.register(
        Clap::new("addnetwork")
            .about("Define a new IRC network")
            .arg(Arg::new("name").required(true)),
    );
    t.register(Clap::new("delnetwork").about("Remove a network and its servers").arg(Arg::new("name").required(true)));
    t.register(
        Clap::new("addserver")
            .about("Add a server to a network")
            .arg(Arg::new("network").required(true))
            .arg(Arg::new("address").required(true))
            .arg(Arg::new("port").required(true))
            .arg(Arg::new("tls").long("tls").action(ArgAction::SetTrue))
            .arg(Arg::new("tls-insecure").long("tls-insecure").action(ArgAction::SetTrue))
            .arg(Arg::new("proxy").long("proxy")),
    );
    t.register(
        Clap::new("delserver")
            .about("Remove a server from a network")
            .arg(Arg::new("network").required(true))
            .arg(Arg::new("address").required(true))
            .arg(Arg::new("port").required(true)),
    );
    t.register(Clap::new("status").about("Show connection status for every network"));
    t.register(
        Clap::new("forget")
            .about("Leave and forget every room belonging to a bridge user")
            .arg(Arg::new("mxid").required(true)),
    );
    t.register(Clap::new("displayname").about("Set this bridge user's displayname").arg(Arg::new("name").required(true)));
    t.register(Clap::new("avatar").about("Set this bridge user's avatar").arg(Arg::new("mxc").required(true)));
    t.register(
        Clap::new("ident")
            .about("Manage per-network ident replies")
            .subcommand(Clap::new("list"))
            .subcommand(Clap::new("set").arg(Arg::new("network").required(true)).arg(Arg::new("ident").required(true)))
            .subcommand(Clap::new("remove").arg(Arg::new("network").required(true))),
    );
    t.register(
        Clap::new("sync")
            .about("Set member sync level")
            .arg(Arg::new("lazy").long("lazy").action(ArgAction::SetTrue))
            .arg(Arg::new("half").long("half").action(ArgAction::SetTrue))
            .arg(Arg::new("full").long("full").action(ArgAction::SetTrue)),
    );
    t.register(
        Clap::new("mediaurl")
            .about("Set or clear the public media URL")
            .arg(Arg::new("url"))
            .arg(Arg::new("remove").long("remove").action(ArgAction::SetTrue)),
    );
    t.register(Clap::new("version").about("Show bridge version"));
    t
}

pub async fn on_message(room: &Arc<Room>, bridge: &Arc<Bridge>, sender: &str, _event_id: &str, body: &str) -> Result<(), RoomInvalid> {
    if sender != room.base.user_id {
        return Ok(());
    }
    let table = table();
    let is_admin = room.base.config.lock().await.is_admin(sender);

    let commands = match split(body) {
        Ok(c) => c,
        Err(e) => {
            room.base.send_notice(None, e.0);
            return Ok(());
        }
    };

    for mut tokens in commands {
        if tokens.is_empty() {
            continue;
        }
        let name = tokens.remove(0).to_uppercase();
        if name == "HELP" {
            room.base.send_notice(None, table.help());
            continue;
        }
        if !table.contains(&name) {
            room.base.send_notice(None, format!("Unknown command \"{name}\", type HELP for list"));
            continue;
        }
        let admin_only = matches!(
            name.as_str(),
            "ADDMASK"
                | "DELMASK"
                | "ADDNETWORK"
                | "DELNETWORK"
                | "ADDSERVER"
                | "DELSERVER"
                | "MASKS"
                | "STATUS"
                | "FORGET"
                | "IDENT"
                | "SYNC"
                | "MEDIAURL"
        );
        if admin_only && !is_admin {
            room.base.send_notice(None, "This command is restricted to bridge admins");
            continue;
        }
        let matches = match table.parse(&name, tokens) {
            Ok(m) => m,
            Err(e) => {
                room.base.send_notice(None, e.0);
                continue;
            }
        };
        run(room, bridge, &name, &matches).await;
    }
    Ok(())
}

async fn run(room: &Arc<Room>, bridge: &Arc<Bridge>, name: &str, matches: &clap::ArgMatches) {
    match name {
        "NETWORKS" => {
            let cfg = room.base.config.lock().await;
            if cfg.networks.is_empty() {
                room.base.send_notice(None, "No networks configured");
            } else {
                let list = cfg.networks.keys().cloned().collect::<Vec<_>>().join(", ");
                room.base.send_notice(None, format!("Networks: {list}"));
            }
        }
        "SERVERS" => {
            let network = matches.get_one::<String>("network").unwrap();
            let cfg = room.base.config.lock().await;
            match cfg.networks.get(network) {
                Some(n) => {
                    let list = n
                        .servers
                        .iter()
                        .map(|s| format!("{}:{}{}", s.address, s.port, if s.tls { " (tls)" } else { "" }))
                        .collect::<Vec<_>>()
                        .join(", ");
                    room.base.send_notice(None, format!("{network}: {list}"));
                }
                None => room.base.send_notice(None, format!("No such network: {network}")),
            }
        }
        "MASKS" => {
            let cfg = room.base.config.lock().await;
            if cfg.allow.is_empty() {
                room.base.send_notice(None, "Access mask list is empty");
            } else {
                let list = cfg
                    .allow
                    .iter()
                    .map(|(mask, level)| format!("{mask} ({level:?})"))
                    .collect::<Vec<_>>()
                    .join(", ");
                room.base.send_notice(None, list);
            }
        }
        "ADDMASK" => {
            let mask = matches.get_one::<String>("mask").unwrap().clone();
            let level = if matches.get_flag("admin") { MaskLevel::Admin } else { MaskLevel::User };
            {
                let mut cfg = room.base.config.lock().await;
                cfg.allow.insert(mask.clone(), level);
            }
            room.base.persist_config().await;
            room.base.send_notice(None, format!("Added {mask} to the allow-list"));
        }
        "DELMASK" => {
            let mask = matches.get_one::<String>("mask").unwrap();
            let removed = {
                let mut cfg = room.base.config.lock().await;
                cfg.allow.remove(mask).is_some()
            };
            if removed {
                room.base.persist_config().await;
                room.base.send_notice(None, format!("Removed {mask}"));
            } else {
                room.base.send_notice(None, format!("No such mask: {mask}"));
            }
        }
        "ADDNETWORK" => {
            let name = matches.get_one::<String>("name").unwrap().clone();
            {
                let mut cfg = room.base.config.lock().await;
                cfg.networks.entry(name.clone()).or_insert_with(NetworkConfig::default);
            }
            room.base.persist_config().await;
            room.base.send_notice(None, format!("Added network {name}"));
        }
        "DELNETWORK" => {
            let name = matches.get_one::<String>("name").unwrap();
            let removed = {
                let mut cfg = room.base.config.lock().await;
                cfg.networks.remove(name).is_some()
            };
            if removed {
                room.base.persist_config().await;
                room.base.send_notice(None, format!("Removed network {name}"));
            } else {
                room.base.send_notice(None, format!("No such network: {name}"));
            }
        }
        "ADDSERVER" => {
            let network = matches.get_one::<String>("network").unwrap().clone();
            let address = matches.get_one::<String>("address").unwrap().clone();
            let port: u16 = match matches.get_one::<String>("port").unwrap().parse() {
                Ok(p) => p,
                Err(_) => {
                    room.base.send_notice(None, "Invalid port");
                    return;
                }
            };
            let server = ServerConfig {
                address,
                port,
                tls: matches.get_flag("tls"),
                tls_insecure: matches.get_flag("tls-insecure"),
                proxy: matches.get_one::<String>("proxy").cloned(),
            };
            {
                let mut cfg = room.base.config.lock().await;
                cfg.networks.entry(network.clone()).or_default().servers.push(server);
            }
            room.base.persist_config().await;
            room.base.send_notice(None, format!("Added server to {network}"));
        }
        "DELSERVER" => {
            let network = matches.get_one::<String>("network").unwrap().clone();
            let address = matches.get_one::<String>("address").unwrap();
            let port: u16 = matches.get_one::<String>("port").unwrap().parse().unwrap_or_default();
            let removed = {
                let mut cfg = room.base.config.lock().await;
                if let Some(n) = cfg.networks.get_mut(&network) {
                    let before = n.servers.len();
                    n.servers.retain(|s| !(s.address == *address && s.port == port));
                    before != n.servers.len()
                } else {
                    false
                }
            };
            if removed {
                room.base.persist_config().await;
                room.base.send_notice(None, format!("Removed server from {network}"));
            } else {
                room.base.send_notice(None, "No such server");
            }
        }
        "STATUS" => {
            let cfg = room.base.config.lock().await;
            if cfg.networks.is_empty() {
                room.base.send_notice(None, "No networks configured");
            } else {
                for name in cfg.networks.keys() {
                    room.base.send_notice(None, format!("{name}: see the network's own room for connection state"));
                }
            }
        }
        "FORGET" => {
            let mxid = matches.get_one::<String>("mxid").unwrap().clone();
            room.base.send_notice(None, format!("Leaving and forgetting every room belonging to {mxid}"));
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.forget_all_rooms(&mxid).await });
        }
        "DISPLAYNAME" => {
            let name = matches.get_one::<String>("name").unwrap();
            if let Err(e) = room.base.matrix.set_displayname(&room.base.user_id, name).await {
                room.base.send_notice(None, format!("Failed to set displayname: {e}"));
            } else {
                room.base.send_notice(None, "Displayname updated");
            }
        }
        "AVATAR" => {
            let mxc = matches.get_one::<String>("mxc").unwrap();
            if let Err(e) = room.base.matrix.set_avatar_url(&room.base.user_id, mxc).await {
                room.base.send_notice(None, format!("Failed to set avatar: {e}"));
            } else {
                room.base.send_notice(None, "Avatar updated");
            }
        }
        "IDENT" => match matches.subcommand() {
            Some(("list", _)) => {
                let cfg = room.base.config.lock().await;
                if cfg.idents.is_empty() {
                    room.base.send_notice(None, "No ident overrides set");
                } else {
                    let list = cfg.idents.iter().map(|(k, v)| format!("{k}: {v}")).collect::<Vec<_>>().join(", ");
                    room.base.send_notice(None, list);
                }
            }
            Some(("set", sub)) => {
                let network = sub.get_one::<String>("network").unwrap().clone();
                let ident = sub.get_one::<String>("ident").unwrap().clone();
                {
                    let mut cfg = room.base.config.lock().await;
                    cfg.idents.insert(network, ident);
                }
                room.base.persist_config().await;
                room.base.send_notice(None, "Ident updated");
            }
            Some(("remove", sub)) => {
                let network = sub.get_one::<String>("network").unwrap();
                {
                    let mut cfg = room.base.config.lock().await;
                    cfg.idents.remove(network);
                }
                room.base.persist_config().await;
                room.base.send_notice(None, "Ident removed");
            }
            _ => room.base.send_notice(None, "Usage: IDENT list|set|remove"),
        },
        "SYNC" => {
            let level = if matches.get_flag("lazy") {
                Some(MemberSync::Lazy)
            } else if matches.get_flag("half") {
                Some(MemberSync::Half)
            } else if matches.get_flag("full") {
                Some(MemberSync::Full)
            } else {
                None
            };
            match level {
                Some(level) => {
                    {
                        let mut cfg = room.base.config.lock().await;
                        cfg.member_sync = level;
                    }
                    room.base.persist_config().await;
                    room.base.send_notice(None, "Member sync level updated");
                }
                None => room.base.send_notice(None, "Usage: SYNC --lazy|--half|--full"),
            }
        }
        "MEDIAURL" => {
            if matches.get_flag("remove") {
                {
                    let mut cfg = room.base.config.lock().await;
                    cfg.media_url = None;
                }
                room.base.persist_config().await;
                room.base.send_notice(None, "Media URL cleared");
            } else if let Some(url) = matches.get_one::<String>("url") {
                {
                    let mut cfg = room.base.config.lock().await;
                    cfg.media_url = Some(url.clone());
                }
                room.base.persist_config().await;
                room.base.send_notice(None, "Media URL updated");
            } else {
                room.base.send_notice(None, "Usage: MEDIAURL <url>|--remove");
            }
        }
        "VERSION" => {
            room.base.send_notice(None, format!("bridge version {VERSION}"));
        }
        "OPEN" => {
            let network = matches.get_one::<String>("network").unwrap().clone();
            let force_new = matches.get_flag("new");
            match bridge.open_network_room(&room.base.user_id, &network, force_new).await {
                Ok(_) => room.base.send_notice(None, format!("Opened network room for {network}")),
                Err(e) => room.base.send_notice(None, format!("Failed to open {network}: {e:#}")),
            }
        }
        "QUIT" => {
            room.base.send_notice(None, "Leaving and forgetting every bridge room");
            let user_id = room.base.user_id.clone();
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.forget_all_rooms(&user_id).await });
        }
        _ => {}
    }
}
