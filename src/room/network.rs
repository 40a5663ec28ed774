//! NetworkRoom (4.G): one per configured IRC network, hosting connection
//! settings and acting as the control point for connect/disconnect.

use super::Room;
use crate::bridge::Bridge;
use crate::command::{split, CommandTable};
use crate::error::RoomInvalid;
use clap::{Arg, Command as Clap};
use irc::proto::Message;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkState {
    pub network: String,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub ircname: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub autocmd: Option<String>,
    #[serde(default)]
    pub connected: bool,
}

fn table() -> CommandTable {
    let mut t = CommandTable::new();
    t.register(Clap::new("nick").about("Set the nickname used on this network").arg(Arg::new("nick").required(true)));
    t.register(Clap::new("username").about("Set the ident username").arg(Arg::new("username").required(true)));
    t.register(Clap::new("ircname").about("Set the realname/gecos").arg(Arg::new("ircname").required(true)));
    t.register(Clap::new("password").about("Set the server password").arg(Arg::new("password").required(true)));
    t.register(Clap::new("autocmd").about("Set a command to run on connect").arg(Arg::new("command").required(true)));
    t.register(Clap::new("connect").about("Connect to this network"));
    t.register(Clap::new("disconnect").about("Disconnect from this network"));
    t.register(Clap::new("reconnect").about("Disconnect and reconnect"));
    t.register(Clap::new("raw").about("Send a raw line to the server").arg(Arg::new("line").required(true).num_args(1..)));
    t.register(Clap::new("query").about("Open a private chat with a nick").arg(Arg::new("nick").required(true)));
    t.register(
        Clap::new("msg")
            .about("Send a one-off message without opening a room")
            .arg(Arg::new("target").required(true))
            .arg(Arg::new("text").required(true).num_args(1..)),
    );
    t.register(Clap::new("join").about("Join a channel").arg(Arg::new("channel").required(true)));
    t
}

pub async fn on_message(room: &Arc<Room>, bridge: &Arc<Bridge>, sender: &str, _event_id: &str, body: &str) -> Result<(), RoomInvalid> {
    if sender != room.base.user_id {
        return Ok(());
    }
    let table = table();
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
    let mut kind = room.kind.lock().unwrap();
    let state = match &mut *kind {
        super::RoomKind::Network(s) => s,
        _ => return,
    };
    match name {
        "NICK" => {
            state.nick = Some(matches.get_one::<String>("nick").unwrap().clone());
            drop(kind);
            room.base.send_notice(None, "Nickname updated; reconnect to apply");
        }
        "USERNAME" => {
            state.username = Some(matches.get_one::<String>("username").unwrap().clone());
            drop(kind);
            room.base.send_notice(None, "Username updated; reconnect to apply");
        }
        "IRCNAME" => {
            state.ircname = Some(matches.get_one::<String>("ircname").unwrap().clone());
            drop(kind);
            room.base.send_notice(None, "Real name updated; reconnect to apply");
        }
        "PASSWORD" => {
            state.password = Some(matches.get_one::<String>("password").unwrap().clone());
            drop(kind);
            room.base.send_notice(None, "Server password updated; reconnect to apply");
        }
        "AUTOCMD" => {
            state.autocmd = Some(matches.get_one::<String>("command").unwrap().clone());
            drop(kind);
            room.base.send_notice(None, "Autocmd updated");
        }
        "CONNECT" => {
            if state.connected {
                drop(kind);
                room.base.send_notice(None, "Already connected");
            } else {
                state.connected = true;
                let network = state.network.clone();
                drop(kind);
                bridge.persist_room(room).await;
                crate::network::connect(bridge.clone(), room.clone(), network).await;
                room.base.send_notice(None, "Connecting...");
            }
        }
        "DISCONNECT" => {
            state.connected = false;
            drop(kind);
            bridge.persist_room(room).await;
            if let Some(session) = bridge.session_for_room(&room.base.room_id).await {
                session.request_disconnect();
            }
            room.base.send_notice(None, "Disconnected");
        }
        "RECONNECT" => {
            state.connected = true;
            let network = state.network.clone();
            drop(kind);
            bridge.persist_room(room).await;
            if let Some(session) = bridge.session_for_room(&room.base.room_id).await {
                session.request_disconnect();
            }
            crate::network::connect(bridge.clone(), room.clone(), network).await;
            room.base.send_notice(None, "Reconnecting...");
        }
        "RAW" => {
            drop(kind);
            let line: Vec<_> = matches.get_many::<String>("line").unwrap().cloned().collect();
            let text = line.join(" ");
            match bridge.session_for_room(&room.base.room_id).await {
                Some(session) => match Message::from_str(&format!("{text}\r\n")) {
                    Ok(message) => {
                        session.send_raw(message);
                        room.base.send_notice(None, format!("-> {text}"));
                    }
                    Err(_) => room.base.send_notice(None, "Could not parse raw line"),
                },
                None => room.base.send_notice(None, "Not connected"),
            }
        }
        "QUERY" => {
            let network = state.network.clone();
            drop(kind);
            let nick = matches.get_one::<String>("nick").unwrap();
            match bridge.open_private_room(&room.base.user_id, &network, nick).await {
                Ok(_) => room.base.send_notice(None, format!("Opened private chat with {nick}")),
                Err(e) => room.base.send_notice(None, format!("Failed to open private chat: {e:#}")),
            }
        }
        "MSG" => {
            drop(kind);
            let target = matches.get_one::<String>("target").unwrap();
            let text: Vec<_> = matches.get_many::<String>("text").unwrap().cloned().collect();
            let text = text.join(" ");
            match bridge.session_for_room(&room.base.room_id).await {
                Some(session) => {
                    session.send_privmsg(target, &text);
                    room.base.send_notice(None, format!("-> {target}: {text}"));
                }
                None => room.base.send_notice(None, "Not connected"),
            }
        }
        "JOIN" => {
            let network = state.network.clone();
            drop(kind);
            let channel = matches.get_one::<String>("channel").unwrap();
            match bridge.open_channel_room(&room.base.user_id, &network, channel).await {
                Ok(_) => {
                    if let Some(session) = bridge.session_for_room(&room.base.room_id).await {
                        session.send_raw(irc::proto::Message::from(irc::proto::Command::JOIN(channel.clone(), None, None)));
                    }
                    room.base.send_notice(None, format!("Joining {channel}"));
                }
                Err(e) => room.base.send_notice(None, format!("Failed to open {channel}: {e:#}")),
            }
        }
        _ => {}
    }
}
