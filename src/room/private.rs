//! PrivateRoom (4.G): a 1:1 chat between the bridge user and one puppeted IRC
//! nick, bridged as plain `PRIVMSG`/`NOTICE`.

use super::Room;
use crate::bridge::Bridge;
use crate::command::first_command;
use crate::error::RoomInvalid;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateState {
    pub network: String,
    pub nick: String,
}

/// Matrix messages in a PrivateRoom are plain chat unless they start with a
/// recognized command word (4.A): `NICK`, `MSG`, `QUERY` and friends still
/// work here so a user doesn't have to bounce through the NetworkRoom.
const COMMAND_WORDS: &[&str] = &["NICK", "MSG", "QUERY", "RAW"];

pub async fn on_message(room: &Arc<Room>, bridge: &Arc<Bridge>, sender: &str, _event_id: &str, body: &str) -> Result<(), RoomInvalid> {
    if sender != room.base.user_id {
        return Ok(());
    }
    if let Ok(Some((name, _))) = first_command(body) {
        if COMMAND_WORDS.contains(&name.as_str()) {
            room.base.send_notice(None, format!("{name} is only available in the network room"));
            return Ok(());
        }
    }

    let (network, nick) = {
        let kind = room.kind.lock().unwrap();
        match &*kind {
            super::RoomKind::Private(s) => (s.network.clone(), s.nick.clone()),
            _ => return Ok(()),
        }
    };
    match bridge.session_for(&room.base.user_id, &network).await {
        Some(session) => session.send_privmsg(&nick, body),
        None => room.base.send_notice(None, "Not connected to this network"),
    }
    Ok(())
}
