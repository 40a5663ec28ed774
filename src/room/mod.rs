//! Room state machine (4.G, Design Note 9): one shared `RoomBase` (event
//! queue, serial runner, Matrix/IRC handles) plus a `RoomKind` tagged variant
//! carrying per-kind persisted fields and command handling. Discriminated by
//! a `type` string in the persisted `RoomConfig`, not by trait-object
//! polymorphism: the six kinds don't share enough behaviour to make a
//! `dyn Room` trait pull its weight, and a `match` keeps each kind's command
//! table next to its own state instead of behind indirection.

pub mod channel;
pub mod control;
pub mod hidden;
pub mod network;
pub mod plumbed;
pub mod private;

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::error::RoomInvalid;
use crate::matrix::MatrixApi;
use crate::puppet::PuppetRegistry;
use crate::queue::{EventQueue, MessageContent, OutboundEvent};
use crate::runner::SerialRunner;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

pub use channel::ChannelState;
pub use control::ControlState;
pub use hidden::HiddenState;
pub use network::NetworkState;
pub use plumbed::PlumbedState;
pub use private::PrivateState;

/// Persisted room state (3): round-trips through the `"irc"` room account
/// data key. `type` is the discriminant `RoomKind::kind_name` returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum RoomKind {
    Control(ControlState),
    Network(NetworkState),
    Private(PrivateState),
    Channel(ChannelState),
    Plumbed(PlumbedState),
    Hidden(HiddenState),
}

impl RoomKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            RoomKind::Control(_) => "control",
            RoomKind::Network(_) => "network",
            RoomKind::Private(_) => "private",
            RoomKind::Channel(_) => "channel",
            RoomKind::Plumbed(_) => "plumbed",
            RoomKind::Hidden(_) => "hidden",
        }
    }

    pub fn to_config(&self) -> RoomConfig {
        let fields = match self {
            RoomKind::Control(s) => serde_json::to_value(s),
            RoomKind::Network(s) => serde_json::to_value(s),
            RoomKind::Private(s) => serde_json::to_value(s),
            RoomKind::Channel(s) => serde_json::to_value(s),
            RoomKind::Plumbed(s) => serde_json::to_value(s),
            RoomKind::Hidden(s) => serde_json::to_value(s),
        }
        .unwrap_or(serde_json::Value::Null);
        RoomConfig {
            kind: self.kind_name().to_string(),
            fields,
        }
    }

    pub fn from_config(config: &RoomConfig) -> Option<Self> {
        let parse = |v: serde_json::Value| serde_json::from_value(v).ok();
        match config.kind.as_str() {
            "control" => parse(config.fields.clone()).map(RoomKind::Control),
            "network" => parse(config.fields.clone()).map(RoomKind::Network),
            "private" => parse(config.fields.clone()).map(RoomKind::Private),
            "channel" => parse(config.fields.clone()).map(RoomKind::Channel),
            "plumbed" => parse(config.fields.clone()).map(RoomKind::Plumbed),
            "hidden" => parse(config.fields.clone()).map(RoomKind::Hidden),
            _ => None,
        }
    }

    /// Room-kind membership invariant (3, 8), checked against `members` (the
    /// room's current Matrix membership, tracked by `RoomBase`): a room
    /// whose defining membership disappeared - the owner left a control
    /// room, the user left their channel/private/network room - is torn
    /// down rather than kept limping along. `HiddenState` has no membership
    /// requirement of its own; see its own `is_valid`. `PlumbedRoom` is
    /// exempt too: it is explicitly shared with non-bridge Matrix users and
    /// its configuring user need not be (or remain) a member themselves.
    pub fn is_valid(&self, user_id: &str, bot_user_id: &str, members: &[String]) -> bool {
        match self {
            RoomKind::Hidden(s) => s.is_valid(),
            RoomKind::Plumbed(_) => true,
            // Invariant 4: a ControlRoom's membership is exactly the owning
            // user and the bridge bot - nobody else, and neither missing.
            RoomKind::Control(_) => {
                members.len() == 2 && members.iter().any(|m| m == user_id) && members.iter().any(|m| m == bot_user_id)
            }
            // Invariant 3 (Channel) generalized to NetworkRoom/PrivateRoom,
            // the other two kinds exclusively owned by one Matrix user: the
            // owning user must still be a member, or the room has lost the
            // membership that justified its existence.
            RoomKind::Network(_) | RoomKind::Private(_) | RoomKind::Channel(_) => members.iter().any(|m| m == user_id),
        }
    }
}

/// The handles every room kind needs regardless of its own state: where to
/// send Matrix traffic, and the serial, coalescing pipe that gets it there in
/// order (4.B, 4.C).
pub struct RoomBase {
    pub room_id: String,
    pub user_id: String,
    /// The bridge bot's own mxid: the account data key the process-wide
    /// `config` is persisted under (3), regardless of which user's room a
    /// command mutating it was issued from.
    pub bot_user_id: String,
    pub matrix: Arc<dyn MatrixApi>,
    pub puppets: Arc<PuppetRegistry>,
    /// The single process-wide bridge config (3), shared by every room of
    /// every user so an admin command issued in one ControlRoom is visible
    /// everywhere.
    pub config: Arc<AsyncMutex<BridgeConfig>>,
    /// Current Matrix membership of this room (3: `Room.members`), kept in
    /// sync by the bridge controller's `m.room.member` dispatch. Drives the
    /// per-kind `is_valid()` invariants (3/4, 8).
    members: Mutex<Vec<String>>,
    queue: EventQueue,
}

impl RoomBase {
    pub fn new(
        room_id: String,
        user_id: String,
        bot_user_id: String,
        matrix: Arc<dyn MatrixApi>,
        puppets: Arc<PuppetRegistry>,
        config: Arc<AsyncMutex<BridgeConfig>>,
        members: Vec<String>,
    ) -> Self {
        let runner = SerialRunner::new();
        let queue = EventQueue::new(matrix.clone(), runner, room_id.clone());
        RoomBase {
            room_id,
            user_id,
            bot_user_id,
            matrix,
            puppets,
            config,
            members: Mutex::new(members),
            queue,
        }
    }

    /// Persists the bridge config back to the bridge bot's own `"irc"`
    /// account data (6); called after any command handler mutates it.
    pub async fn persist_config(&self) {
        let snapshot = self.config.lock().await.clone();
        if let Ok(value) = serde_json::to_value(&snapshot) {
            if let Err(e) = self.matrix.put_account_data(&self.bot_user_id, "irc", &value).await {
                log::warn!("failed to persist bridge config ({}): {e}", self.bot_user_id);
            }
        }
    }

    pub fn members(&self) -> Vec<String> {
        self.members.lock().unwrap().clone()
    }

    /// Records `mxid` joining/being invited into this room (4.G: "the base
    /// handler for `m.room.member` updates `members`").
    pub fn add_member(&self, mxid: &str) {
        let mut members = self.members.lock().unwrap();
        if !members.iter().any(|m| m == mxid) {
            members.push(mxid.to_string());
        }
    }

    /// Records `mxid` leaving (or being kicked/banned from) this room.
    pub fn remove_member(&self, mxid: &str) {
        self.members.lock().unwrap().retain(|m| m != mxid);
    }

    pub fn send_message(&self, sender: Option<String>, body: impl Into<String>) {
        self.queue.enqueue(OutboundEvent::message(MessageContent::text(body), sender));
    }

    pub fn send_notice(&self, sender: Option<String>, body: impl Into<String>) {
        self.queue.enqueue(OutboundEvent::message(MessageContent::notice(body), sender));
    }

    pub fn send_emote(&self, sender: Option<String>, body: impl Into<String>) {
        self.queue.enqueue(OutboundEvent::message(MessageContent::emote(body), sender));
    }

    pub fn send_notice_html(&self, sender: Option<String>, body: impl Into<String>, html: impl Into<String>) {
        self.queue
            .enqueue(OutboundEvent::message(MessageContent::notice_html(body, html), sender));
    }
}

/// A room: its fixed handles plus its kind-tagged, mutable persisted state.
pub struct Room {
    pub base: RoomBase,
    pub kind: Mutex<RoomKind>,
}

impl Room {
    pub fn new(base: RoomBase, kind: RoomKind) -> Self {
        Room {
            base,
            kind: Mutex::new(kind),
        }
    }

    pub fn is_valid(&self) -> bool {
        let members = self.base.members();
        self.kind.lock().unwrap().is_valid(&self.base.user_id, &self.base.bot_user_id, &members)
    }

    pub fn to_config(&self) -> RoomConfig {
        self.kind.lock().unwrap().to_config()
    }
}

/// Dispatches one Matrix `m.room.message` to `room`'s command/message
/// handler. `RoomInvalid` propagates to the bridge controller, which runs
/// leave+forget cleanup rather than treating it as a logged error. A free
/// function (not a `Room` method) because most handlers need the owning
/// `Bridge` too, to create/look up sibling rooms and live IRC sessions (9:
/// "weak back-references ... become an index lookup", routed through here).
pub async fn on_mx_message(
    room: &Arc<Room>,
    bridge: &Arc<Bridge>,
    sender: &str,
    event_id: &str,
    body: &str,
) -> Result<(), RoomInvalid> {
    let kind_name = room.kind.lock().unwrap().kind_name();
    match kind_name {
        "control" => control::on_message(room, bridge, sender, event_id, body).await,
        "network" => network::on_message(room, bridge, sender, event_id, body).await,
        "private" => private::on_message(room, bridge, sender, event_id, body).await,
        "channel" => channel::on_message(room, bridge, sender, event_id, body).await,
        "plumbed" => plumbed::on_message(room, bridge, sender, event_id, body).await,
        "hidden" => hidden::on_message(room, bridge, sender, event_id, body).await,
        _ => Ok(()),
    }
}
