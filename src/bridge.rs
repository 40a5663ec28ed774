//! Bridge controller (4.H): owns the rooms registry, handles pushed
//! transactions, and bootstraps new bridge users via invite.

use crate::config::BridgeConfig;
use crate::matrix::txn::TransactionHandler;
use crate::matrix::MatrixApi;
use crate::network::NetworkSession;
use crate::puppet::PuppetRegistry;
use crate::room::{
    on_mx_message, ChannelState, ControlState, HiddenState, NetworkState, PrivateState, Room, RoomBase, RoomConfig, RoomKind,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex as AsyncMutex, OnceCell, RwLock};
use tokio::time::{sleep, Duration};

const JOIN_RETRIES: u32 = 6;
const JOIN_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct Bridge {
    matrix: Arc<dyn MatrixApi>,
    puppets: Arc<PuppetRegistry>,
    bot_user_id: String,
    server_name: String,
    global_allow: HashMap<String, crate::config::MaskLevel>,
    /// room_id -> room; one bridge-wide table, since rooms across different
    /// bridge users never need to interact directly.
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    /// The single, process-wide bridge config (3): owner, allow-list,
    /// networks, idents, member sync level, media URL. Loaded once from the
    /// bridge bot's own account data and shared by every room and command
    /// handler, the way heisenbridge keeps one `self.config` for the whole
    /// process rather than one per invitee.
    config: OnceCell<Arc<AsyncMutex<BridgeConfig>>>,
    /// NetworkRoom room_id -> its live IRC session, when connected (4.F).
    sessions: RwLock<HashMap<String, Arc<NetworkSession>>>,
    /// Set once, right after construction (`Arc::new_cyclic`), so any code
    /// running inside a spawned task can recover an owning `Arc<Bridge>`
    /// without this struct needing to be handed one at every call site.
    self_ref: Weak<Bridge>,
}

impl Bridge {
    pub fn new(
        matrix: Arc<dyn MatrixApi>,
        puppets: Arc<PuppetRegistry>,
        bot_user_id: String,
        server_name: String,
        global_allow: HashMap<String, crate::config::MaskLevel>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Bridge {
            matrix,
            puppets,
            bot_user_id,
            server_name,
            global_allow,
            rooms: RwLock::new(HashMap::new()),
            config: OnceCell::new(),
            sessions: RwLock::new(HashMap::new()),
            self_ref: weak.clone(),
        })
    }

    /// Recovers an owning `Arc` to this bridge; used by handlers that need
    /// to hand a long-lived task (an IRC session) something that outlives
    /// the call stack that spawned it.
    pub fn arc(&self) -> Arc<Bridge> {
        self.self_ref.upgrade().expect("bridge outlives its own tasks")
    }

    pub fn matrix(&self) -> &Arc<dyn MatrixApi> {
        &self.matrix
    }

    pub fn puppets(&self) -> &Arc<PuppetRegistry> {
        &self.puppets
    }

    pub fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn is_local(&self, mxid: &str) -> bool {
        mxid.ends_with(&format!(":{}", self.server_name))
    }

    /// The single, process-wide bridge config (3), loaded once from the
    /// bridge bot's own account data key `"irc"` - not per-invitee, since
    /// the owner/allow-list/networks it holds are shared bridge-wide state,
    /// not something each new invitee starts out owning a private copy of.
    pub async fn config(&self) -> Arc<AsyncMutex<BridgeConfig>> {
        self.config
            .get_or_init(|| async {
                let loaded = match self.matrix.get_account_data(&self.bot_user_id, "irc").await {
                    Ok(value) => serde_json::from_value(value).unwrap_or_default(),
                    Err(_) => BridgeConfig::default(),
                };
                Arc::new(AsyncMutex::new(loaded))
            })
            .await
            .clone()
    }

    pub async fn is_admin(&self, mxid: &str) -> bool {
        if let Some(level) = self.global_allow.get(mxid) {
            return *level == crate::config::MaskLevel::Admin;
        }
        self.config().await.lock().await.is_admin(mxid)
    }

    pub async fn is_user(&self, mxid: &str) -> bool {
        if self.global_allow.contains_key(mxid) {
            return true;
        }
        self.config().await.lock().await.is_user(mxid)
    }

    async fn register_room(&self, room: Arc<Room>) {
        self.rooms.write().await.insert(room.base.room_id.clone(), room);
    }

    pub async fn find_rooms(&self, kind: &str, user_id: &str) -> Vec<Arc<Room>> {
        self.rooms
            .read()
            .await
            .values()
            .filter(|r| r.kind.lock().unwrap().kind_name() == kind && r.base.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn room_by_id(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Every room belonging to `user_id`, regardless of kind (`FORGET`, `QUIT`).
    pub async fn all_rooms_for(&self, user_id: &str) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().filter(|r| r.base.user_id == user_id).cloned().collect()
    }

    /// Leaves and forgets every room belonging to `user_id` (`FORGET`/`QUIT`).
    /// The bridge-wide config is untouched: it is shared process state, not
    /// something that belongs to the user being forgotten.
    pub async fn forget_all_rooms(&self, user_id: &str) {
        let rooms = self.all_rooms_for(user_id).await;
        for room in rooms {
            self.rooms.write().await.remove(&room.base.room_id);
            self.remove_session(&room.base.room_id).await;
            let _ = self.matrix.leave_room(&room.base.room_id, None).await;
            let _ = self.matrix.forget_room(&room.base.room_id, None).await;
        }
    }

    /// Finds the `user_id`'s NetworkRoom for `network`, if one exists.
    pub async fn network_room_for(&self, user_id: &str, network: &str) -> Option<Arc<Room>> {
        for room in self.find_rooms("network", user_id).await {
            let matches = matches!(&*room.kind.lock().unwrap(), RoomKind::Network(s) if s.network == network);
            if matches {
                return Some(room);
            }
        }
        None
    }

    /// Finds the `user_id`'s PrivateRoom (peer nick) or ChannelRoom (channel
    /// name) for `network`, keyed by lowercased name per the data model (3).
    pub async fn sub_room_for(&self, user_id: &str, network: &str, lowered_name: &str) -> Option<Arc<Room>> {
        for room in self.find_rooms("private", user_id).await {
            let matches = matches!(&*room.kind.lock().unwrap(), RoomKind::Private(s) if s.network == network && s.nick == lowered_name);
            if matches {
                return Some(room);
            }
        }
        for room in self.find_rooms("channel", user_id).await {
            let matches =
                matches!(&*room.kind.lock().unwrap(), RoomKind::Channel(s) if s.network == network && s.channel == lowered_name);
            if matches {
                return Some(room);
            }
        }
        None
    }

    /// Persists `room`'s current kind-tagged state back to its room account
    /// data (6); called after a handler mutates persisted room fields.
    pub async fn persist_room(&self, room: &Room) {
        let config = room.to_config();
        if let Ok(value) = serde_json::to_value(&config) {
            if let Err(e) = self.matrix.put_room_account_data(&self.bot_user_id, &room.base.room_id, "irc", &value).await {
                warn!("failed to persist room config for {}: {e}", room.base.room_id);
            }
        }
    }

    fn new_room_base(&self, room_id: String, user_id: String, config: Arc<AsyncMutex<BridgeConfig>>, members: Vec<String>) -> RoomBase {
        RoomBase::new(room_id, user_id, self.bot_user_id.clone(), self.matrix.clone(), self.puppets.clone(), config, members)
    }

    /// Creates and registers a brand-new room of `kind`, inviting `user_id`
    /// into it and persisting its room account data (3, lifecycles).
    pub async fn create_tracked_room(
        &self,
        user_id: &str,
        kind: RoomKind,
        name: impl Into<String>,
        topic: impl Into<String>,
    ) -> anyhow::Result<Arc<Room>> {
        let req = crate::matrix::CreateRoomRequest {
            visibility: "private",
            name: name.into(),
            topic: topic.into(),
            invite: vec![user_id.to_string()],
            is_direct: kind.kind_name() == "control",
            power_level_content_override: crate::matrix::default_power_levels(),
            room_version: None,
            initial_state: vec![],
        };
        let created = self.matrix.create_room(&req, None).await?;
        let config = self.config().await;
        // The bot auto-joins as the room creator; `user_id` is only invited
        // until their own `m.room.member` join event arrives and `add_member`
        // records it.
        let base = self.new_room_base(created.room_id.clone(), user_id.to_string(), config, vec![self.bot_user_id.clone()]);
        let room = Arc::new(Room::new(base, kind));
        self.persist_room(&room).await;
        self.register_room(room.clone()).await;
        Ok(room)
    }

    /// Reconstructs the rooms registry at startup from currently-joined
    /// rooms plus each room's persisted `"irc"` room account data (6).
    pub async fn reload_rooms(&self) -> anyhow::Result<()> {
        let joined = self.matrix.joined_rooms().await?;
        for room_id in joined.joined_rooms {
            let raw = match self.matrix.get_room_account_data(&self.bot_user_id, &room_id, "irc").await {
                Ok(v) => v,
                Err(_) => continue,
            };
            let config: RoomConfig = match serde_json::from_value(raw) {
                Ok(c) => c,
                Err(_) => continue,
            };
            let Some(kind) = RoomKind::from_config(&config) else {
                warn!("room {room_id} has unrecognized persisted type {}", config.kind);
                continue;
            };

            let joined_members = self.matrix.joined_members(&room_id).await?;
            let Some(user_id) = joined_members.joined.keys().find(|m| self.is_local_puppet_or_user(m)).cloned() else {
                continue;
            };
            let member_list: Vec<String> = joined_members.joined.keys().cloned().collect();

            let config_handle = self.config().await;
            let base = self.new_room_base(room_id.clone(), user_id.clone(), config_handle, member_list);
            let is_network = kind.kind_name() == "network";
            let network_name = match &kind {
                RoomKind::Network(s) => Some(s.network.clone()),
                _ => None,
            };
            let connected = matches!(&kind, RoomKind::Network(s) if s.connected);
            let room = Arc::new(Room::new(base, kind));

            // Per the startup lifecycle (3): run is_valid() and either
            // register the room or leave-and-forget it.
            if !room.is_valid() {
                warn!("room {room_id} failed its membership invariant on reload, leaving and forgetting it");
                let _ = self.matrix.leave_room(&room_id, None).await;
                let _ = self.matrix.forget_room(&room_id, None).await;
                continue;
            }

            self.register_room(room.clone()).await;

            if is_network && connected {
                if let Some(network) = network_name {
                    crate::network::connect(self.arc(), room, network).await;
                }
            }
        }
        info!("reloaded {} rooms", self.rooms.read().await.len());
        Ok(())
    }

    fn is_local_puppet_or_user(&self, mxid: &str) -> bool {
        mxid != self.bot_user_id
    }

    /// Handles a brand-new invite to the bot user: gates on the allow-list,
    /// assigns the owner on first run, and creates a ControlRoom with
    /// retry-with-backoff join (6, since a just-created room may not be
    /// immediately joinable from the appservice's view of the federation).
    async fn bootstrap_invite(&self, room_id: &str, inviter: &str) {
        let config = self.config().await;
        let became_owner = {
            let mut cfg = config.lock().await;
            if cfg.owner.is_none() && inviter.ends_with(&format!(":{}", self.server_name)) {
                cfg.owner = Some(inviter.to_string());
                info!("assigned bridge owner to {inviter}");
                true
            } else {
                false
            }
        };
        if became_owner {
            let snapshot = config.lock().await.clone();
            if let Ok(value) = serde_json::to_value(&snapshot) {
                if let Err(e) = self.matrix.put_account_data(&self.bot_user_id, "irc", &value).await {
                    warn!("failed to persist bridge config after owner assignment: {e}");
                }
            }
        }

        let allowed = self.is_user(inviter).await;
        if !allowed {
            warn!("rejecting invite from unauthorized user {inviter}");
            let _ = self.matrix.leave_room(room_id, None).await;
            return;
        }

        let mut joined = false;
        for attempt in 1..=JOIN_RETRIES {
            match self.matrix.join_room(room_id, None).await {
                Ok(()) => {
                    joined = true;
                    break;
                }
                Err(e) => {
                    warn!("join attempt {attempt}/{JOIN_RETRIES} for {room_id} failed: {e}");
                    sleep(JOIN_RETRY_DELAY).await;
                }
            }
        }
        if !joined {
            warn!("giving up joining {room_id} after {JOIN_RETRIES} attempts");
            return;
        }

        // Both the inviter (who created the DM) and the bot (which just
        // joined) are members at this point, satisfying invariant 4.
        let base = self.new_room_base(
            room_id.to_string(),
            inviter.to_string(),
            config.clone(),
            vec![inviter.to_string(), self.bot_user_id.clone()],
        );
        let room = Arc::new(Room::new(base, RoomKind::Control(ControlState {})));
        self.persist_room(&room).await;
        room.base.send_notice(
            None,
            "Welcome! Type HELP for a list of commands, starting with ADDNETWORK to configure an IRC network.",
        );
        self.register_room(room).await;

        if config.lock().await.use_hidden_room {
            if let Err(e) = self.ensure_hidden_room(inviter).await {
                warn!("failed to set up hidden invite-sink room for {inviter}: {e:#}");
            }
        }
    }

    /// Creates the invite-sink HiddenRoom for `user_id`, used so a new
    /// bridge user can be bootstrapped without DMing the bot directly
    /// (11.1). Only invoked when `use_hidden_room` is enabled.
    pub async fn ensure_hidden_room(&self, user_id: &str) -> anyhow::Result<Arc<Room>> {
        if let Some(existing) = self.find_rooms("hidden", user_id).await.into_iter().next() {
            return Ok(existing);
        }
        let room = self
            .create_tracked_room(
                user_id,
                RoomKind::Hidden(HiddenState::default()),
                "IRC bridge invites",
                "Accept invites to bridge rooms here",
            )
            .await?;
        crate::room::hidden::post_init(&room).await;
        self.persist_room(&room).await;
        Ok(room)
    }

    /// Creates a new NetworkRoom for `user_id`/`network`, or re-invites the
    /// user into the existing one (§4.G `OPEN`).
    pub async fn open_network_room(&self, user_id: &str, network: &str, force_new: bool) -> anyhow::Result<Arc<Room>> {
        if !force_new {
            if let Some(existing) = self.network_room_for(user_id, network).await {
                self.matrix.invite(&existing.base.room_id, user_id, None).await.ok();
                return Ok(existing);
            }
        }
        self.create_tracked_room(
            user_id,
            RoomKind::Network(NetworkState {
                network: network.to_string(),
                ..Default::default()
            }),
            format!("IRC: {network}"),
            format!("Network room for {network}"),
        )
        .await
    }

    /// Creates a new PrivateRoom for `user_id`'s chat with `nick` on
    /// `network`, or re-invites the user into the existing one (§4.G
    /// `QUERY`, and unsolicited `PRIVMSG` from a previously-unseen nick).
    pub async fn open_private_room(&self, user_id: &str, network: &str, nick: &str) -> anyhow::Result<Arc<Room>> {
        let lowered = nick.to_lowercase();
        if let Some(existing) = self.sub_room_for(user_id, network, &lowered).await {
            self.matrix.invite(&existing.base.room_id, user_id, None).await.ok();
            return Ok(existing);
        }
        self.create_tracked_room(
            user_id,
            RoomKind::Private(PrivateState {
                network: network.to_string(),
                nick: lowered,
            }),
            nick.to_string(),
            format!("Private chat with {nick} on {network}"),
        )
        .await
    }

    /// Creates a new ChannelRoom for `user_id` joining `channel` on
    /// `network` (driven by our own `JOIN` or the IRC server echoing one).
    pub async fn open_channel_room(&self, user_id: &str, network: &str, channel: &str) -> anyhow::Result<Arc<Room>> {
        let lowered = channel.to_lowercase();
        if let Some(existing) = self.sub_room_for(user_id, network, &lowered).await {
            return Ok(existing);
        }
        let room = self
            .create_tracked_room(
                user_id,
                RoomKind::Channel(ChannelState {
                    network: network.to_string(),
                    channel: lowered,
                    topic: None,
                    members: vec![],
                }),
                channel.to_string(),
                format!("{channel} on {network}"),
            )
            .await?;
        Ok(room)
    }

    pub async fn register_session_async(&self, network_room_id: String, session: Arc<NetworkSession>) {
        self.sessions.write().await.insert(network_room_id, session);
    }

    pub async fn remove_session(&self, network_room_id: &str) {
        self.sessions.write().await.remove(network_room_id);
    }

    pub async fn session_for_room(&self, network_room_id: &str) -> Option<Arc<NetworkSession>> {
        self.sessions.read().await.get(network_room_id).cloned()
    }

    /// The session for `user_id`'s connection to `network`, used by
    /// Private/Channel/Plumbed rooms to relay an outbound message without
    /// holding an owning pointer to the NetworkRoom (9).
    pub async fn session_for(&self, user_id: &str, network: &str) -> Option<Arc<NetworkSession>> {
        let room = self.network_room_for(user_id, network).await?;
        self.session_for_room(&room.base.room_id).await
    }

    /// Ident responder backing search (4.I): scans every live session for
    /// one whose observed local/remote TCP ports match the query, returning
    /// that network's configured ident override (or a lowercase-nick
    /// fallback, the RFC 1413 convention when no override is set).
    pub async fn ident_lookup(&self, local_port: u16, remote_port: u16) -> Option<String> {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            if let Some(ports) = session.ports() {
                if ports.local == local_port && ports.remote == remote_port {
                    return Some(session.ident_username().await);
                }
            }
        }
        None
    }

    async fn on_event(&self, event: Value) {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();
        let room_id = event.get("room_id").and_then(Value::as_str).unwrap_or_default();
        let sender = event.get("sender").and_then(Value::as_str).unwrap_or_default();

        match event_type {
            "m.room.member" => {
                let membership = event
                    .get("content")
                    .and_then(|c| c.get("membership"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let is_direct = event
                    .get("content")
                    .and_then(|c| c.get("is_direct"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let state_key = event.get("state_key").and_then(Value::as_str).unwrap_or_default();
                if membership == "invite" && is_direct && state_key == self.bot_user_id {
                    self.bootstrap_invite(room_id, sender).await;
                    return;
                }
                self.on_member_change(room_id, state_key, membership).await;
            }
            "m.room.message" => {
                if sender == self.bot_user_id {
                    return;
                }
                let room = self.rooms.read().await.get(room_id).cloned();
                if let Some(room) = room {
                    let body = event
                        .get("content")
                        .and_then(|c| c.get("body"))
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let event_id = event.get("event_id").and_then(Value::as_str).unwrap_or_default();
                    if let Err(_invalid) = on_mx_message(&room, &self.arc(), sender, event_id, body).await {
                        self.teardown_room(room_id).await;
                    }
                } else {
                    debug!("message in untracked room {room_id}, ignoring");
                }
            }
            _ => {}
        }
    }

    /// Keeps a tracked room's `RoomBase::members` (3) in sync with every
    /// `m.room.member` event for it, then re-checks the room's membership
    /// invariant: a join/invite adds `who`, a leave/ban/kick removes it, and
    /// a removal that breaks the invariant (e.g. the owner leaving their own
    /// control/channel room, invariants 3/4) triggers cleanup.
    async fn on_member_change(&self, room_id: &str, who: &str, membership: &str) {
        let Some(room) = self.rooms.read().await.get(room_id).cloned() else {
            return;
        };
        match membership {
            "join" | "invite" => room.base.add_member(who),
            "leave" | "ban" => {
                room.base.remove_member(who);
                if !room.is_valid() {
                    self.teardown_room(room_id).await;
                }
            }
            _ => {}
        }
    }

    /// Runs cleanup for a room whose invariant broke (3): leave, forget, and
    /// drop it from the registry, swallowing any further Matrix error since
    /// the room is being abandoned regardless.
    async fn teardown_room(&self, room_id: &str) {
        self.rooms.write().await.remove(room_id);
        self.remove_session(room_id).await;
        let _ = self.matrix.leave_room(room_id, None).await;
        let _ = self.matrix.forget_room(room_id, None).await;
    }
}

#[async_trait]
impl TransactionHandler for Bridge {
    async fn on_transaction(&self, events: Vec<Value>) {
        // events within one transaction are applied in order so per-room
        // state transitions stay consistent; distinct transactions may
        // overlap in practice since axum dispatches each request concurrently.
        for event in events {
            self.on_event(event).await;
        }
    }
}
