//! Per-network IRC session manager (4.F/4.G): owns the live
//! `IrcConnection` for one bridge user's one network, registration and
//! reconnect handling, and fans inbound `IrcEvent`s out to the
//! Channel/Private/Plumbed rooms they belong to.

use crate::bridge::Bridge;
use crate::irc::{dispatch_message, ConnectionEvent, IrcConnection, IrcEvent};
use crate::room::{channel, Room, RoomKind};
use irc::proto::{Command, Message};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

const WELCOME_AUTOCMD_DELAY: Duration = Duration::from_secs(2);
const WELCOME_JOIN_DELAY: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy)]
pub struct SocketPorts {
    pub local: u16,
    pub remote: u16,
}

enum Outbound {
    Line(Message),
    Disconnect,
}

/// Handle to one live (or reconnecting) network session, registered with
/// the `Bridge` under its NetworkRoom's room_id so command handlers and the
/// ident responder (4.I) can reach it without holding a direct reference.
pub struct NetworkSession {
    bridge: Arc<Bridge>,
    user_id: String,
    network: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    disconnect: AtomicBool,
    ports: StdMutex<Option<SocketPorts>>,
    nick: StdMutex<String>,
}

impl NetworkSession {
    pub fn ports(&self) -> Option<SocketPorts> {
        *self.ports.lock().unwrap()
    }

    /// The ident username to answer queries for this connection with (4.I):
    /// the user's configured override for this network, falling back to the
    /// lowercased nick currently in use, the RFC 1413 convention.
    pub async fn ident_username(&self) -> String {
        let config = self.bridge.config().await;
        let cfg = config.lock().await;
        cfg.idents
            .get(&self.network)
            .cloned()
            .unwrap_or_else(|| self.nick.lock().unwrap().to_lowercase())
    }

    pub fn send_raw(&self, message: Message) {
        let _ = self.outbound.send(Outbound::Line(message));
    }

    pub fn send_privmsg(&self, target: &str, text: &str) {
        self.send_raw(Message::from(Command::PRIVMSG(target.to_string(), text.to_string())));
    }

    /// Requests disconnect (`DISCONNECT`): the reconnect loop checks this
    /// flag after every drop and gives up instead of retrying.
    pub fn request_disconnect(&self) {
        self.disconnect.store(true, Ordering::SeqCst);
        let _ = self.outbound.send(Outbound::Disconnect);
    }
}

/// Starts (or restarts) the session for `room`'s network, registering it
/// with `bridge` under the NetworkRoom's room_id.
pub async fn connect(bridge: Arc<Bridge>, room: Arc<Room>, network: String) -> Arc<NetworkSession> {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let default_nick = room
        .base
        .user_id
        .trim_start_matches('@')
        .split(':')
        .next()
        .unwrap_or("ircuser")
        .to_string();
    let session = Arc::new(NetworkSession {
        bridge: bridge.clone(),
        user_id: room.base.user_id.clone(),
        network: network.clone(),
        outbound: outbound_tx,
        disconnect: AtomicBool::new(false),
        ports: StdMutex::new(None),
        nick: StdMutex::new(default_nick),
    });
    bridge.register_session_async(room.base.room_id.clone(), session.clone()).await;
    tokio::spawn(run(bridge, room, network, session.clone(), outbound_rx));
    session
}

async fn run(bridge: Arc<Bridge>, room: Arc<Room>, network: String, session: Arc<NetworkSession>, mut outbound_rx: mpsc::UnboundedReceiver<Outbound>) {
    loop {
        if session.disconnect.load(Ordering::SeqCst) {
            info!("network {network} for {} disconnected, not reconnecting", room.base.user_id);
            break;
        }

        let servers = {
            let config = bridge.config().await;
            let cfg = config.lock().await;
            cfg.networks.get(&network).map(|n| n.servers.clone()).unwrap_or_default()
        };
        if servers.is_empty() {
            room.base.send_notice(None, format!("No servers configured for {network}"));
            break;
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (mut conn, reader) = IrcConnection::connect_with_failover(servers, events_tx).await;

        let (nick, username, ircname, password) = {
            let kind = room.kind.lock().unwrap();
            match &*kind {
                RoomKind::Network(s) => (
                    s.nick.clone().unwrap_or_else(|| session.nick.lock().unwrap().clone()),
                    s.username.clone().unwrap_or_else(|| "ircassoc".to_string()),
                    s.ircname.clone().unwrap_or_else(|| "ircassoc bridge user".to_string()),
                    s.password.clone(),
                ),
                _ => break,
            }
        };
        *session.nick.lock().unwrap() = nick.clone();

        if let Some(password) = &password {
            if conn.send(Message::from(Command::PASS(password.clone()))).await.is_err() {
                sleep(crate::irc::reconnect_delay()).await;
                continue;
            }
        }
        if conn.send(Message::from(Command::NICK(nick.clone()))).await.is_err() {
            sleep(crate::irc::reconnect_delay()).await;
            continue;
        }
        let _ = conn
            .send(Message::from(Command::USER(username, "0".to_string(), ircname)))
            .await;

        let mut names_acc: HashMap<String, Vec<String>> = HashMap::new();
        let mut welcomed = false;
        let mut ping_ticker = tokio::time::interval(crate::irc::liveness_interval());
        ping_ticker.tick().await; // first tick fires immediately
        let mut last_data = tokio::time::Instant::now();

        'conn: loop {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(ConnectionEvent::Connected { local_addr, peer_addr, .. }) => {
                            *session.ports.lock().unwrap() = Some(SocketPorts { local: local_addr.port(), remote: peer_addr.port() });
                        }
                        Some(ConnectionEvent::Message(message)) => {
                            last_data = tokio::time::Instant::now();
                            let irc_event = dispatch_message(&message);
                            handle_event(&bridge, &room, &network, &session, &mut conn, &mut names_acc, &mut welcomed, irc_event).await;
                        }
                        Some(ConnectionEvent::Disconnected { reason }) => {
                            warn!("network {network} for {} disconnected: {reason}", room.base.user_id);
                            room.base.send_notice(None, format!("Disconnected from {network}: {reason}"));
                            break 'conn;
                        }
                        None => break 'conn,
                    }
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(Outbound::Line(message)) => { let _ = conn.send(message).await; }
                        Some(Outbound::Disconnect) | None => {
                            let _ = conn.send(Message::from(Command::QUIT(Some("Disconnected".to_string())))).await;
                            break 'conn;
                        }
                    }
                }
                _ = ping_ticker.tick() => {
                    let idle = last_data.elapsed();
                    if idle >= crate::irc::ping_timeout() {
                        warn!("network {network} for {} timed out: no data received", room.base.user_id);
                        room.base.send_notice(None, format!("Disconnected from {network}: No data received."));
                        break 'conn;
                    } else if idle >= crate::irc::liveness_interval() && conn.send_ping("ircassoc").await.is_err() {
                        break 'conn;
                    }
                }
            }
            if session.disconnect.load(Ordering::SeqCst) {
                break 'conn;
            }
        }

        reader.abort();
        {
            let mut kind = room.kind.lock().unwrap();
            if let RoomKind::Network(s) = &mut *kind {
                s.connected = false;
            }
        }
        bridge.persist_room(&room).await;

        if session.disconnect.load(Ordering::SeqCst) {
            break;
        }
        sleep(crate::irc::reconnect_delay()).await;
    }

    bridge.remove_session(&room.base.room_id).await;
}

#[allow(clippy::too_many_arguments)]
async fn handle_event(
    bridge: &Arc<Bridge>,
    room: &Arc<Room>,
    network: &str,
    session: &Arc<NetworkSession>,
    conn: &mut IrcConnection,
    names_acc: &mut HashMap<String, Vec<String>>,
    welcomed: &mut bool,
    event: IrcEvent,
) {
    match event {
        IrcEvent::Welcome { nick } => {
            *session.nick.lock().unwrap() = nick;
            if *welcomed {
                return;
            }
            *welcomed = true;
            {
                let mut kind = room.kind.lock().unwrap();
                if let RoomKind::Network(s) = &mut *kind {
                    s.connected = true;
                }
            }
            bridge.persist_room(room).await;
            room.base.send_notice(None, format!("Connected to {network}"));

            let autocmd = {
                let kind = room.kind.lock().unwrap();
                match &*kind {
                    RoomKind::Network(s) => s.autocmd.clone(),
                    _ => None,
                }
            };
            if let Some(autocmd) = autocmd {
                sleep(WELCOME_AUTOCMD_DELAY).await;
                for line in autocmd.split(';').map(str::trim).filter(|l| !l.is_empty()) {
                    if let Ok(message) = Message::from_str(&format!("{line}\r\n")) {
                        let _ = conn.send(message).await;
                    }
                }
            }

            sleep(WELCOME_JOIN_DELAY).await;
            for room_kind in bridge.find_rooms("channel", &room.base.user_id).await {
                let channel_name = match &*room_kind.kind.lock().unwrap() {
                    RoomKind::Channel(s) if s.network == network => Some(s.channel.clone()),
                    _ => None,
                };
                if let Some(channel_name) = channel_name {
                    let _ = conn.send(Message::from(Command::JOIN(channel_name, None, None))).await;
                }
            }
        }
        IrcEvent::Names { channel, names } => {
            names_acc.entry(channel).or_default().extend(names);
        }
        IrcEvent::EndOfNames { channel } => {
            let names = names_acc.remove(&channel).unwrap_or_default();
            let self_nick = session.nick.lock().unwrap().clone();
            reconcile_channel_membership(bridge, room, network, &channel, names, &self_nick).await;
        }
        IrcEvent::Join { nick, channel } => {
            if nick.eq_ignore_ascii_case(&session.nick.lock().unwrap()) {
                bridge.open_channel_room(&room.base.user_id, network, &channel).await.ok();
                return;
            }
            if let Some(channel_room) = bridge.sub_room_for(&room.base.user_id, network, &channel.to_lowercase()).await {
                invite_puppet(bridge, &channel_room.base.room_id, network, &nick).await;
                add_member(&channel_room, &bridge.puppets().mxid(network, &nick));
                bridge.persist_room(&channel_room).await;
            }
        }
        IrcEvent::Part { nick, channel, .. } => {
            if let Some(channel_room) = bridge.sub_room_for(&room.base.user_id, network, &channel.to_lowercase()).await {
                let mxid = bridge.puppets().mxid(network, &nick);
                let _ = bridge.matrix().kick(&channel_room.base.room_id, &mxid, None).await;
                remove_member(&channel_room, &mxid);
                bridge.persist_room(&channel_room).await;
            }
        }
        IrcEvent::Kick { channel, nick, reason, .. } => {
            if let Some(channel_room) = bridge.sub_room_for(&room.base.user_id, network, &channel.to_lowercase()).await {
                let mxid = bridge.puppets().mxid(network, &nick);
                let _ = bridge.matrix().kick(&channel_room.base.room_id, &mxid, reason.as_deref()).await;
                remove_member(&channel_room, &mxid);
                bridge.persist_room(&channel_room).await;
            }
        }
        IrcEvent::Quit { nick, .. } => {
            for channel_room in bridge.find_rooms("channel", &room.base.user_id).await {
                let matches_network = matches!(&*channel_room.kind.lock().unwrap(), RoomKind::Channel(s) if s.network == network);
                if matches_network {
                    let mxid = bridge.puppets().mxid(network, &nick);
                    let _ = bridge.matrix().kick(&channel_room.base.room_id, &mxid, Some("quit")).await;
                    remove_member(&channel_room, &mxid);
                    bridge.persist_room(&channel_room).await;
                }
            }
        }
        IrcEvent::Mode { by, target, modes, args } => {
            if let Some(target_room) = bridge.sub_room_for(&room.base.user_id, network, &target.to_lowercase()).await {
                let rest = if args.is_empty() { String::new() } else { format!(" {}", args.join(" ")) };
                target_room.base.send_notice(None, format!("{by} sets mode {modes}{rest} on {target}"));
            }
        }
        IrcEvent::Topic { channel, topic } => {
            if let Some(channel_room) = bridge.sub_room_for(&room.base.user_id, network, &channel.to_lowercase()).await {
                {
                    let mut kind = channel_room.kind.lock().unwrap();
                    if let RoomKind::Channel(s) = &mut *kind {
                        s.topic = topic.clone();
                    }
                }
                bridge.persist_room(&channel_room).await;
                match topic {
                    Some(topic) => channel_room.base.send_notice(None, format!("Topic: {topic}")),
                    None => channel_room.base.send_notice(None, "Topic unset"),
                }
            }
        }
        IrcEvent::PrivMsg { from, target, text } | IrcEvent::Notice { from, target, text } => {
            relay_inbound(bridge, room, network, &from, &target, &text).await;
        }
        IrcEvent::NicknameInUse { tried } => {
            let candidate = crate::irc::next_nick_candidate(&tried);
            *session.nick.lock().unwrap() = candidate.clone();
            let _ = conn.send(Message::from(Command::NICK(candidate))).await;
        }
        IrcEvent::Ping { token } => {
            let _ = conn.send(Message::from(Command::PONG(token, None))).await;
        }
        IrcEvent::HostHidden { .. } | IrcEvent::Other(_) => {}
    }
}

/// Relays an inbound `PRIVMSG`/`NOTICE` into the Matrix room for its
/// target: a channel room if the target starts with a channel prefix,
/// otherwise the sender's private room (opened on demand).
async fn relay_inbound(bridge: &Arc<Bridge>, room: &Arc<Room>, network: &str, from: &str, target: &str, text: &str) {
    let target_room = if target.starts_with('#') || target.starts_with('&') {
        bridge.sub_room_for(&room.base.user_id, network, &target.to_lowercase()).await
    } else {
        match bridge.open_private_room(&room.base.user_id, network, from).await {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("failed to open private room for {from} on {network}: {e:#}");
                None
            }
        }
    };
    let Some(target_room) = target_room else {
        debug!("no room for inbound message from {from} to {target} on {network}");
        return;
    };
    match bridge.puppets().ensure_puppet(network, from).await {
        Ok(mxid) => target_room.base.send_message(Some(mxid), text.to_string()),
        Err(e) => warn!("failed to ensure puppet for {from} on {network}: {e}"),
    }
}

async fn invite_puppet(bridge: &Arc<Bridge>, room_id: &str, network: &str, nick: &str) {
    match bridge.puppets().ensure_puppet(network, nick).await {
        Ok(mxid) => {
            let _ = bridge.matrix().invite(room_id, &mxid, None).await;
            if bridge.matrix().join_room(room_id, Some(&mxid)).await.is_err() {
                let _ = bridge.matrix().synapse_admin_join(room_id, &mxid).await;
            }
        }
        Err(e) => warn!("failed to ensure puppet for {nick} on {network}: {e}"),
    }
}

fn add_member(room: &Arc<Room>, mxid: &str) {
    let mut kind = room.kind.lock().unwrap();
    if let RoomKind::Channel(s) = &mut *kind {
        if !s.members.iter().any(|m| m == mxid) {
            s.members.push(mxid.to_string());
        }
    }
}

fn remove_member(room: &Arc<Room>, mxid: &str) {
    let mut kind = room.kind.lock().unwrap();
    if let RoomKind::Channel(s) = &mut *kind {
        s.members.retain(|m| m != mxid);
    }
}

/// NAMES reconciliation (§4.G testable scenario): diffs the channel's
/// previously known membership against a fresh `NAMES` list and invites or
/// kicks puppets to match, via the pure `channel::reconcile_names` helper.
async fn reconcile_channel_membership(
    bridge: &Arc<Bridge>,
    room: &Arc<Room>,
    network: &str,
    channel: &str,
    raw_names: Vec<String>,
    self_nick: &str,
) {
    let Ok(channel_room) = bridge.open_channel_room(&room.base.user_id, network, channel).await else {
        return;
    };
    let nicks: Vec<String> = raw_names
        .iter()
        .map(|n| n.trim_start_matches(['@', '+', '%', '&', '~']).to_string())
        .filter(|n| !n.eq_ignore_ascii_case(self_nick))
        .collect();
    let target_mxids: Vec<String> = nicks.iter().map(|n| bridge.puppets().mxid(network, n)).collect();

    let previous = match &*channel_room.kind.lock().unwrap() {
        RoomKind::Channel(s) => s.members.clone(),
        _ => return,
    };

    let (to_join, to_part) = channel::reconcile_names(&previous, &target_mxids);

    for mxid in &to_join {
        let nick = nicks
            .iter()
            .find(|n| bridge.puppets().mxid(network, n) == *mxid)
            .cloned()
            .unwrap_or_default();
        invite_puppet(bridge, &channel_room.base.room_id, network, &nick).await;
    }
    for mxid in &to_part {
        let _ = bridge.matrix().kick(&channel_room.base.room_id, mxid, None).await;
    }

    {
        let mut kind = channel_room.kind.lock().unwrap();
        if let RoomKind::Channel(s) = &mut *kind {
            s.members = target_mxids;
        }
    }
    bridge.persist_room(&channel_room).await;
}
