//! HiddenRoom (11.1): an invite-sink room used to bootstrap a bridge user
//! without forcing them to DM the bridge bot directly. At most one exists per
//! bridge user, and only when `use_hidden_room` is enabled (6).

use super::Room;
use crate::bridge::Bridge;
use crate::error::RoomInvalid;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HiddenState {
    /// Set once the room has run its post-init member-list-freeing step, so
    /// a restart doesn't repeat it.
    #[serde(default)]
    pub initialized: bool,
}

impl HiddenState {
    /// A HiddenRoom's own state carries nothing that can go stale on its own;
    /// the invariants that can actually break it - `use_hidden_room` being
    /// disabled, or a second HiddenRoom appearing for the same user - are
    /// properties of the bridge's room registry and config, not of this
    /// struct, so they're enforced where a room is created or reloaded
    /// (`Bridge::ensure_hidden_room`, `Bridge::reload_rooms`) rather than here.
    pub fn is_valid(&self) -> bool {
        true
    }
}

/// After a HiddenRoom is created, its member list is intentionally left
/// freed of any puppet: it exists to receive control-room invites, not to
/// carry chat history of its own.
pub async fn post_init(room: &Room) {
    let mut kind = room.kind.lock().unwrap();
    if let super::RoomKind::Hidden(state) = &mut *kind {
        state.initialized = true;
    }
}

pub async fn on_message(room: &Arc<Room>, _bridge: &Arc<Bridge>, _sender: &str, _event_id: &str, _body: &str) -> Result<(), RoomInvalid> {
    room.base.send_notice(None, "This room only relays invites; open a network or channel room to chat");
    Ok(())
}
