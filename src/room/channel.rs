//! ChannelRoom (4.G): one per joined IRC channel. Reconciles the channel's
//! member list against the room's Matrix membership on `366`
//! (`RPL_ENDOFNAMES`), and relays `JOIN`/`PART`/`MODE`/`TOPIC` as Matrix state
//! or notices.

use super::Room;
use crate::bridge::Bridge;
use crate::error::RoomInvalid;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelState {
    pub network: String,
    pub channel: String,
    #[serde(default)]
    pub topic: Option<String>,
    /// Puppet mxids last known to be joined, used as the "before" side of the
    /// NAMES reconciliation diff.
    #[serde(default)]
    pub members: Vec<String>,
}

pub async fn on_message(room: &Arc<Room>, bridge: &Arc<Bridge>, sender: &str, _event_id: &str, body: &str) -> Result<(), RoomInvalid> {
    if sender != room.base.user_id {
        // our own puppets echoing their relayed messages back, not the bridge user
        return Ok(());
    }
    let (network, channel) = {
        let kind = room.kind.lock().unwrap();
        match &*kind {
            super::RoomKind::Channel(s) => (s.network.clone(), s.channel.clone()),
            _ => return Ok(()),
        }
    };
    match bridge.session_for(&room.base.user_id, &network).await {
        Some(session) => session.send_privmsg(&channel, body),
        None => room.base.send_notice(None, "Not connected to this network"),
    }
    Ok(())
}

/// Computes the join/part diff between the channel's previously known
/// membership and a fresh `NAMES` list (§8 testable scenario): members
/// present in both sets are left alone, `names` not in `members` need a
/// Matrix invite+join, and `members` not in `names` need a Matrix kick.
pub fn reconcile_names(previous: &[String], names: &[String]) -> (Vec<String>, Vec<String>) {
    let previous_set: HashSet<&String> = previous.iter().collect();
    let names_set: HashSet<&String> = names.iter().collect();

    let to_join = names.iter().filter(|n| !previous_set.contains(n)).cloned().collect();
    let to_part = previous.iter().filter(|m| !names_set.contains(m)).cloned().collect();
    (to_join, to_part)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_detects_joins_and_parts() {
        let previous = vec!["@irc_net_alice:hs".to_string(), "@irc_net_bob:hs".to_string()];
        let names = vec!["@irc_net_bob:hs".to_string(), "@irc_net_carol:hs".to_string()];
        let (to_join, to_part) = reconcile_names(&previous, &names);
        assert_eq!(to_join, vec!["@irc_net_carol:hs".to_string()]);
        assert_eq!(to_part, vec!["@irc_net_alice:hs".to_string()]);
    }

    #[test]
    fn identical_lists_produce_no_changes() {
        let list = vec!["@irc_net_alice:hs".to_string()];
        let (to_join, to_part) = reconcile_names(&list, &list);
        assert!(to_join.is_empty() && to_part.is_empty());
    }
}
