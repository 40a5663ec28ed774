//! PlumbedRoom (4.G, 11.1, Design Note 9 Open Question): a pre-existing IRC
//! channel plumbed into a pre-existing Matrix room, where every participant
//! (not just the bridge user) sees IRC traffic. Messages carry a
//! zero-width-space-obfuscated sender prefix instead of puppet user_ids, since
//! plumbed rooms don't get per-nick puppets.

use super::Room;
use crate::bridge::Bridge;
use crate::error::RoomInvalid;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

fn default_max_lines() -> usize {
    5
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlumbedState {
    pub network: String,
    pub channel: String,
    /// How many IRC lines a single Matrix message may expand to before the
    /// rest is pasted instead (3).
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    /// Whether a truncated message may be uploaded as a paste instead of
    /// being cut off (3).
    #[serde(default = "default_true")]
    pub use_pastebin: bool,
    /// Whether `@mxid` mentions in the message body get rewritten to the
    /// mentioned user's displayname before relaying to IRC (3).
    #[serde(default)]
    pub use_displaynames: bool,
    /// Whether the bridge must be invited into the IRC channel rather than
    /// joining unprompted, mirrored from the room's `m.room.join_rules` (3).
    #[serde(default)]
    pub need_invite: bool,
}

impl Default for PlumbedState {
    fn default() -> Self {
        PlumbedState {
            network: String::new(),
            channel: String::new(),
            max_lines: default_max_lines(),
            use_pastebin: true,
            use_displaynames: false,
            need_invite: false,
        }
    }
}

/// Every line sent to IRC is budgeted to fit one `PRIVMSG` frame: 512 bytes
/// total minus `:nick!user@host PRIVMSG #channel :` framing and the trailing
/// `\r\n`, with a conservative margin for hostmasks we don't control.
const IRC_LINE_BUDGET: usize = 400;

/// ZWSP (`\u{200b}`) splits a nick in two so IRC clients with highlight-on-nick
/// don't ping the plumbed user for messages that are really from Matrix.
const ZWSP: char = '\u{200b}';

pub fn format_sender(displayname: &str) -> String {
    if displayname.is_empty() {
        return displayname.to_string();
    }
    let mid = displayname.chars().count() / 2 + 1;
    let mut out = String::with_capacity(displayname.len() + ZWSP.len_utf8());
    for (i, c) in displayname.chars().enumerate() {
        if i == mid {
            out.push(ZWSP);
        }
        out.push(c);
    }
    out
}

/// Strips the Matrix rich-reply fallback (`> <@user:hs> quoted text\n\n...`)
/// before relaying to IRC, which has no reply concept.
pub fn strip_reply_fallback(body: &str) -> &str {
    let mut rest = body;
    while let Some(line_end) = rest.find('\n') {
        if rest[..line_end].starts_with("> ") {
            rest = &rest[line_end + 1..];
        } else {
            break;
        }
    }
    rest.trim_start_matches('\n')
}

/// Splits `body` into IRC-frame-sized lines, capping at `max_lines`; the
/// caller is expected to offer a pastebin upload instead when truncation
/// happens (11.1).
pub fn split_long(body: &str, max_lines: usize) -> (Vec<String>, bool) {
    let mut lines = Vec::new();
    for raw_line in body.split('\n') {
        let mut remaining = raw_line;
        if remaining.is_empty() {
            lines.push(String::new());
            continue;
        }
        while !remaining.is_empty() {
            let mut end = remaining.len().min(IRC_LINE_BUDGET);
            while end < remaining.len() && !remaining.is_char_boundary(end) {
                end -= 1;
            }
            lines.push(remaining[..end].to_string());
            remaining = &remaining[end..];
        }
    }
    let truncated = lines.len() > max_lines;
    lines.truncate(max_lines);
    (lines, truncated)
}

/// Rewrites `@mxid` occurrences in `body` to the mentioned user's
/// displayname, using the room's member list (3: "rewrite @mxid->displayname
/// per use_displaynames ... and preserve the mentioned name").
async fn rewrite_mentions(bridge: &Arc<Bridge>, room_id: &str, body: &str) -> String {
    let members = match bridge.matrix().joined_members(room_id).await {
        Ok(m) => m,
        Err(_) => return body.to_string(),
    };
    let mut out = body.to_string();
    for (mxid, member) in members.joined {
        if let Some(name) = member.display_name {
            if !name.is_empty() {
                out = out.replace(&mxid, &name);
            }
        }
    }
    out
}

/// Sends a reaction to `event_id` in `room_id` acknowledging that the
/// message was truncated (✂) or pasted (📝) (3).
async fn react(bridge: &Arc<Bridge>, room_id: &str, event_id: &str, key: &str) {
    if event_id.is_empty() {
        return;
    }
    let content = json!({
        "m.relates_to": {
            "rel_type": "m.annotation",
            "event_id": event_id,
            "key": key,
        }
    });
    if let Err(e) = bridge.matrix().send_event(room_id, "m.reaction", content, None).await {
        log::warn!("failed to react to {event_id} in {room_id}: {e}");
    }
}

pub async fn on_message(room: &Arc<Room>, bridge: &Arc<Bridge>, sender: &str, event_id: &str, body: &str) -> Result<(), RoomInvalid> {
    if sender != room.base.user_id {
        return Ok(());
    }
    let (network, channel, max_lines, use_pastebin, use_displaynames) = {
        let kind = room.kind.lock().unwrap();
        match &*kind {
            super::RoomKind::Plumbed(s) => (s.network.clone(), s.channel.clone(), s.max_lines, s.use_pastebin, s.use_displaynames),
            _ => return Ok(()),
        }
    };
    let Some(session) = bridge.session_for(&room.base.user_id, &network).await else {
        room.base.send_notice(None, "Not connected to this network");
        return Ok(());
    };

    let stripped = strip_reply_fallback(body);
    let rewritten = if use_displaynames {
        rewrite_mentions(bridge, &room.base.room_id, stripped).await
    } else {
        stripped.to_string()
    };
    let (lines, truncated) = split_long(&rewritten, max_lines);
    let prefixed = format_sender(sender);

    if truncated {
        let media_url = if use_pastebin {
            bridge.config().await.lock().await.media_url.clone()
        } else {
            None
        };
        match media_url {
            Some(base) => match bridge.matrix().upload_media(rewritten.as_bytes().to_vec(), "text/plain", "message.txt").await {
                Ok(mxc) => {
                    let link = paste_link(&base, &mxc);
                    session.send_privmsg(&channel, &format!("<{prefixed}> {link}"));
                    react(bridge, &room.base.room_id, event_id, "\u{1f4dd}").await;
                }
                Err(e) => {
                    log::warn!("paste upload failed, falling back to truncated lines: {e}");
                    for line in &lines {
                        session.send_privmsg(&channel, &format!("<{prefixed}> {line}"));
                    }
                    react(bridge, &room.base.room_id, event_id, "\u{2702}").await;
                }
            },
            None => {
                for line in &lines {
                    session.send_privmsg(&channel, &format!("<{prefixed}> {line}"));
                }
                react(bridge, &room.base.room_id, event_id, "\u{2702}").await;
                if !use_pastebin {
                    room.base.send_notice(None, "Message was too long for IRC and has been truncated");
                } else {
                    room.base.send_notice(
                        None,
                        "Message was too long for IRC and has been truncated; set MEDIAURL to paste the rest instead",
                    );
                }
            }
        }
    } else {
        for line in &lines {
            session.send_privmsg(&channel, &format!("<{prefixed}> {line}"));
        }
    }
    Ok(())
}

fn paste_link(media_url: &str, mxc: &str) -> String {
    let rest = mxc.trim_start_matches("mxc://");
    format!("{}/{}", media_url.trim_end_matches('/'), rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_sender_inserts_a_zero_width_space() {
        let formatted = format_sender("alice");
        assert!(formatted.contains(ZWSP));
        assert_eq!(formatted.chars().filter(|c| *c != ZWSP).collect::<String>(), "alice");
    }

    #[test]
    fn strip_reply_fallback_removes_quoted_lines() {
        let body = "> <@alice:hs> original message\n\nmy reply";
        assert_eq!(strip_reply_fallback(body), "my reply");
    }

    #[test]
    fn split_long_caps_at_max_lines_and_reports_truncation() {
        let body = (0..10).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let (lines, truncated) = split_long(&body, 5);
        assert_eq!(lines.len(), 5);
        assert!(truncated);
    }

    #[test]
    fn split_long_respects_the_irc_frame_budget() {
        let long_line = "x".repeat(1000);
        let (lines, _) = split_long(&long_line, 5);
        assert!(lines.iter().all(|l| l.len() <= IRC_LINE_BUDGET));
        assert_eq!(lines.concat(), long_line[..lines.concat().len()]);
    }

    #[test]
    fn default_state_matches_documented_defaults() {
        let state = PlumbedState::default();
        assert_eq!(state.max_lines, 5);
        assert!(state.use_pastebin);
        assert!(!state.use_displaynames);
        assert!(!state.need_invite);
    }
}
