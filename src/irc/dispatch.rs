//! Numeric and command dispatch (4.F/4.G): turns a decoded `irc::Message`
//! into the small set of semantic events the room layer cares about. Every
//! other server message is still made available, as `IrcEvent::Other`, for
//! ControlRoom's RAW echo (§6) rather than silently dropped.

use irc::proto::{Command, Message, Prefix, Response};

#[derive(Debug, Clone)]
pub enum IrcEvent {
    Welcome { nick: String },
    Names { channel: String, names: Vec<String> },
    EndOfNames { channel: String },
    Topic { channel: String, topic: Option<String> },
    HostHidden { host: String },
    Join { nick: String, channel: String },
    Part { nick: String, channel: String, reason: Option<String> },
    Kick { by: String, channel: String, nick: String, reason: Option<String> },
    Mode { by: String, target: String, modes: String, args: Vec<String> },
    PrivMsg { from: String, target: String, text: String },
    Notice { from: String, target: String, text: String },
    Quit { nick: String, reason: Option<String> },
    Ping { token: String },
    NicknameInUse { tried: String },
    Other(Message),
}

fn nick_of(prefix: &Option<Prefix>) -> String {
    match prefix {
        Some(Prefix::Nickname(nick, _, _)) => nick.clone(),
        Some(Prefix::ServerName(name)) => name.clone(),
        None => String::new(),
    }
}

pub fn dispatch_message(message: &Message) -> IrcEvent {
    let from = nick_of(&message.prefix);
    match &message.command {
        Command::Response(Response::RPL_WELCOME, args) => IrcEvent::Welcome {
            nick: args.first().cloned().unwrap_or_default(),
        },
        Command::Response(Response::RPL_NAMREPLY, args) => {
            let channel = args.get(args.len().saturating_sub(2)).cloned().unwrap_or_default();
            let names = args
                .last()
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default();
            IrcEvent::Names { channel, names }
        }
        Command::Response(Response::RPL_ENDOFNAMES, args) => IrcEvent::EndOfNames {
            channel: args.get(1).cloned().unwrap_or_default(),
        },
        Command::Response(Response::RPL_TOPIC, args) => IrcEvent::Topic {
            channel: args.get(1).cloned().unwrap_or_default(),
            topic: args.get(2).cloned(),
        },
        Command::Response(Response::RPL_NOTOPIC, args) => IrcEvent::Topic {
            channel: args.get(1).cloned().unwrap_or_default(),
            topic: None,
        },
        Command::Response(Response::RPL_HOSTHIDDEN, args) => IrcEvent::HostHidden {
            host: args.get(1).cloned().unwrap_or_default(),
        },
        Command::Response(Response::ERR_NICKNAMEINUSE, args) => IrcEvent::NicknameInUse {
            tried: args.get(1).cloned().unwrap_or_default(),
        },
        Command::JOIN(channel, _, _) => IrcEvent::Join { nick: from, channel: channel.clone() },
        Command::PART(channel, reason) => IrcEvent::Part {
            nick: from,
            channel: channel.clone(),
            reason: reason.clone(),
        },
        Command::KICK(channel, nick, reason) => IrcEvent::Kick {
            by: from,
            channel: channel.clone(),
            nick: nick.clone(),
            reason: reason.clone(),
        },
        Command::MODE(target, modes, args) => IrcEvent::Mode {
            by: from,
            target: target.clone(),
            modes: modes.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(" "),
            args: args.iter().flatten().cloned().collect(),
        },
        Command::TOPIC(channel, topic) => IrcEvent::Topic {
            channel: channel.clone(),
            topic: topic.clone(),
        },
        Command::PRIVMSG(target, text) => IrcEvent::PrivMsg {
            from,
            target: target.clone(),
            text: text.clone(),
        },
        Command::NOTICE(target, text) => IrcEvent::Notice {
            from,
            target: target.clone(),
            text: text.clone(),
        },
        Command::QUIT(reason) => IrcEvent::Quit { nick: from, reason: reason.clone() },
        Command::PING(token, _) => IrcEvent::Ping { token: token.clone() },
        _ => IrcEvent::Other(message.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn privmsg_carries_sender_and_text() {
        let msg = Message::from_str(":alice!a@h PRIVMSG #chan :hello there\r\n").unwrap();
        match dispatch_message(&msg) {
            IrcEvent::PrivMsg { from, target, text } => {
                assert_eq!(from, "alice");
                assert_eq!(target, "#chan");
                assert_eq!(text, "hello there");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn join_carries_channel_and_joiner() {
        let msg = Message::from_str(":bob!b@h JOIN #chan\r\n").unwrap();
        match dispatch_message(&msg) {
            IrcEvent::Join { nick, channel } => {
                assert_eq!(nick, "bob");
                assert_eq!(channel, "#chan");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unrecognized_commands_fall_back_to_other() {
        let msg = Message::from_str("WALLOPS :hi\r\n").unwrap();
        assert!(matches!(dispatch_message(&msg), IrcEvent::Other(_)));
    }
}
