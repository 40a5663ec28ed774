//! Per-room outbound event queue (4.B): coalesces adjacent same-author,
//! same-type messages before handing a batch to the serial runner (4.C) for
//! ordered delivery through the Matrix client adapter (4.E).

use crate::matrix::MatrixApi;
use crate::runner::SerialRunner;
use log::warn;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// `m.room.message` content, shaped for coalescing (3, 4.B).
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct MessageContent {
    pub msgtype: &'static str,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        MessageContent {
            msgtype: "m.text",
            body: body.into(),
            format: None,
            formatted_body: None,
        }
    }

    pub fn text_html(body: impl Into<String>, formatted: impl Into<String>) -> Self {
        MessageContent {
            msgtype: "m.text",
            body: body.into(),
            format: Some("org.matrix.custom.html"),
            formatted_body: Some(formatted.into()),
        }
    }

    pub fn notice(body: impl Into<String>) -> Self {
        MessageContent {
            msgtype: "m.notice",
            body: body.into(),
            format: None,
            formatted_body: None,
        }
    }

    pub fn notice_html(body: impl Into<String>, formatted: impl Into<String>) -> Self {
        MessageContent {
            msgtype: "m.notice",
            body: body.into(),
            format: Some("org.matrix.custom.html"),
            formatted_body: Some(formatted.into()),
        }
    }

    pub fn emote(body: impl Into<String>) -> Self {
        MessageContent {
            msgtype: "m.emote",
            body: body.into(),
            format: None,
            formatted_body: None,
        }
    }
}

/// An `{type, content, user_id?}` event record (3).
#[derive(Clone, Debug)]
pub struct OutboundEvent {
    pub event_type: &'static str,
    pub user_id: Option<String>,
    pub content: MessageContent,
}

impl OutboundEvent {
    pub fn message(content: MessageContent, user_id: Option<String>) -> Self {
        OutboundEvent {
            event_type: "m.room.message",
            user_id,
            content,
        }
    }

    /// True when `self` and `other` are adjacent-mergeable per 4.B: same
    /// type, same author, same msgtype, and matching presence of `format`.
    fn mergeable_with(&self, other: &OutboundEvent) -> bool {
        self.event_type == other.event_type
            && self.user_id == other.user_id
            && self.content.msgtype == other.content.msgtype
            && self.content.format.is_some() == other.content.format.is_some()
    }

    fn merge(&mut self, other: OutboundEvent) {
        self.content.body.push('\n');
        self.content.body.push_str(&other.content.body);
        if let (Some(formatted), Some(new_formatted)) =
            (&mut self.content.formatted_body, other.content.formatted_body)
        {
            formatted.push_str("<br>");
            formatted.push_str(&new_formatted);
        }
    }
}

const FLUSH_WINDOW: Duration = Duration::from_secs(1);
const FLUSH_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl EventQueue {
    pub fn new(matrix: Arc<dyn MatrixApi>, runner: SerialRunner, room_id: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, matrix, runner, room_id));
        EventQueue { tx }
    }

    /// Enqueues `event`; merges with the previous buffered event when
    /// possible, otherwise forces a flush of the whole buffer (4.B).
    pub fn enqueue(&self, event: OutboundEvent) {
        let _ = self.tx.send(event);
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<OutboundEvent>,
    matrix: Arc<dyn MatrixApi>,
    runner: SerialRunner,
    room_id: String,
) {
    let mut buf: Vec<OutboundEvent> = Vec::new();
    // `None` models the Python source's `self._start = 0`: the next flush
    // check (`now >= start + 1.0s`) is unconditionally true.
    let mut start: Option<Instant> = None;

    loop {
        if buf.is_empty() {
            match rx.recv().await {
                Some(event) => {
                    start = Some(Instant::now());
                    buf.push(event);
                    if Instant::now() >= start.unwrap() + FLUSH_WINDOW {
                        flush(&mut buf, &matrix, &runner, &room_id);
                        start = None;
                    }
                }
                None => return,
            }
            continue;
        }

        let deadline = Instant::now() + FLUSH_DELAY;
        tokio::select! {
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(event) => {
                        let now = Instant::now();
                        let merged = buf
                            .last_mut()
                            .map(|prev| prev.mergeable_with(&event))
                            .unwrap_or(false);
                        if merged {
                            buf.last_mut().unwrap().merge(event);
                        } else {
                            start = None;
                            buf.push(event);
                        }

                        let flush_now = match start {
                            None => true,
                            Some(t) => now >= t + FLUSH_WINDOW,
                        };
                        if flush_now {
                            flush(&mut buf, &matrix, &runner, &room_id);
                            start = None;
                        }
                    }
                    None => {
                        flush(&mut buf, &matrix, &runner, &room_id);
                        return;
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                flush(&mut buf, &matrix, &runner, &room_id);
                start = None;
            }
        }
    }
}

fn flush(buf: &mut Vec<OutboundEvent>, matrix: &Arc<dyn MatrixApi>, runner: &SerialRunner, room_id: &str) {
    if buf.is_empty() {
        return;
    }
    let events = std::mem::take(buf);
    let matrix = matrix.clone();
    let room_id = room_id.to_string();
    runner.schedule(async move {
        for event in events {
            let content = match serde_json::to_value(&event.content) {
                Ok(v) => v,
                Err(e) => {
                    warn!("failed to serialize outbound event for {room_id}: {e}");
                    continue;
                }
            };
            if let Err(e) = matrix
                .send_event(&room_id, event.event_type, content, event.user_id.as_deref())
                .await
            {
                warn!("failed to send event to {room_id}: {e}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::test_support::RecordingMatrixApi;

    #[tokio::test]
    async fn coalesces_three_texts_from_the_same_author() {
        let matrix = Arc::new(RecordingMatrixApi::new());
        let queue = EventQueue::new(matrix.clone(), SerialRunner::new(), "!room:x".to_string());

        for body in ["a", "b", "c"] {
            queue.enqueue(OutboundEvent::message(
                MessageContent::text(body),
                Some("@p:x".to_string()),
            ));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
        let sent = matrix.sent_bodies();
        assert_eq!(sent, vec!["a\nb\nc".to_string()]);
    }

    #[tokio::test]
    async fn text_then_emote_does_not_coalesce() {
        let matrix = Arc::new(RecordingMatrixApi::new());
        let queue = EventQueue::new(matrix.clone(), SerialRunner::new(), "!room:x".to_string());

        queue.enqueue(OutboundEvent::message(
            MessageContent::text("hi"),
            Some("@p:x".to_string()),
        ));
        queue.enqueue(OutboundEvent::message(
            MessageContent::emote("waves"),
            Some("@p:x".to_string()),
        ));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(matrix.sent_bodies(), vec!["hi".to_string(), "waves".to_string()]);
    }

    #[tokio::test]
    async fn different_authors_never_merge() {
        let matrix = Arc::new(RecordingMatrixApi::new());
        let queue = EventQueue::new(matrix.clone(), SerialRunner::new(), "!room:x".to_string());

        queue.enqueue(OutboundEvent::message(
            MessageContent::text("hi"),
            Some("@p1:x".to_string()),
        ));
        queue.enqueue(OutboundEvent::message(
            MessageContent::text("hello"),
            Some("@p2:x".to_string()),
        ));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(matrix.sent_bodies(), vec!["hi".to_string(), "hello".to_string()]);
    }
}
