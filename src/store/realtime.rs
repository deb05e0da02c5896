//! Server-sent events transport for the record store's realtime endpoint.
//!
//! The handshake is: open `GET /api/realtime`, wait for the `PB_CONNECT` event
//! carrying a client id, then `POST /api/realtime` with the topics to follow.
//! Change notifications arrive afterwards as events named after the topic.

use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::types::RecordEvent;
use super::{Result, StoreError};
use crate::types::RetryInfo;

const CONNECT_EVENT: &str = "PB_CONNECT";

/// Topic covering every record of the messages collection.
pub const MESSAGES_TOPIC: &str = "messages/*";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder; chunks may split lines anywhere,
/// including inside a multi-byte character.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    pending: SseEvent,
    has_data: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a chunk and returns every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = match String::from_utf8(raw) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(
                        target: "talk::store::realtime::feed",
                        "Dropping event stream line that is not valid UTF-8: {}",
                        e
                    );
                    continue;
                }
            };
            if let Some(event) = self.process_line(line.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => {
                if self.has_data {
                    self.pending.data.push('\n');
                }
                self.pending.data.push_str(value);
                self.has_data = true;
            }
            "event" => self.pending.event = value.to_string(),
            "id" => self.pending.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = std::mem::take(&mut self.pending);
        let had_data = std::mem::take(&mut self.has_data);
        if !had_data && event.event.is_empty() {
            return None;
        }
        Some(SseEvent {
            event: if event.event.is_empty() {
                "message".to_string()
            } else {
                event.event
            },
            ..event
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectPayload {
    client_id: String,
}

#[derive(Debug, Clone)]
pub(crate) struct RealtimeEndpoint {
    pub client: reqwest::Client,
    pub base_url: String,
    pub auth_token: Option<String>,
}

enum StreamEnd {
    ReceiverClosed,
    ServerClosed,
}

/// Keeps a conversation's event feed alive until the receiver goes away.
///
/// Reconnects with exponential backoff; the backoff resets every time the
/// topic subscription is confirmed. When retries run out the sender is dropped,
/// which ends the subscription on the consumer side.
pub(crate) async fn run_subscription(
    endpoint: RealtimeEndpoint,
    conversation_id: String,
    events: mpsc::Sender<RecordEvent>,
    mut retry: RetryInfo,
) {
    loop {
        match stream_once(&endpoint, &conversation_id, &events, &mut retry).await {
            Ok(StreamEnd::ReceiverClosed) => {
                tracing::debug!(
                    target: "talk::store::realtime::run_subscription",
                    "Subscriber for conversation {} went away",
                    conversation_id
                );
                return;
            }
            Ok(StreamEnd::ServerClosed) => {
                tracing::debug!(
                    target: "talk::store::realtime::run_subscription",
                    "Realtime stream closed by server, reconnecting"
                );
            }
            Err(e) => {
                tracing::warn!(
                    target: "talk::store::realtime::run_subscription",
                    "Realtime stream for conversation {} failed: {}",
                    conversation_id,
                    e
                );
            }
        }

        if events.is_closed() {
            return;
        }

        retry = match retry.next_attempt() {
            Some(next) => next,
            None => {
                tracing::error!(
                    target: "talk::store::realtime::run_subscription",
                    "Giving up on realtime for conversation {} after {} attempts",
                    conversation_id,
                    retry.attempt
                );
                return;
            }
        };
        tokio::time::sleep(retry.delay()).await;
    }
}

async fn stream_once(
    endpoint: &RealtimeEndpoint,
    conversation_id: &str,
    events: &mpsc::Sender<RecordEvent>,
    retry: &mut RetryInfo,
) -> Result<StreamEnd> {
    let url = format!("{}/api/realtime", endpoint.base_url);
    let response = endpoint
        .client
        .get(&url)
        .header(ACCEPT, "text/event-stream")
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(StoreError::Status {
            status: response.status().as_u16(),
            message: "realtime connect rejected".to_string(),
        });
    }

    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    let mut subscribed = false;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for event in decoder.feed(&chunk) {
            if event.event == CONNECT_EVENT {
                let payload: ConnectPayload = serde_json::from_str(&event.data)?;
                submit_subscriptions(endpoint, &payload.client_id).await?;
                subscribed = true;
                retry.reset();
                tracing::debug!(
                    target: "talk::store::realtime::stream_once",
                    "Realtime client {} subscribed for conversation {}",
                    payload.client_id,
                    conversation_id
                );
                continue;
            }
            if !subscribed || event.event != MESSAGES_TOPIC {
                continue;
            }

            let record_event: RecordEvent = match serde_json::from_str(&event.data) {
                Ok(record_event) => record_event,
                Err(e) => {
                    tracing::warn!(
                        target: "talk::store::realtime::stream_once",
                        "Dropping malformed realtime payload: {}",
                        e
                    );
                    continue;
                }
            };
            if record_event.conversation_id() != Some(conversation_id) {
                continue;
            }
            if events.send(record_event).await.is_err() {
                return Ok(StreamEnd::ReceiverClosed);
            }
        }
    }

    Ok(StreamEnd::ServerClosed)
}

async fn submit_subscriptions(endpoint: &RealtimeEndpoint, client_id: &str) -> Result<()> {
    let mut request = endpoint
        .client
        .post(format!("{}/api/realtime", endpoint.base_url))
        .json(&serde_json::json!({
            "clientId": client_id,
            "subscriptions": [MESSAGES_TOPIC],
        }));
    if let Some(token) = &endpoint.auth_token {
        request = request.header(AUTHORIZATION, token);
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(StoreError::Status {
            status: response.status().as_u16(),
            message: "realtime subscription rejected".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_events_split_across_chunks() {
        let mut decoder = SseDecoder::new();

        assert!(decoder.feed(b"id:abc\nevent:PB_CO").is_empty());
        let events = decoder.feed(b"NNECT\ndata:{\"clientId\":\"abc\"}\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "PB_CONNECT");
        assert_eq!(events[0].id.as_deref(), Some("abc"));
        assert_eq!(events[0].data, "{\"clientId\":\"abc\"}");
    }

    #[test]
    fn handles_crlf_comments_and_multiline_data() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": keepalive\r\nevent: messages/*\r\ndata: line1\r\ndata: line2\r\n\r\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "messages/*");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn unnamed_events_default_to_message_and_blank_lines_are_ignored() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"\n\ndata:x\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
    }

    #[test]
    fn multibyte_characters_split_across_chunks_survive() {
        let mut decoder = SseDecoder::new();
        let stream = "event:messages/*\ndata:{\"content\":\"héllo 👍\"}\n\n".as_bytes();
        let emoji_start = stream
            .windows(4)
            .position(|w| w == "👍".as_bytes())
            .unwrap();
        let (first, second) = stream.split_at(emoji_start + 2);

        assert!(decoder.feed(first).is_empty());
        let events = decoder.feed(second);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"content\":\"héllo 👍\"}");
    }

    #[test]
    fn invalid_utf8_line_is_dropped_and_decoding_continues() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"event:a\ndata:\xff\xfe\ndata:ok\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "a");
        assert_eq!(events[0].data, "ok");
    }

    #[test]
    fn several_events_in_one_chunk() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"event:a\ndata:1\n\nevent:b\ndata:2\n\nevent:c\n");

        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data, "2");
        assert_eq!(decoder.feed(b"data:3\n\n")[0].event, "c");
    }
}
