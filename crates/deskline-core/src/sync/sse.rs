//! Server-Sent Events source for the realtime channel

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use super::realtime::ChangeSource;
use super::transport::{normalize_base_url, parse_api_error};
use crate::error::{Error, Result};
use crate::models::Table;
use crate::protocol::ChangeEvent;

/// Incremental `text/event-stream` decoder.
///
/// Yields the `data` payload of each complete event. Comment lines (used as
/// keep-alives) and other fields are skipped.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some((end, separator)) = find_event_end(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + separator).collect();
            let text = String::from_utf8_lossy(&raw[..end]);

            let data: Vec<&str> = text
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|value| value.strip_prefix(' ').unwrap_or(value))
                .collect();
            if !data.is_empty() {
                events.push(data.join("\n"));
            }
        }
        events
    }
}

// Position of the first blank-line separator and its length
fn find_event_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|window| window == b"\n\n");
    let crlf = buffer.windows(4).position(|window| window == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(lf), Some(crlf)) if crlf < lf => Some((crlf, 4)),
        (Some(lf), _) => Some((lf, 2)),
        (None, Some(crlf)) => Some((crlf, 4)),
        (None, None) => None,
    }
}

/// Realtime change source backed by `GET /v1/realtime`
#[derive(Clone)]
pub struct SseChangeSource {
    base_url: String,
    access_token: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for SseChangeSource {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SseChangeSource")
            .field("base_url", &self.base_url)
            .field("access_token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl SseChangeSource {
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            base_url: normalize_base_url(base_url.into())?,
            access_token: access_token.into(),
            client: reqwest::Client::builder().build()?,
        })
    }
}

#[async_trait]
impl ChangeSource for SseChangeSource {
    async fn subscribe(&self, tables: &[Table]) -> Result<BoxStream<'static, Result<ChangeEvent>>> {
        let tables: Vec<&str> = tables.iter().map(|table| table.as_str()).collect();
        let response = self
            .client
            .get(format!(
                "{}/v1/realtime?tables={}",
                self.base_url,
                tables.join(",")
            ))
            .bearer_auth(&self.access_token)
            .header("Accept", "text/event-stream")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(parse_api_error(status, &body)));
        }

        let events = stream::unfold(
            (response, SseParser::default(), VecDeque::<String>::new()),
            |(mut response, mut parser, mut queue)| async move {
                loop {
                    if let Some(data) = queue.pop_front() {
                        let event = serde_json::from_str::<ChangeEvent>(&data).map_err(Error::from);
                        return Some((event, (response, parser, queue)));
                    }
                    match response.chunk().await {
                        Ok(Some(bytes)) => queue.extend(parser.push(&bytes)),
                        Ok(None) => return None,
                        Err(error) => {
                            return Some((Err(Error::from(error)), (response, parser, queue)));
                        }
                    }
                }
            },
        );
        Ok(events.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parser_handles_split_chunks_and_keepalives() {
        let mut parser = SseParser::default();
        assert!(parser.push(b": keep-alive\n\n").is_empty());
        assert!(parser.push(b"event: change\ndata: {\"a\"").is_empty());
        assert_eq!(parser.push(b":1}\n\ndata: x\n"), vec!["{\"a\":1}".to_string()]);
        assert_eq!(parser.push(b"\n"), vec!["x".to_string()]);
    }

    #[test]
    fn parser_accepts_crlf_and_multiline_data() {
        let mut parser = SseParser::default();
        let events = parser.push(b"data: one\r\ndata: two\r\n\r\n");
        assert_eq!(events, vec!["one\ntwo".to_string()]);
    }

    #[test]
    fn parsed_payload_decodes_as_change_event() {
        let mut parser = SseParser::default();
        let id = uuid::Uuid::now_v7();
        let frame = format!("data: {{\"event_type\":\"delete\",\"table\":\"tickets\",\"id\":\"{id}\"}}\n\n");
        let data = parser.push(frame.as_bytes());
        let event: ChangeEvent = serde_json::from_str(&data[0]).unwrap();
        assert_eq!(
            event,
            ChangeEvent::Delete {
                table: Table::Tickets,
                id
            }
        );
    }
}
