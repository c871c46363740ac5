/// Server-sent-events transport: one streaming GET per topic
use super::{ChannelTransport, Subscription, Topic};
use crate::error::{Result, SyncError};
use crate::event::PushEvent;
use crate::http_client::{authorized_request, new_client, read_body, status_error, HttpClient};
use crate::model::Credential;
use async_trait::async_trait;
use http::Method;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const STREAM_BUFFER: usize = 256;

pub struct SseTransport {
    base_url: String,
    client: HttpClient,
    readers: Arc<Mutex<HashMap<Topic, JoinHandle<()>>>>,
}

impl SseTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: new_client(),
            readers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn topic_url(&self, topic: &Topic) -> String {
        format!(
            "{}/topics/{}",
            self.base_url,
            urlencoding::encode(topic.as_str())
        )
    }

    fn replace_reader(&self, topic: &Topic, handle: Option<JoinHandle<()>>) {
        let mut readers = self
            .readers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = match handle {
            Some(h) => readers.insert(topic.clone(), h),
            None => readers.remove(topic),
        };
        if let Some(old) = previous {
            old.abort();
        }
    }
}

#[async_trait]
impl ChannelTransport for SseTransport {
    async fn subscribe(&self, topic: &Topic, credential: &Credential) -> Result<Subscription> {
        let url = self.topic_url(topic);
        let req = authorized_request(Method::GET, &url, credential, "text/event-stream", None)?;
        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| SyncError::Network(format!("subscribe {}: {}", topic, e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = read_body(resp.into_body()).await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        info!("Subscribed to {} via {}", topic, url);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let reader = tokio::spawn(read_events(topic.clone(), resp.into_body(), tx));
        self.replace_reader(topic, Some(reader));

        Ok(Subscription {
            topic: topic.clone(),
            events: rx,
        })
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<()> {
        self.replace_reader(topic, None);
        debug!("Unsubscribed from {}", topic);
        Ok(())
    }
}

async fn read_events(topic: Topic, mut body: Incoming, tx: mpsc::Sender<Result<PushEvent>>) {
    let mut parser = SseParser::default();
    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                let Some(data) = frame.data_ref() else {
                    continue;
                };
                for payload in parser.push(data) {
                    if tx.send(PushEvent::from_json(&payload)).await.is_err() {
                        return; // subscriber went away
                    }
                }
            }
            Some(Err(e)) => {
                warn!("SSE stream {} failed: {}", topic, e);
                let _ = tx
                    .send(Err(SyncError::Network(format!("{}: {}", topic, e))))
                    .await;
                return;
            }
            None => {
                debug!("SSE stream {} closed by server", topic);
                return;
            }
        }
    }
}

/// Incremental `text/event-stream` decoder yielding the `data` of each event
#[derive(Default)]
struct SseParser {
    pending: Vec<u8>,
    data: Vec<String>,
}

impl SseParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    out.push(self.data.join("\n"));
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue; // keepalive comment
            }
            if let Some(rest) = line.strip_prefix("data:") {
                self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
            // event:, id:, retry: carry nothing we use
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_handles_split_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push(b": connected\n\n").is_empty());
        assert!(parser.push(b"data: {\"a\":").is_empty());
        let out = parser.push(b"1}\n\ndata: x\r\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string()]);
        let out = parser.push(b"data: y\n\n");
        assert_eq!(out, vec!["x\ny".to_string()]);
    }

    #[test]
    fn test_topic_url_is_encoded() {
        let transport = SseTransport::new("http://localhost:9000/rt/");
        assert_eq!(
            transport.topic_url(&Topic::messages("c 1")),
            "http://localhost:9000/rt/topics/messages%3Ac%201"
        );
    }
}
