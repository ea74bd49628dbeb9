//! PocketBase client: REST record operations plus the SSE realtime feed.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use url::Url;

use crate::config::BackendConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::RecordEvent;
use crate::store::{ListOptions, RecordStore, Subscription};

const LIST_PAGE_SIZE: u32 = 200;
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct PocketBaseStore {
    client: Client,
    base_url: Url,
    auth_token: Option<String>,
    request_timeout: Duration,
}

impl PocketBaseStore {
    /// Build a store handle from configuration.
    ///
    /// The underlying client carries no global timeout: the realtime stream
    /// is long-lived, so REST calls get a per-request timeout instead.
    pub fn new(config: &BackendConfig) -> SyncResult<Self> {
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| SyncError::Config(format!("invalid backend url {base:?}: {e}")))?;
        let client = Client::builder().build()?;

        Ok(Self {
            client,
            base_url,
            auth_token: config.auth_token.clone(),
            request_timeout: config.request_timeout(),
        })
    }

    fn records_url(&self, collection: &str) -> SyncResult<Url> {
        self.base_url
            .join(&format!("api/collections/{collection}/records"))
            .map_err(|e| SyncError::Config(format!("invalid collection name {collection:?}: {e}")))
    }

    fn record_url(&self, collection: &str, id: &str) -> SyncResult<Url> {
        self.base_url
            .join(&format!("api/collections/{collection}/records/{id}"))
            .map_err(|e| SyncError::Config(format!("invalid record path: {e}")))
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.header(reqwest::header::AUTHORIZATION, token.clone()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> SyncResult<Value> {
        let response = self
            .authed(builder)
            .timeout(self.request_timeout)
            .send()
            .await?;
        map_response(response).await
    }
}

async fn map_response(response: Response) -> SyncResult<Value> {
    let status = response.status();
    if status.is_success() {
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        return Ok(response.json().await?);
    }

    let message = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| {
            body.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| status.to_string());

    Err(match status.as_u16() {
        401 => SyncError::Unauthorized,
        403 => SyncError::Forbidden,
        404 => SyncError::NotFound(message),
        code => SyncError::Api {
            status: code,
            message,
        },
    })
}

#[async_trait]
impl RecordStore for PocketBaseStore {
    async fn get_one(&self, collection: &str, id: &str) -> SyncResult<Value> {
        let url = self.record_url(collection, id)?;
        self.send(self.client.get(url)).await
    }

    async fn get_first_list_item(&self, collection: &str, filter: &str) -> SyncResult<Value> {
        let url = self.records_url(collection)?;
        let value = self
            .send(self.client.get(url).query(&[
                ("page", "1"),
                ("perPage", "1"),
                ("skipTotal", "1"),
                ("filter", filter),
            ]))
            .await?;
        value
            .get("items")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .cloned()
            .ok_or_else(|| SyncError::NotFound(filter.to_string()))
    }

    async fn get_full_list(
        &self,
        collection: &str,
        options: &ListOptions,
    ) -> SyncResult<Vec<Value>> {
        let url = self.records_url(collection)?;
        let mut items = Vec::new();
        let mut page: u32 = 1;

        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("page", page.to_string()),
                ("perPage", LIST_PAGE_SIZE.to_string()),
            ];
            if let Some(filter) = &options.filter {
                query.push(("filter", filter.clone()));
            }
            if let Some(sort) = &options.sort {
                query.push(("sort", sort.clone()));
            }
            if let Some(expand) = &options.expand {
                query.push(("expand", expand.clone()));
            }

            let value = self.send(self.client.get(url.clone()).query(&query)).await?;
            if let Some(batch) = value.get("items").and_then(Value::as_array) {
                items.extend(batch.iter().cloned());
            }

            let total_pages = value.get("totalPages").and_then(Value::as_u64).unwrap_or(1);
            if u64::from(page) >= total_pages {
                break;
            }
            page += 1;
        }

        Ok(items)
    }

    async fn create(&self, collection: &str, data: Value) -> SyncResult<Value> {
        let url = self.records_url(collection)?;
        self.send(self.client.post(url).json(&data)).await
    }

    async fn update(&self, collection: &str, id: &str, data: Value) -> SyncResult<Value> {
        let url = self.record_url(collection, id)?;
        self.send(self.client.patch(url).json(&data)).await
    }

    async fn delete(&self, collection: &str, id: &str) -> SyncResult<()> {
        let url = self.record_url(collection, id)?;
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> SyncResult<Subscription> {
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(run_realtime(
            self.client.clone(),
            self.base_url.clone(),
            self.auth_token.clone(),
            self.request_timeout,
            topic.to_string(),
            tx,
        ));
        Ok(Subscription::new(rx, Some(task)))
    }
}

/// Realtime reader loop: connect, stream, reconnect with capped backoff.
/// Exits when the consumer drops its `Subscription` or auth fails.
async fn run_realtime(
    client: Client,
    base_url: Url,
    auth_token: Option<String>,
    request_timeout: Duration,
    topic: String,
    tx: mpsc::Sender<RecordEvent>,
) {
    let mut backoff = Duration::from_secs(1);
    loop {
        match stream_events(
            &client,
            &base_url,
            auth_token.as_deref(),
            request_timeout,
            &topic,
            &tx,
        )
        .await
        {
            Ok(()) => {
                backoff = Duration::from_secs(1);
                tracing::debug!("Realtime stream for {} ended, reconnecting", topic);
            }
            Err(e) if e.is_auth() => {
                tracing::warn!("Realtime subscription for {} rejected: {}", topic, e);
                break;
            }
            Err(e) if e.is_transient() => {
                tracing::debug!("Realtime stream error for {}: {}", topic, e);
            }
            Err(e) => {
                tracing::warn!("Realtime stream error for {}: {}", topic, e);
            }
        }

        if tx.is_closed() {
            break;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
    }
}

async fn stream_events(
    client: &Client,
    base_url: &Url,
    auth_token: Option<&str>,
    request_timeout: Duration,
    topic: &str,
    tx: &mpsc::Sender<RecordEvent>,
) -> SyncResult<()> {
    let realtime_url = base_url
        .join("api/realtime")
        .map_err(|e| SyncError::Realtime(e.to_string()))?;

    let mut request = client
        .get(realtime_url.clone())
        .header(reqwest::header::ACCEPT, "text/event-stream");
    if let Some(token) = auth_token {
        request = request.header(reqwest::header::AUTHORIZATION, token);
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return match status.as_u16() {
            401 => Err(SyncError::Unauthorized),
            403 => Err(SyncError::Forbidden),
            code => Err(SyncError::Realtime(format!(
                "realtime connect failed with status {code}"
            ))),
        };
    }

    let mut stream = response.bytes_stream();
    let mut decoder = sse::SseDecoder::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for frame in decoder.feed(&chunk) {
            if frame.event == "PB_CONNECT" {
                let client_id = serde_json::from_str::<Value>(&frame.data)
                    .ok()
                    .and_then(|v| {
                        v.get("clientId")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .ok_or_else(|| {
                        SyncError::Realtime("PB_CONNECT without clientId".to_string())
                    })?;
                register_subscription(
                    client,
                    &realtime_url,
                    auth_token,
                    request_timeout,
                    &client_id,
                    topic,
                )
                .await?;
                continue;
            }

            if frame.event == topic {
                match serde_json::from_str::<RecordEvent>(&frame.data) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            // Consumer gone; the outer loop stops on the
                            // closed channel.
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Dropping undecodable realtime event on {}: {}", topic, e);
                    }
                }
            }
        }
    }

    Ok(())
}

async fn register_subscription(
    client: &Client,
    realtime_url: &Url,
    auth_token: Option<&str>,
    request_timeout: Duration,
    client_id: &str,
    topic: &str,
) -> SyncResult<()> {
    let mut request = client
        .post(realtime_url.clone())
        .timeout(request_timeout)
        .json(&json!({
            "clientId": client_id,
            "subscriptions": [topic],
        }));
    if let Some(token) = auth_token {
        request = request.header(reqwest::header::AUTHORIZATION, token);
    }

    let response = request.send().await?;
    if response.status().is_success() {
        tracing::debug!("Registered realtime subscription for {}", topic);
        Ok(())
    } else {
        match response.status().as_u16() {
            401 => Err(SyncError::Unauthorized),
            403 => Err(SyncError::Forbidden),
            code => Err(SyncError::Realtime(format!(
                "subscription registration failed with status {code}"
            ))),
        }
    }
}

/// Minimal server-sent-events framing. No SSE client crate is pulled in for
/// this; the protocol surface PocketBase uses is event/data/id lines
/// separated by a blank line.
mod sse {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SseFrame {
        pub event: String,
        pub data: String,
        pub id: Option<String>,
    }

    #[derive(Default)]
    pub struct SseDecoder {
        buffer: Vec<u8>,
    }

    impl SseDecoder {
        /// Feed raw bytes, yielding every frame completed by this chunk.
        /// Incomplete trailing input stays buffered for the next call.
        pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
            self.buffer.extend_from_slice(chunk);

            let mut frames = Vec::new();
            while let Some((end, sep_len)) = find_frame_boundary(&self.buffer) {
                if let Some(frame) = parse_frame(&self.buffer[..end]) {
                    frames.push(frame);
                }
                self.buffer.drain(..end + sep_len);
            }
            frames
        }
    }

    fn find_frame_boundary(buf: &[u8]) -> Option<(usize, usize)> {
        let mut i = 0;
        while i < buf.len() {
            if buf[i..].starts_with(b"\r\n\r\n") {
                return Some((i, 4));
            }
            if buf[i..].starts_with(b"\n\n") {
                return Some((i, 2));
            }
            i += 1;
        }
        None
    }

    fn parse_frame(block: &[u8]) -> Option<SseFrame> {
        let text = String::from_utf8_lossy(block);
        let mut event = String::new();
        let mut data_lines: Vec<&str> = Vec::new();
        let mut id = None;

        for line in text.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event = value.to_string(),
                "data" => data_lines.push(value),
                "id" => id = Some(value.to_string()),
                _ => {}
            }
        }

        if event.is_empty() && data_lines.is_empty() {
            return None;
        }
        if event.is_empty() {
            event = "message".to_string();
        }
        Some(SseFrame {
            event,
            data: data_lines.join("\n"),
            id,
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn single_frame() {
            let mut decoder = SseDecoder::default();
            let frames = decoder.feed(b"id: 1\nevent: danusin_locations\ndata: {\"a\":1}\n\n");
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].event, "danusin_locations");
            assert_eq!(frames[0].data, "{\"a\":1}");
            assert_eq!(frames[0].id.as_deref(), Some("1"));
        }

        #[test]
        fn frame_split_across_chunks() {
            let mut decoder = SseDecoder::default();
            assert!(decoder.feed(b"event: PB_CONNECT\ndata: {\"client").is_empty());
            let frames = decoder.feed(b"Id\":\"abc\"}\n\n");
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].event, "PB_CONNECT");
            assert_eq!(frames[0].data, "{\"clientId\":\"abc\"}");
        }

        #[test]
        fn multiple_frames_one_chunk() {
            let mut decoder = SseDecoder::default();
            let frames = decoder.feed(b"data: one\n\ndata: two\n\n");
            assert_eq!(frames.len(), 2);
            assert_eq!(frames[0].event, "message");
            assert_eq!(frames[0].data, "one");
            assert_eq!(frames[1].data, "two");
        }

        #[test]
        fn crlf_and_comments() {
            let mut decoder = SseDecoder::default();
            let frames = decoder.feed(b": keepalive\r\nevent: t\r\ndata: x\r\n\r\n");
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].event, "t");
            assert_eq!(frames[0].data, "x");
        }

        #[test]
        fn multiline_data_joined() {
            let mut decoder = SseDecoder::default();
            let frames = decoder.feed(b"data: line1\ndata: line2\n\n");
            assert_eq!(frames[0].data, "line1\nline2");
        }

        #[test]
        fn keepalive_only_block_skipped() {
            let mut decoder = SseDecoder::default();
            assert!(decoder.feed(b": ping\n\n").is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(base: &str) -> PocketBaseStore {
        let config = BackendConfig {
            base_url: base.to_string(),
            auth_token: None,
            locations_collection: "danusin_locations".to_string(),
            users_collection: "users".to_string(),
            request_timeout_seconds: 20,
        };
        PocketBaseStore::new(&config).unwrap()
    }

    #[test]
    fn url_building_handles_missing_trailing_slash() {
        let store = store("http://localhost:8090");
        let url = store.records_url("danusin_locations").unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8090/api/collections/danusin_locations/records"
        );
        let url = store.record_url("danusin_locations", "r1").unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8090/api/collections/danusin_locations/records/r1"
        );
    }

    #[test]
    fn rejects_invalid_base_url() {
        let config = BackendConfig {
            base_url: "not a url".to_string(),
            auth_token: None,
            locations_collection: "danusin_locations".to_string(),
            users_collection: "users".to_string(),
            request_timeout_seconds: 20,
        };
        assert!(matches!(
            PocketBaseStore::new(&config),
            Err(SyncError::Config(_))
        ));
    }
}
