use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::Stream;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::config::HttpCfg;
use crate::error::{CoreResult, GatewayError};

/// Per-call context threaded into outbound requests.
#[derive(Clone, Copy, Default, Debug)]
pub struct RequestCtx<'a> {
    pub request_id: Option<&'a str>,
}

impl<'a> RequestCtx<'a> {
    pub fn with_request_id(request_id: &'a str) -> Self {
        Self {
            request_id: Some(request_id),
        }
    }
}

/// One raw line of an event-stream body, terminator removed.
#[derive(Debug, Clone)]
pub struct SseLine {
    pub line: String,
}

pub type SseStream = Pin<Box<dyn Stream<Item = CoreResult<SseLine>> + Send>>;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Shared reqwest client for backend calls. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
    request_timeout: Duration,
    stream_timeout: Duration,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_cfg(&HttpCfg::default())
    }

    pub fn from_cfg(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder =
            Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| GatewayError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("lmgate/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
            stream_timeout: Duration::from_millis(cfg.stream_timeout_ms),
        })
    }

    fn decorate(
        &self,
        mut req: RequestBuilder,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> RequestBuilder {
        req = req.header("User-Agent", &self.user_agent);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        if let Some(rid) = ctx.request_id {
            req = req.header("X-Request-Id", rid);
        }
        req
    }

    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<(R, u32)> {
        let start = Instant::now();
        let req = self
            .inner
            .post(url)
            .json(body)
            .timeout(self.request_timeout);
        let resp = self
            .decorate(req, headers, ctx)
            .send()
            .await
            .map_err(|e| GatewayError::from_transport(&e))?;
        let parsed = read_json::<R>(resp).await?;
        let latency = start.elapsed().as_millis() as u32;
        debug!(url, latency_ms = latency, "upstream json call finished");
        Ok((parsed, latency))
    }

    /// Open a streaming POST and hand back its body split into lines.
    /// Connect failures and non-2xx statuses are returned here, before any line.
    pub async fn post_sse_lines<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<SseStream> {
        let req = self
            .inner
            .post(url)
            .json(body)
            .header("Accept", "text/event-stream")
            .timeout(self.stream_timeout);

        let resp = self
            .decorate(req, headers, ctx)
            .send()
            .await
            .map_err(|e| GatewayError::from_transport(&e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_http_error(status, &body));
        }

        Ok(Box::pin(SseLines::new(Box::pin(resp.bytes_stream()))))
    }

    pub async fn get_json<R: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<(R, u32)> {
        let start = Instant::now();
        let req = self.inner.get(url).timeout(self.request_timeout);
        let resp = self
            .decorate(req, headers, ctx)
            .send()
            .await
            .map_err(|e| GatewayError::from_transport(&e))?;
        let parsed = read_json::<R>(resp).await?;
        Ok((parsed, start.elapsed().as_millis() as u32))
    }
}

async fn read_json<R: DeserializeOwned>(resp: reqwest::Response) -> CoreResult<R> {
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(map_http_error(status, &text));
    }
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| GatewayError::from_transport(&e))?;
    serde_json::from_slice::<R>(&bytes).map_err(|e| GatewayError::UpstreamProtocolError {
        message: format!("json decode error: {e}"),
    })
}

fn map_http_error(status: StatusCode, body: &str) -> GatewayError {
    GatewayError::UpstreamRejected {
        status: status.as_u16(),
        message: truncate(body, 300),
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().map(|(i, _)| i).take_while(|&i| i <= max).last() {
        Some(_) if s.len() <= max => s.to_string(),
        Some(cut) => format!("{}...", &s[..cut]),
        None => String::new(),
    }
}

/// Longest line accepted from a backend event stream.
const MAX_LINE_BYTES: usize = 1 << 20;

/// Splits a byte stream on `\n`, dropping a trailing `\r`. Splitting happens on
/// bytes so a character cut across reads stays intact. A transport error, or a
/// line longer than `max_line`, is yielded once and ends the stream.
struct SseLines {
    inner: ByteStream,
    buf: Vec<u8>,
    max_line: usize,
    finished: bool,
}

impl SseLines {
    fn new(inner: ByteStream) -> Self {
        Self::with_max_line(inner, MAX_LINE_BYTES)
    }

    fn with_max_line(inner: ByteStream, max_line: usize) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            max_line,
            finished: false,
        }
    }
}

impl Stream for SseLines {
    type Item = CoreResult<SseLine>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(idx) = self.buf.iter().position(|&b| b == b'\n') {
                let mut raw: Vec<u8> = self.buf.drain(..=idx).collect();
                raw.pop();
                if raw.last() == Some(&b'\r') {
                    raw.pop();
                }
                let line = String::from_utf8_lossy(&raw).into_owned();
                return Poll::Ready(Some(Ok(SseLine { line })));
            }

            if self.buf.len() > self.max_line {
                let len = self.buf.len();
                self.finished = true;
                self.buf.clear();
                return Poll::Ready(Some(Err(GatewayError::UpstreamProtocolError {
                    message: format!("event stream line exceeds {} bytes ({len} buffered)", self.max_line),
                })));
            }

            if self.finished {
                if self.buf.is_empty() {
                    return Poll::Ready(None);
                }
                let raw = std::mem::take(&mut self.buf);
                let line = String::from_utf8_lossy(&raw).into_owned();
                return Poll::Ready(Some(Ok(SseLine { line })));
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.buf.extend_from_slice(&chunk);
                    continue;
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    self.buf.clear();
                    return Poll::Ready(Some(Err(GatewayError::from_body_read(&e))));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    continue;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use serde_json::json;

    #[tokio::test]
    async fn post_json_success_sends_correlation_id() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/chat")
                .header("x-request-id", "rid-1");
            then.status(200).json_body(json!({"ok": true}));
        });

        #[derive(serde::Deserialize)]
        struct Resp {
            ok: bool,
        }

        let client = HttpClient::new_default().unwrap();
        let ctx = RequestCtx::with_request_id("rid-1");
        let (resp, _latency) = client
            .post_json::<_, Resp>(
                &format!("{}/chat", server.base_url()),
                &json!({"msg":"hi"}),
                &[],
                &ctx,
            )
            .await
            .unwrap();

        assert!(resp.ok);
        m.assert();
    }

    #[tokio::test]
    async fn post_json_503_maps_to_rejected() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/chat");
            then.status(503).body("oops");
        });
        let client = HttpClient::new_default().expect("client");
        let err = client
            .post_json::<_, serde_json::Value>(
                &format!("{}/chat", server.base_url()),
                &json!({"msg":"hi"}),
                &[],
                &RequestCtx::default(),
            )
            .await
            .unwrap_err();

        match err {
            GatewayError::UpstreamRejected { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "oops");
            }
            other => panic!("expected UpstreamRejected, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn post_json_200_bad_json_maps_to_protocol_error() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/chat");
            then.status(200).body("not-json");
        });
        let client = HttpClient::new_default().expect("client");
        let err = client
            .post_json::<_, serde_json::Value>(
                &format!("{}/chat", server.base_url()),
                &json!({"msg":"hi"}),
                &[],
                &RequestCtx::default(),
            )
            .await
            .unwrap_err();
        match err {
            GatewayError::UpstreamProtocolError { message } => {
                assert!(message.starts_with("json decode error"))
            }
            other => panic!("expected UpstreamProtocolError, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn post_json_400_truncates_body() {
        let server = MockServer::start();
        let big = "x".repeat(1000);
        let _m = server.mock(|when, then| {
            when.method(POST).path("/chat");
            then.status(400).body(big.clone());
        });
        let client = HttpClient::new_default().expect("client");
        let err = client
            .post_json::<_, serde_json::Value>(
                &format!("{}/chat", server.base_url()),
                &json!({"msg":"hi"}),
                &[],
                &RequestCtx::default(),
            )
            .await
            .unwrap_err();
        match err {
            GatewayError::UpstreamRejected { status, message } => {
                assert_eq!(status, 400);
                assert!(message.ends_with("..."));
                assert_eq!(message.len(), 303);
            }
            other => panic!("expected UpstreamRejected, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn network_error_maps_to_unreachable() {
        // Port 9 (discard) is typically closed.
        let client = HttpClient::new_default().expect("client");
        let err = client
            .post_json::<_, serde_json::Value>(
                "http://127.0.0.1:9/chat",
                &json!({"msg":"hi"}),
                &[],
                &RequestCtx::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamUnreachable { .. }));
    }

    #[tokio::test]
    async fn slow_upstream_maps_to_timeout() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(GET).path("/models");
            then.status(200)
                .delay(Duration::from_millis(500))
                .json_body(json!({"data": []}));
        });
        let client = HttpClient::from_cfg(&HttpCfg {
            request_timeout_ms: 50,
            ..HttpCfg::default()
        })
        .unwrap();
        let err = client
            .get_json::<serde_json::Value>(
                &format!("{}/models", server.base_url()),
                &[],
                &RequestCtx::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamTimeout));
    }

    #[tokio::test]
    async fn sse_lines_split_and_strip_crlf() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST)
                .path("/stream")
                .header("accept", "text/event-stream");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body("data: one\r\n\r\ndata: 二\n\ntail");
        });
        let client = HttpClient::new_default().unwrap();
        let lines: Vec<String> = client
            .post_sse_lines(
                &format!("{}/stream", server.base_url()),
                &json!({}),
                &[],
                &RequestCtx::default(),
            )
            .await
            .unwrap()
            .map(|l| l.unwrap().line)
            .collect()
            .await;
        assert_eq!(lines, vec!["data: one", "", "data: 二", "", "tail"]);
    }

    #[tokio::test]
    async fn sse_non_success_fails_before_streaming() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/stream");
            then.status(404).body("model not loaded");
        });
        let client = HttpClient::new_default().unwrap();
        let res = client
            .post_sse_lines(
                &format!("{}/stream", server.base_url()),
                &json!({}),
                &[],
                &RequestCtx::default(),
            )
            .await;
        match res {
            Err(GatewayError::UpstreamRejected { status, .. }) => assert_eq!(status, 404),
            Err(other) => panic!("expected UpstreamRejected, got: {:?}", other),
            Ok(_) => panic!("expected an error before streaming"),
        }
    }

    #[tokio::test]
    async fn overlong_line_ends_stream_with_protocol_error() {
        let parts: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from_static(b"data: ok\n")),
            Ok(Bytes::from_static(b"0123456789")),
            Ok(Bytes::from_static(b"0123456789")),
            Ok(Bytes::from_static(b"\ndata: never\n")),
        ];
        let lines = SseLines::with_max_line(Box::pin(futures_util::stream::iter(parts)), 16);
        let items: Vec<CoreResult<SseLine>> = lines.collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().line, "data: ok");
        match &items[1] {
            Err(GatewayError::UpstreamProtocolError { message }) => {
                assert!(message.contains("exceeds 16 bytes"), "{message}")
            }
            other => panic!("expected UpstreamProtocolError, got: {:?}", other),
        }
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(200);
        let t = truncate(&s, 301);
        assert!(t.ends_with("..."));
        assert_eq!(t.len(), 300 + 3);
    }
}
