//! Scripted in-memory transport for unit tests.

use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, future, stream};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::transport::{
    ByteStream, HttpRequest, HttpResponse, StreamResponse, Transport, TransportError,
};

type Chunk = Result<Bytes, TransportError>;

/// What the next `open_stream` call does.
pub(crate) enum StreamScript {
    /// 200 with these chunks, then a clean end.
    Chunks(Vec<Chunk>),
    /// 200 with these chunks, then stays open forever.
    ChunksThenHang(Vec<Chunk>),
    /// 200 with a body fed through a channel; dropping the sender ends it.
    Live(mpsc::UnboundedReceiver<Chunk>),
    Status(u16),
    NoBody,
    ConnectError(TransportError),
    /// The open never completes.
    Hang,
}

impl StreamScript {
    pub(crate) fn chunks(chunks: Vec<Chunk>) -> Self {
        Self::Chunks(chunks)
    }
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    responses: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    streams: Mutex<VecDeque<StreamScript>>,
    requests: Mutex<Vec<HttpRequest>>,
    stream_requests: Mutex<Vec<HttpRequest>>,
}

impl FakeTransport {
    pub(crate) fn push_response(&self, response: Result<HttpResponse, TransportError>) {
        lock(&self.responses).push_back(response);
    }

    pub(crate) fn push_json(&self, status: u16, body: Value) {
        self.push_response(Ok(json_response(status, body)));
    }

    pub(crate) fn push_list(&self, resource_version: &str, names: &[&str]) {
        self.push_json(200, list_body(resource_version, names));
    }

    pub(crate) fn push_stream(&self, script: StreamScript) {
        lock(&self.streams).push_back(script);
    }

    pub(crate) fn push_live_stream(&self) -> mpsc::UnboundedSender<Chunk> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push_stream(StreamScript::Live(rx));
        tx
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    pub(crate) fn stream_requests(&self) -> Vec<HttpRequest> {
        lock(&self.stream_requests).clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        lock(&self.requests).push(request);
        let next = lock(&self.responses).pop_front();
        match next {
            Some(response) => response,
            None => future::pending().await,
        }
    }

    async fn open_stream(&self, request: HttpRequest) -> Result<StreamResponse, TransportError> {
        lock(&self.stream_requests).push(request);
        let next = lock(&self.streams).pop_front();
        let body: ByteStream = match next {
            Some(StreamScript::Chunks(chunks)) => Box::pin(stream::iter(chunks)),
            Some(StreamScript::ChunksThenHang(chunks)) => {
                Box::pin(stream::iter(chunks).chain(stream::pending()))
            }
            Some(StreamScript::Live(rx)) => Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (chunk, rx))
            })),
            Some(StreamScript::Status(status)) => {
                return Ok(StreamResponse {
                    status,
                    status_text: String::new(),
                    body: Some(Box::pin(stream::empty())),
                });
            }
            Some(StreamScript::NoBody) => {
                return Ok(StreamResponse {
                    status: 200,
                    status_text: "OK".to_owned(),
                    body: None,
                });
            }
            Some(StreamScript::ConnectError(err)) => return Err(err),
            Some(StreamScript::Hang) | None => future::pending().await,
        };

        Ok(StreamResponse {
            status: 200,
            status_text: "OK".to_owned(),
            body: Some(body),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn json_response(status: u16, body: Value) -> HttpResponse {
    HttpResponse {
        status,
        status_text: String::new(),
        content_type: Some("application/json".to_owned()),
        body: Bytes::from(body.to_string()),
    }
}

pub(crate) fn object_json(name: &str) -> Value {
    json!({ "metadata": { "name": name } })
}

pub(crate) fn list_body(resource_version: &str, names: &[&str]) -> Value {
    json!({
        "metadata": { "resourceVersion": resource_version },
        "items": names.iter().map(|name| object_json(name)).collect::<Vec<_>>(),
    })
}

/// One newline-terminated watch line.
pub(crate) fn event_line(event_type: &str, name: &str) -> String {
    format!("{}\n", json!({ "type": event_type, "object": object_json(name) }))
}
