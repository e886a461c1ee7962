use std::marker::PhantomData;

use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::debug;

use crate::{
    error::DecodeError,
    types::{ChangeEvent, EventKind, WatchStatus},
};

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    object: Value,
}

/// Incremental decoder for newline-delimited JSON watch events.
///
/// Bytes are fed as they arrive; complete lines are pulled out one event at a
/// time with [`EventDecoder::next_event`]. A decoder belongs to exactly one
/// stream and is dropped with it.
#[derive(Debug)]
pub struct EventDecoder<T> {
    tail: Vec<u8>,
    consumed: usize,
    _resource: PhantomData<fn() -> T>,
}

impl<T> Default for EventDecoder<T> {
    fn default() -> Self {
        Self {
            tail: Vec::new(),
            consumed: 0,
            _resource: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> EventDecoder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of stream bytes.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.consumed > 0 {
            self.tail.drain(..self.consumed);
            self.consumed = 0;
        }
        self.tail.extend_from_slice(chunk);
    }

    /// Decode the next complete, non-blank line.
    ///
    /// Returns `None` once no complete line is buffered.
    pub fn next_event(&mut self) -> Option<Result<ChangeEvent<T>, DecodeError>> {
        loop {
            let pending = &self.tail[self.consumed..];
            let newline = pending.iter().position(|byte| *byte == b'\n')?;
            let start = self.consumed;
            self.consumed += newline + 1;

            let line = self.tail[start..start + newline].trim_ascii();
            if line.is_empty() {
                continue;
            }
            return Some(decode_line(line));
        }
    }

    /// Feed a chunk and decode every line it completes.
    ///
    /// Stops at the first malformed line; the stream is unusable after that.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<ChangeEvent<T>>, DecodeError> {
        self.feed(chunk);
        let mut events = Vec::new();
        while let Some(event) = self.next_event() {
            events.push(event?);
        }
        Ok(events)
    }

    /// Bytes buffered after the last newline.
    pub fn pending_len(&self) -> usize {
        self.tail.len() - self.consumed
    }

    /// End the stream, discarding any unterminated trailing line.
    ///
    /// Returns the number of discarded bytes.
    pub fn finish(self) -> usize {
        let discarded = self.pending_len();
        if discarded > 0 {
            debug!(discarded, "dropping unterminated trailing watch line");
        }
        discarded
    }
}

/// Decode one watch line (without its newline).
pub fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Result<ChangeEvent<T>, DecodeError> {
    let raw: RawEvent = serde_json::from_slice(line).map_err(|source| DecodeError::Line {
        line: String::from_utf8_lossy(line).into_owned(),
        source,
    })?;

    let kind = EventKind::from_wire(&raw.event_type);
    let object = |object: Value| {
        serde_json::from_value::<T>(object).map_err(|source| DecodeError::Object { kind, source })
    };

    let event = match kind {
        EventKind::Added => ChangeEvent::Added(object(raw.object)?),
        EventKind::Modified => ChangeEvent::Modified(object(raw.object)?),
        EventKind::Deleted => ChangeEvent::Deleted(object(raw.object)?),
        EventKind::Bookmark => ChangeEvent::Bookmark {
            resource_version: raw
                .object
                .pointer("/metadata/resourceVersion")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
        },
        EventKind::Error => ChangeEvent::Error(
            serde_json::from_value::<WatchStatus>(raw.object).unwrap_or_default(),
        ),
        EventKind::Unknown => ChangeEvent::Unknown {
            event_type: raw.event_type,
        },
    };

    Ok(event)
}
