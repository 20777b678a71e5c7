//! Per-connection state machine. One `MessageHandler` is owned by each
//! connection's task; it holds only a shared, non-owning `Arc<StreamManager>`
//! reference, never the other way around, so there is no reference cycle
//! between a connection and the server.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::codec::{self, ControlMessage, Request};
use crate::pool::MemoryPool;
use crate::stream_context::StreamStatus;
use crate::stream_manager::StreamManager;

/// A frame the handler wants sent back to this connection.
pub enum Outgoing {
    Text(String),
    Binary(Vec<u8>),
}

impl Outgoing {
    fn error(message: impl Into<String>) -> Self {
        Outgoing::Text(ControlMessage::error(message).to_json())
    }
}

pub struct MessageHandler {
    manager: Arc<StreamManager>,
    pool: Arc<MemoryPool>,
    bound_stream_id: Option<String>,
    peer: String,
}

impl MessageHandler {
    pub fn new(manager: Arc<StreamManager>, pool: Arc<MemoryPool>, peer: impl Into<String>) -> Self {
        Self {
            manager,
            pool,
            bound_stream_id: None,
            peer: peer.into(),
        }
    }

    pub fn bound_stream_id(&self) -> Option<&str> {
        self.bound_stream_id.as_deref()
    }

    /// Decodes and dispatches a TEXT control frame. Always produces exactly
    /// one response frame.
    pub fn handle_text(&mut self, payload: &str) -> Outgoing {
        match codec::decode(payload) {
            Ok(Request::Start { stream_id }) => self.handle_start(stream_id),
            Ok(Request::Stop { stream_id }) => self.handle_stop(stream_id),
            Ok(Request::Get { stream_id, offset, length }) => {
                self.handle_get(stream_id, offset, length)
            }
            Err(e) => Outgoing::error(e.to_string()),
        }
    }

    /// Handles a BINARY frame. A small JSON-shaped payload is re-routed as
    /// a control frame (see [`codec::looks_like_control_frame`]); otherwise
    /// it is appended to the bound stream. Returns `None` for a plain
    /// successful append, which has no protocol-level response.
    pub fn handle_binary(&mut self, payload: Vec<u8>) -> Option<Outgoing> {
        if codec::looks_like_control_frame(&payload) {
            if let Ok(text) = std::str::from_utf8(&payload) {
                return Some(self.handle_text(text));
            }
        }

        match self.bound_stream_id.clone() {
            None => Some(Outgoing::error("no active stream")),
            Some(stream_id) => {
                // Stage the frame in a pooled scratch buffer rather than
                // writing straight out of the socket's own allocation, so
                // repeated appends reuse the same handful of buffers.
                let mut scratch = self.pool.acquire();
                scratch.extend_from_slice(&payload);
                match self.manager.write_chunk(&stream_id, &scratch) {
                    Ok(_) => None,
                    Err(e) => Some(Outgoing::error(e.to_string())),
                }
            }
        }
    }

    /// Called once when the connection is closing. A bound upload is
    /// treated as an implicit STOP, unless an I/O fault already moved the
    /// stream to `ERROR`.
    pub fn handle_close(&mut self) {
        let Some(stream_id) = self.bound_stream_id.take() else {
            return;
        };

        match self.manager.get_stream(&stream_id) {
            Ok(context) if context.status() == StreamStatus::Error => {
                debug!(
                    "{}: stream {stream_id} already in error state at close, not finalizing",
                    self.peer
                );
            }
            _ => match self.manager.finalize_stream(&stream_id) {
                Ok(_) => info!("{}: stream {stream_id} finalized on close", self.peer),
                Err(e) => warn!("{}: failed to finalize {stream_id} on close: {e}", self.peer),
            },
        }
    }

    fn handle_start(&mut self, stream_id: String) -> Outgoing {
        if self.bound_stream_id.is_some() {
            return Outgoing::error("already bound");
        }
        match self.manager.create_stream(&stream_id) {
            Ok(_) => {
                info!("{}: bound to stream {stream_id}", self.peer);
                self.bound_stream_id = Some(stream_id.clone());
                Outgoing::Text(ControlMessage::started(stream_id).to_json())
            }
            Err(e) => Outgoing::error(e.to_string()),
        }
    }

    fn handle_stop(&mut self, _requested_stream_id: String) -> Outgoing {
        match self.bound_stream_id.take() {
            Some(stream_id) => match self.manager.finalize_stream(&stream_id) {
                Ok(_) => {
                    info!("{}: stream {stream_id} stopped", self.peer);
                    Outgoing::Text(ControlMessage::stopped(stream_id).to_json())
                }
                Err(e) => {
                    // Leave the connection bound so a retry (or the eventual
                    // close-triggered finalize) has another chance.
                    self.bound_stream_id = Some(stream_id);
                    Outgoing::error(e.to_string())
                }
            },
            None => Outgoing::error("no active stream"),
        }
    }

    fn handle_get(&mut self, stream_id: String, offset: u64, length: u64) -> Outgoing {
        match self.manager.read_chunk(&stream_id, offset, length as usize) {
            Ok(data) if !data.is_empty() => Outgoing::Binary(data),
            Ok(_) => Outgoing::error(format!("Failed to read from stream: {stream_id}")),
            Err(e) => Outgoing::error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &std::path::Path) -> Arc<StreamManager> {
        Arc::new(StreamManager::new(dir))
    }

    fn pool() -> Arc<MemoryPool> {
        Arc::new(MemoryPool::with_defaults())
    }

    fn expect_text(out: Outgoing) -> ControlMessage {
        match out {
            Outgoing::Text(json) => serde_json::from_str(&json).unwrap(),
            Outgoing::Binary(_) => panic!("expected a text frame"),
        }
    }

    #[test]
    fn start_stop_round_trip() {
        let dir = tempdir().unwrap();
        let mut handler = MessageHandler::new(manager(dir.path()), pool(), "peer");

        let started = expect_text(handler.handle_text(r#"{"type":"START","streamId":"s1"}"#));
        assert_eq!(started.kind, "STARTED");
        assert_eq!(handler.bound_stream_id(), Some("s1"));

        let stopped = expect_text(handler.handle_text(r#"{"type":"STOP","streamId":"s1"}"#));
        assert_eq!(stopped.kind, "STOPPED");
        assert_eq!(handler.bound_stream_id(), None);
    }

    #[test]
    fn duplicate_start_is_rejected_and_first_owner_keeps_binding() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let mut first = MessageHandler::new(mgr.clone(), pool(), "first");
        let mut second = MessageHandler::new(mgr.clone(), pool(), "second");

        let ok = expect_text(first.handle_text(r#"{"type":"START","streamId":"s5"}"#));
        assert_eq!(ok.kind, "STARTED");

        let err = expect_text(second.handle_text(r#"{"type":"START","streamId":"s5"}"#));
        assert_eq!(err.kind, "ERROR");
        assert!(err.message.unwrap().contains("s5"));
        assert_eq!(second.bound_stream_id(), None);
        assert_eq!(first.bound_stream_id(), Some("s5"));
    }

    #[test]
    fn stop_without_start_is_an_error() {
        let dir = tempdir().unwrap();
        let mut handler = MessageHandler::new(manager(dir.path()), pool(), "peer");
        let err = expect_text(handler.handle_text(r#"{"type":"STOP","streamId":"nope"}"#));
        assert_eq!(err.kind, "ERROR");
        assert_eq!(err.message.unwrap(), "no active stream");
    }

    #[test]
    fn start_while_bound_is_already_bound_error() {
        let dir = tempdir().unwrap();
        let mut handler = MessageHandler::new(manager(dir.path()), pool(), "peer");
        handler.handle_text(r#"{"type":"START","streamId":"s1"}"#);
        let err = expect_text(handler.handle_text(r#"{"type":"START","streamId":"s2"}"#));
        assert_eq!(err.message.unwrap(), "already bound");
    }

    #[test]
    fn binary_append_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let mut uploader = MessageHandler::new(mgr.clone(), pool(), "uploader");
        uploader.handle_text(r#"{"type":"START","streamId":"s2"}"#);
        let resp = uploader.handle_binary((0u8..16).collect());
        assert!(resp.is_none());
        uploader.handle_text(r#"{"type":"STOP","streamId":"s2"}"#);

        let mut reader = MessageHandler::new(mgr, pool(), "reader");
        match reader.handle_text(r#"{"type":"GET","streamId":"s2","offset":0,"length":16}"#) {
            Outgoing::Binary(data) => assert_eq!(data, (0u8..16).collect::<Vec<u8>>()),
            Outgoing::Text(_) => panic!("expected binary GET response"),
        }
    }

    #[test]
    fn binary_without_binding_is_an_error() {
        let dir = tempdir().unwrap();
        let mut handler = MessageHandler::new(manager(dir.path()), pool(), "peer");
        let resp = handler.handle_binary(vec![1, 2, 3]).unwrap();
        let msg = expect_text(resp);
        assert_eq!(msg.message.unwrap(), "no active stream");
    }

    #[test]
    fn get_unknown_stream_reports_the_id() {
        let dir = tempdir().unwrap();
        let mut handler = MessageHandler::new(manager(dir.path()), pool(), "peer");
        let err = expect_text(
            handler.handle_text(r#"{"type":"GET","streamId":"nope","offset":0,"length":64}"#),
        );
        assert!(err.message.unwrap().contains("nope"));
    }

    #[test]
    fn get_past_high_water_mark_fails_explicitly() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let mut handler = MessageHandler::new(mgr, pool(), "peer");
        handler.handle_text(r#"{"type":"START","streamId":"s3"}"#);
        handler.handle_binary(vec![1, 2, 3]);
        let err = expect_text(
            handler.handle_text(r#"{"type":"GET","streamId":"s3","offset":3,"length":1}"#),
        );
        assert!(err.message.unwrap().contains("s3"));
    }

    #[test]
    fn binary_shaped_like_control_frame_is_rerouted() {
        let dir = tempdir().unwrap();
        let mut handler = MessageHandler::new(manager(dir.path()), pool(), "peer");
        handler.handle_text(r#"{"type":"START","streamId":"s4"}"#);
        let payload = br#"{"type":"STOP","streamId":"s4"}"#.to_vec();
        let resp = handler.handle_binary(payload).unwrap();
        let msg = expect_text(resp);
        assert_eq!(msg.kind, "STOPPED");
    }

    #[test]
    fn close_while_bound_finalizes_the_stream() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let mut handler = MessageHandler::new(mgr.clone(), pool(), "peer");
        handler.handle_text(r#"{"type":"START","streamId":"s6"}"#);
        handler.handle_binary(vec![9, 9, 9]);
        handler.handle_close();
        let context = mgr.get_stream("s6").unwrap();
        assert_eq!(context.status(), StreamStatus::Ready);
    }
}
