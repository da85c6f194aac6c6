//! Participant-to-participant RPC over the reliable data channel
//!
//! Frames share the `_reliable` channel with user payloads via
//! [`crate::proto::DataPacket`]. The registry tracks outstanding outbound
//! invocations keyed by request id and dispatches inbound requests to
//! registered handlers; deadlines and wiring are driven by the session
//! actor, which owns the registry.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RpcError;

/// Handler for inbound requests. Returns the response payload or an
/// application error string relayed to the caller verbatim.
pub type RpcHandler =
    Box<dyn Fn(&str, Bytes) -> std::result::Result<Bytes, String> + Send + Sync>;

/// Error kinds carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcErrorCode {
    UnsupportedMethod,
    RecipientDisconnected,
    ApplicationError,
}

/// RPC wire frame, bincode-serialized inside a data packet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcFrame {
    Request {
        id: String,
        caller: String,
        target: String,
        method: String,
        payload: Vec<u8>,
    },
    Response {
        id: String,
        target: String,
        payload: Vec<u8>,
    },
    Error {
        id: String,
        target: String,
        code: RpcErrorCode,
        message: String,
    },
}

struct Outstanding {
    target: String,
    reply: oneshot::Sender<std::result::Result<Bytes, RpcError>>,
}

/// Outstanding-call table plus inbound-request dispatch
#[derive(Default)]
pub struct RpcRegistry {
    outstanding: HashMap<String, Outstanding>,
    handlers: HashMap<String, RpcHandler>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the local handler for a method, replacing any previous one
    pub fn register_handler(&mut self, method: &str, handler: RpcHandler) {
        if self.handlers.insert(method.to_string(), handler).is_some() {
            debug!("replaced rpc handler for method {}", method);
        }
    }

    /// Start an outbound invocation. Returns the request frame to send and
    /// the receiver the caller awaits on.
    pub fn begin(
        &mut self,
        caller: &str,
        target: &str,
        method: &str,
        payload: Bytes,
    ) -> (
        RpcFrame,
        String,
        oneshot::Receiver<std::result::Result<Bytes, RpcError>>,
    ) {
        let id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.outstanding.insert(
            id.clone(),
            Outstanding {
                target: target.to_string(),
                reply: reply_tx,
            },
        );
        let frame = RpcFrame::Request {
            id: id.clone(),
            caller: caller.to_string(),
            target: target.to_string(),
            method: method.to_string(),
            payload: payload.to_vec(),
        };
        (frame, id, reply_rx)
    }

    /// Resolve an outstanding invocation with a success payload
    pub fn complete(&mut self, id: &str, payload: Bytes) {
        match self.outstanding.remove(id) {
            Some(call) => {
                let _ = call.reply.send(Ok(payload));
            }
            None => debug!("response for unknown or expired rpc id {}", id),
        }
    }

    /// Reject an outstanding invocation
    pub fn fail(&mut self, id: &str, error: RpcError) {
        if let Some(call) = self.outstanding.remove(id) {
            let _ = call.reply.send(Err(error));
        }
    }

    /// Reject with `Timeout` if the invocation is still outstanding
    pub fn expire(&mut self, id: &str) {
        if let Some(call) = self.outstanding.remove(id) {
            warn!("rpc {} timed out", id);
            let _ = call.reply.send(Err(RpcError::Timeout));
        }
    }

    /// A participant left: every call targeted at them resolves with
    /// `RecipientDisconnected`.
    pub fn on_participant_left(&mut self, sid: &str) {
        let dead: Vec<String> = self
            .outstanding
            .iter()
            .filter(|(_, call)| call.target == sid)
            .map(|(id, _)| id.clone())
            .collect();
        for id in dead {
            if let Some(call) = self.outstanding.remove(&id) {
                let _ = call.reply.send(Err(RpcError::RecipientDisconnected));
            }
        }
    }

    /// Reject everything outstanding, used on terminal disconnect
    pub fn fail_all(&mut self, error: RpcError) {
        for (_, call) in self.outstanding.drain() {
            let _ = call.reply.send(Err(error.clone()));
        }
    }

    /// Handle an inbound frame addressed to `local_sid`. For requests the
    /// returned frame (response or error) must be sent back over the
    /// reliable channel; responses and errors resolve outstanding calls
    /// and return `None`.
    pub fn handle_frame(&mut self, local_sid: &str, frame: RpcFrame) -> Option<RpcFrame> {
        match frame {
            RpcFrame::Request {
                id,
                caller,
                method,
                payload,
                ..
            } => Some(self.dispatch(&id, &caller, &method, Bytes::from(payload))),
            RpcFrame::Response { id, target, payload } => {
                if target != local_sid {
                    debug!("dropping rpc response addressed to {}", target);
                    return None;
                }
                self.complete(&id, Bytes::from(payload));
                None
            }
            RpcFrame::Error {
                id,
                target,
                code,
                message,
            } => {
                if target != local_sid {
                    return None;
                }
                let error = match code {
                    RpcErrorCode::UnsupportedMethod => RpcError::UnsupportedMethod,
                    RpcErrorCode::RecipientDisconnected => RpcError::RecipientDisconnected,
                    RpcErrorCode::ApplicationError => RpcError::ApplicationError(message),
                };
                self.fail(&id, error);
                None
            }
        }
    }

    /// Number of calls still awaiting a response
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    fn dispatch(&self, id: &str, caller: &str, method: &str, payload: Bytes) -> RpcFrame {
        match self.handlers.get(method) {
            Some(handler) => match handler(caller, payload) {
                Ok(response) => RpcFrame::Response {
                    id: id.to_string(),
                    target: caller.to_string(),
                    payload: response.to_vec(),
                },
                Err(message) => RpcFrame::Error {
                    id: id.to_string(),
                    target: caller.to_string(),
                    code: RpcErrorCode::ApplicationError,
                    message,
                },
            },
            None => {
                debug!("no handler for rpc method {}", method);
                RpcFrame::Error {
                    id: id.to_string(),
                    target: caller.to_string(),
                    code: RpcErrorCode::UnsupportedMethod,
                    message: format!("no handler for method {}", method),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_resolves_caller() {
        let mut registry = RpcRegistry::new();
        let (_frame, id, rx) =
            registry.begin("PA_me", "PA_peer", "greet", Bytes::from_static(b"hi"));
        registry.complete(&id, Bytes::from_static(b"hello"));
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(registry.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_method_reply() {
        let mut registry = RpcRegistry::new();
        let request = RpcFrame::Request {
            id: "r1".into(),
            caller: "PA_peer".into(),
            target: "PA_me".into(),
            method: "nope".into(),
            payload: Vec::new(),
        };
        match registry.handle_frame("PA_me", request) {
            Some(RpcFrame::Error { id, target, code, .. }) => {
                assert_eq!(id, "r1");
                assert_eq!(target, "PA_peer");
                assert_eq!(code, RpcErrorCode::UnsupportedMethod);
            }
            other => panic!("expected error frame, got {:?}", other.map(|f| format!("{:?}", f))),
        }
    }

    #[tokio::test]
    async fn test_handler_dispatch_and_application_error() {
        let mut registry = RpcRegistry::new();
        registry.register_handler(
            "echo",
            Box::new(|_caller, payload| Ok(payload)),
        );
        registry.register_handler(
            "fail",
            Box::new(|_caller, _payload| Err("boom".to_string())),
        );

        let ok = registry.handle_frame(
            "PA_me",
            RpcFrame::Request {
                id: "r1".into(),
                caller: "PA_peer".into(),
                target: "PA_me".into(),
                method: "echo".into(),
                payload: b"data".to_vec(),
            },
        );
        assert!(matches!(
            ok,
            Some(RpcFrame::Response { ref payload, .. }) if payload == b"data"
        ));

        let err = registry.handle_frame(
            "PA_me",
            RpcFrame::Request {
                id: "r2".into(),
                caller: "PA_peer".into(),
                target: "PA_me".into(),
                method: "fail".into(),
                payload: Vec::new(),
            },
        );
        assert!(matches!(
            err,
            Some(RpcFrame::Error { code: RpcErrorCode::ApplicationError, ref message, .. })
                if message == "boom"
        ));
    }

    #[tokio::test]
    async fn test_participant_left_fails_targeted_calls() {
        let mut registry = RpcRegistry::new();
        let (_f1, _id1, rx1) = registry.begin("PA_me", "PA_gone", "a", Bytes::new());
        let (_f2, _id2, rx2) = registry.begin("PA_me", "PA_stays", "b", Bytes::new());
        registry.on_participant_left("PA_gone");
        assert_eq!(rx1.await.unwrap().unwrap_err(), RpcError::RecipientDisconnected);
        assert_eq!(registry.outstanding_count(), 1);
        drop(rx2);
    }

    #[tokio::test]
    async fn test_error_frame_resolves_outstanding() {
        let mut registry = RpcRegistry::new();
        let (_frame, id, rx) = registry.begin("PA_me", "PA_peer", "m", Bytes::new());
        let reply = registry.handle_frame(
            "PA_me",
            RpcFrame::Error {
                id,
                target: "PA_me".into(),
                code: RpcErrorCode::UnsupportedMethod,
                message: String::new(),
            },
        );
        assert!(reply.is_none());
        assert_eq!(rx.await.unwrap().unwrap_err(), RpcError::UnsupportedMethod);
    }

    #[tokio::test]
    async fn test_expire_is_idempotent() {
        let mut registry = RpcRegistry::new();
        let (_frame, id, rx) = registry.begin("PA_me", "PA_peer", "m", Bytes::new());
        registry.expire(&id);
        registry.expire(&id);
        assert_eq!(rx.await.unwrap().unwrap_err(), RpcError::Timeout);
    }
}
