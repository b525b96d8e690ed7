//! Server-pushed events and the per-connection sink that carries them

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::types::{BackendKind, ExitEvent, OutputEvent, StreamKind};

/// Event sent from the server to a connected client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// The session's sandbox is ready to run code
    SessionReady { mode: BackendKind },
    /// A piece of program output, or an extracted artifact
    Output { stream: StreamKind, data: String },
    /// The program exited
    Exit { code: i32 },
    /// Infrastructure failure (never a program failure)
    Error { message: String },
}

impl From<OutputEvent> for ServerEvent {
    fn from(event: OutputEvent) -> Self {
        ServerEvent::Output {
            stream: event.stream,
            data: event.payload,
        }
    }
}

impl From<ExitEvent> for ServerEvent {
    fn from(event: ExitEvent) -> Self {
        ServerEvent::Exit { code: event.code }
    }
}

/// Cloneable handle used to push events to one client.
///
/// Once closed, every further emit is silently dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ServerEvent>,
    closed: Arc<AtomicBool>,
}

impl EventSink {
    /// Create a sink and the receiver that drains it
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EventSink {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Push an event; returns false when the client is gone
    pub fn emit(&self, event: ServerEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    pub fn output(&self, stream: StreamKind, data: impl Into<String>) -> bool {
        self.emit(ServerEvent::Output {
            stream,
            data: data.into(),
        })
    }

    pub fn exit(&self, code: i32) -> bool {
        self.emit(ServerEvent::Exit { code })
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.emit(ServerEvent::Error {
            message: message.into(),
        })
    }

    /// Stop delivering events (client disconnected)
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let ready = ServerEvent::SessionReady {
            mode: BackendKind::Container,
        };
        assert_eq!(
            serde_json::to_string(&ready).unwrap(),
            r#"{"type":"session-ready","mode":"Container"}"#
        );

        let out = ServerEvent::Output {
            stream: StreamKind::Stdout,
            data: "hi\n".into(),
        };
        assert_eq!(
            serde_json::to_string(&out).unwrap(),
            r#"{"type":"output","stream":"stdout","data":"hi\n"}"#
        );
        assert_eq!(
            serde_json::to_string(&ServerEvent::Exit { code: 127 }).unwrap(),
            r#"{"type":"exit","code":127}"#
        );
    }

    #[tokio::test]
    async fn test_closed_sink_drops_events() {
        let (sink, mut rx) = EventSink::channel();
        assert!(sink.output(StreamKind::Stdout, "a"));
        sink.close();
        assert!(!sink.exit(0));
        assert_eq!(
            rx.recv().await,
            Some(ServerEvent::Output {
                stream: StreamKind::Stdout,
                data: "a".into()
            })
        );
        assert!(rx.try_recv().is_err());
    }
}
