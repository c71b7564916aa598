//! Live push stream of tree mutations

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event names understood by report clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
    BeginSuite,
    BeginState,
    TestResult,
    UpdateResult,
    UndoAccept,
    End,
}

impl ClientEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientEvent::BeginSuite => "BEGIN_SUITE",
            ClientEvent::BeginState => "BEGIN_STATE",
            ClientEvent::TestResult => "TEST_RESULT",
            ClientEvent::UpdateResult => "UPDATE_RESULT",
            ClientEvent::UndoAccept => "UNDO_ACCEPT",
            ClientEvent::End => "END",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    pub event: ClientEvent,
    pub data: Value,
}

impl StreamFrame {
    /// Render as a server-sent event
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event.as_str(), self.data)
    }
}

/// Fan-out of frames to any number of subscribers
#[derive(Clone)]
pub struct LiveStream {
    tx: broadcast::Sender<StreamFrame>,
}

impl LiveStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamFrame> {
        self.tx.subscribe()
    }

    pub fn emit<T: Serialize>(&self, event: ClientEvent, data: &T) {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                warn!("Dropping {} frame: {}", event.as_str(), e);
                return;
            }
        };

        // no subscribers is not an error
        if self.tx.send(StreamFrame { event, data }).is_err() {
            debug!("No stream subscribers for {}", event.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribers_receive_frames() {
        let stream = LiveStream::new(8);
        let mut rx = stream.subscribe();

        stream.emit(ClientEvent::BeginSuite, &json!({"suiteId": "a", "status": "running"}));
        let frame = rx.recv().await.unwrap();

        assert_eq!(frame.event, ClientEvent::BeginSuite);
        assert_eq!(frame.data["suiteId"], "a");
    }

    #[test]
    fn test_sse_rendering() {
        let frame = StreamFrame {
            event: ClientEvent::End,
            data: Value::Null,
        };
        assert_eq!(frame.to_sse(), "event: END\ndata: null\n\n");
        assert_eq!(serde_json::to_value(ClientEvent::TestResult).unwrap(), "TEST_RESULT");
    }

    #[test]
    fn test_emit_without_subscribers() {
        LiveStream::new(1).emit(ClientEvent::End, &Value::Null);
    }
}
