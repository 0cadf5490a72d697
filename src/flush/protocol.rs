//! Manager/worker messages and their framing.
//!
//! Frames are a 4-byte big-endian length followed by one JSON document:
//! commands travel on the worker's stdin, messages on its stdout.

use bytes::Bytes;
use futures::{Sink, SinkExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use super::worker::FlushWorkerStats;
use crate::error::{Error, Result};

/// Manager → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum WorkerCommand {
    GetStats,
    Shutdown {
        #[serde(rename = "timeoutMs")]
        timeout_ms: u64,
    },
}

/// Worker → manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum WorkerMessage {
    Ready,
    Stats(FlushWorkerStats),
    ShutdownComplete,
    Error(String),
}

/// Largest frame either side accepts.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    serde_json::from_slice(frame).map_err(|e| Error::Ipc(format!("malformed frame: {e}")))
}

/// Encodes and sends one frame.
pub async fn send<S, T>(sink: &mut S, message: &T) -> Result<()>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
    T: Serialize,
{
    sink.send(encode(message)?)
        .await
        .map_err(|e| Error::Ipc(format!("send failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_use_kebab_case_tags() {
        assert_eq!(
            serde_json::to_value(WorkerCommand::GetStats).unwrap(),
            json!({"type": "get-stats"})
        );
        assert_eq!(
            serde_json::to_value(WorkerCommand::Shutdown { timeout_ms: 5000 }).unwrap(),
            json!({"type": "shutdown", "payload": {"timeoutMs": 5000}})
        );
    }

    #[test]
    fn messages_carry_payloads() {
        assert_eq!(
            serde_json::to_value(WorkerMessage::ShutdownComplete).unwrap(),
            json!({"type": "shutdown-complete"})
        );
        assert_eq!(
            serde_json::to_value(WorkerMessage::Error("boom".into())).unwrap(),
            json!({"type": "error", "payload": "boom"})
        );
        let parsed: WorkerMessage = decode(br#"{"type":"ready"}"#).unwrap();
        assert_eq!(parsed, WorkerMessage::Ready);
    }

    #[test]
    fn garbage_is_an_ipc_error() {
        let err = decode::<WorkerCommand>(b"not json").unwrap_err();
        assert!(matches!(err, Error::Ipc(_)));
    }

    #[tokio::test]
    async fn frames_round_trip_over_a_pipe() {
        use futures::StreamExt;
        use tokio_util::codec::{FramedRead, FramedWrite};

        let (a, b) = tokio::io::duplex(1024);
        let mut writer = FramedWrite::new(a, codec());
        let mut reader = FramedRead::new(b, codec());
        send(&mut writer, &WorkerCommand::Shutdown { timeout_ms: 10 })
            .await
            .unwrap();
        let frame = reader.next().await.unwrap().unwrap();
        let command: WorkerCommand = decode(&frame).unwrap();
        assert_eq!(command, WorkerCommand::Shutdown { timeout_ms: 10 });
    }
}
