//! Streams an evaluation's results back as batched response messages.
//!
//! Results are pulled lazily from the iterator and shipped in chunks of the
//! effective batch size. Every chunk except the last carries
//! `PartialContent`; the last carries `Success`, so a result set that fits in
//! one chunk produces a single `Success` message and an empty result set
//! produces a lone `NoContent`.

use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use gryphon_core::Value;
use gryphon_core::message::{ResponseMessage, StatusCode};
use gryphon_core::script::ResultIter;

use crate::writer::{ResponseWriter, WriteError};

const SERIALIZED_RESPONSE_TIMEOUT_MESSAGE: &str =
    "Serialization of the entire response exceeded the 'serializedResponseTimeout' setting";

pub async fn stream_results(
    request_id: Uuid,
    results: ResultIter,
    batch_size: usize,
    serialization_timeout: Duration,
    writer: &ResponseWriter,
) {
    let deadline = Instant::now() + serialization_timeout;
    let mut results = results.peekable();

    if results.peek().is_none() {
        writer
            .send_best_effort(&ResponseMessage::no_content(request_id))
            .await;
        return;
    }

    loop {
        if Instant::now() >= deadline {
            warn!(%request_id, "response serialization deadline exceeded");
            writer
                .send_best_effort(&ResponseMessage::error(
                    request_id,
                    StatusCode::ServerTimeout,
                    SERIALIZED_RESPONSE_TIMEOUT_MESSAGE,
                ))
                .await;
            return;
        }

        let mut chunk = Vec::with_capacity(batch_size);
        while chunk.len() < batch_size {
            match results.next() {
                Some(value) => chunk.push(value),
                None => break,
            }
        }
        // One-element lookahead decides whether this chunk is terminal.
        let terminal = results.peek().is_none();
        let msg = if terminal {
            ResponseMessage::success(request_id, Value::List(chunk))
        } else {
            ResponseMessage::partial(request_id, Value::List(chunk))
        };

        match writer.send(&msg).await {
            Ok(()) => {}
            Err(WriteError::Serialization(err)) => {
                // The failure is scoped to this request: report it terminally
                // and leave the connection usable for others.
                warn!(%request_id, error = %err, "response serialization failed");
                writer
                    .send_best_effort(&ResponseMessage::error(
                        request_id,
                        StatusCode::ServerSerializationError,
                        err.to_string(),
                    ))
                    .await;
                return;
            }
            Err(WriteError::ConnectionClosed) => {
                debug!(%request_id, "connection closed mid-stream");
                return;
            }
        }

        if terminal {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use gryphon_core::serializer::{
        GraphBinSerializer, GraphJsonSerializer, MessageSerializer, TypeRegistry,
    };
    use crate::writer::WriteMeter;

    fn json_writer() -> (ResponseWriter, mpsc::Receiver<Bytes>, Arc<dyn MessageSerializer>) {
        let serializer: Arc<dyn MessageSerializer> = Arc::new(GraphJsonSerializer::new());
        let (tx, rx) = mpsc::channel(64);
        let meter = Arc::new(WriteMeter::new(1 << 20, 1 << 19));
        (
            ResponseWriter::new(Arc::clone(&serializer), tx, meter),
            rx,
            serializer,
        )
    }

    async fn collect_responses(
        rx: &mut mpsc::Receiver<Bytes>,
        serializer: &Arc<dyn MessageSerializer>,
    ) -> Vec<ResponseMessage> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            out.push(serializer.deserialize_response(&bytes).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn ten_results_in_batches_of_two_make_five_messages() {
        let (writer, mut rx, serializer) = json_writer();
        let results = ResultIter::List((0..10).map(Value::Int).collect::<Vec<_>>().into_iter());
        let id = Uuid::new_v4();
        stream_results(id, results, 2, Duration::from_secs(30), &writer).await;

        let messages = collect_responses(&mut rx, &serializer).await;
        assert_eq!(messages.len(), 5);
        for msg in &messages[..4] {
            assert_eq!(msg.status.code, StatusCode::PartialContent);
        }
        assert_eq!(messages[4].status.code, StatusCode::Success);
        assert_eq!(
            messages[4].result.data,
            Some(Value::List(vec![Value::Int(8), Value::Int(9)]))
        );
    }

    #[tokio::test]
    async fn single_chunk_result_skips_partial_content() {
        let (writer, mut rx, serializer) = json_writer();
        let results = ResultIter::Single(Some(Value::Int(2)));
        stream_results(Uuid::new_v4(), results, 64, Duration::from_secs(30), &writer).await;

        let messages = collect_responses(&mut rx, &serializer).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status.code, StatusCode::Success);
    }

    #[tokio::test]
    async fn empty_results_produce_no_content() {
        let (writer, mut rx, serializer) = json_writer();
        stream_results(
            Uuid::new_v4(),
            ResultIter::Empty,
            64,
            Duration::from_secs(30),
            &writer,
        )
        .await;

        let messages = collect_responses(&mut rx, &serializer).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status.code, StatusCode::NoContent);
        assert!(messages[0].result.data.is_none());
    }

    #[tokio::test]
    async fn unregistered_type_becomes_a_serialization_error_response() {
        let serializer: Arc<dyn MessageSerializer> = Arc::new(GraphBinSerializer::new(Arc::new(
            TypeRegistry::new(),
        )));
        let (tx, mut rx) = mpsc::channel(64);
        let meter = Arc::new(WriteMeter::new(1 << 20, 1 << 19));
        let writer = ResponseWriter::new(Arc::clone(&serializer), tx, meter);

        let custom = Value::Custom {
            type_name: "color".to_string(),
            fields: Default::default(),
        };
        stream_results(
            Uuid::new_v4(),
            ResultIter::Single(Some(custom)),
            64,
            Duration::from_secs(30),
            &writer,
        )
        .await;

        let bytes = rx.try_recv().unwrap();
        let msg = serializer.deserialize_response(&bytes).unwrap();
        assert_eq!(msg.status.code, StatusCode::ServerSerializationError);
        assert_eq!(
            msg.status.message,
            "Error during serialization: Type is not registered: color"
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn expired_deadline_reports_the_serialized_response_timeout() {
        let (writer, mut rx, serializer) = json_writer();
        let results = ResultIter::List(vec![Value::Int(1)].into_iter());
        stream_results(
            Uuid::new_v4(),
            results,
            64,
            Duration::from_millis(0),
            &writer,
        )
        .await;

        let messages = collect_responses(&mut rx, &serializer).await;
        assert_eq!(messages.len(), 1);
        // The deadline is a timeout, not a serialization fault.
        assert_eq!(messages[0].status.code, StatusCode::ServerTimeout);
        assert!(
            messages[0]
                .status
                .message
                .ends_with("Serialization of the entire response exceeded the 'serializedResponseTimeout' setting")
        );
    }
}
