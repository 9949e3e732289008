//! Per-connection protocol handling.
//!
//! A connection starts with a one-byte serializer negotiation, then carries
//! length-delimited frames in both directions. Each request is dispatched on
//! its own task so a slow evaluation never blocks later requests on the same
//! connection; responses are funneled through a single writer task.
//!
//! A frame larger than `max_content_length` surfaces as a codec error before
//! any of it is parsed; the connection is dropped on the spot, which the
//! client observes as a reset rather than an error response.

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};
use uuid::Uuid;

use gryphon_core::message::{ResponseMessage, StatusCode};
use gryphon_core::serializer::{SerializerFormat, serializer_for};

use crate::server::ServerState;
use crate::writer::{ResponseWriter, WriteMeter};

const RESPONSE_QUEUE_DEPTH: usize = 32;

pub(crate) async fn handle_connection(mut stream: TcpStream, state: Arc<ServerState>) {
    let mut format_byte = [0u8; 1];
    if let Err(err) = stream.read_exact(&mut format_byte).await {
        debug!(error = %err, "connection closed before serializer negotiation");
        return;
    }
    let Some(format) = SerializerFormat::from_wire_id(format_byte[0]) else {
        warn!(byte = format_byte[0], "unknown serializer format, dropping connection");
        return;
    };
    let serializer = serializer_for(format, Arc::clone(&state.registry));

    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, frame_codec(state.settings.max_content_length));
    let sink = FramedWrite::new(write_half, frame_codec(state.settings.max_content_length));

    let meter = Arc::new(WriteMeter::new(
        state.settings.write_buffer_high_water_mark,
        state.settings.write_buffer_low_water_mark,
    ));
    let (tx, rx) = mpsc::channel(RESPONSE_QUEUE_DEPTH);
    let writer_task = tokio::spawn(write_loop(rx, sink, Arc::clone(&meter)));
    let writer = ResponseWriter::new(Arc::clone(&serializer), tx, meter);

    while let Some(frame) = reader.next().await {
        match frame {
            Ok(bytes) => match serializer.deserialize_request(&bytes) {
                Ok(msg) => {
                    let dispatcher = Arc::clone(&state.dispatcher);
                    let writer = writer.clone();
                    tokio::spawn(async move {
                        dispatcher.dispatch(msg, writer).await;
                    });
                }
                Err(err) => {
                    // The frame parsed but the message did not; the request id
                    // is unknowable so the nil id stands in.
                    writer
                        .send_best_effort(&ResponseMessage::error(
                            Uuid::nil(),
                            StatusCode::MalformedRequest,
                            err.to_string(),
                        ))
                        .await;
                }
            },
            Err(err) => {
                warn!(error = %err, "dropping connection on framing error");
                writer_task.abort();
                return;
            }
        }
    }
    // Normal EOF: in-flight dispatch tasks keep their writer clones and the
    // writer task drains once the last one finishes.
    debug!("connection closed");
}

fn frame_codec(max_content_length: usize) -> LengthDelimitedCodec {
    let mut codec = LengthDelimitedCodec::new();
    codec.set_max_frame_length(max_content_length);
    codec
}

async fn write_loop(
    mut rx: mpsc::Receiver<Bytes>,
    mut sink: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    meter: Arc<WriteMeter>,
) {
    while let Some(bytes) = rx.recv().await {
        let len = bytes.len();
        if let Err(err) = sink.send(bytes).await {
            debug!(error = %err, "response write failed, closing connection");
            return;
        }
        meter.complete(len);
    }
}
