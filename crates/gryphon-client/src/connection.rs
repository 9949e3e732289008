//! One multiplexed connection to a server.
//!
//! A driver task owns the socket. Submissions flow in through a channel and
//! are matched back to their callers by request id, so any number of requests
//! can be in flight concurrently. When the socket dies every pending caller's
//! response channel is dropped, which they observe as an abrupt close rather
//! than a terminal response.

use std::collections::HashMap;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::debug;
use uuid::Uuid;

use gryphon_core::message::{RequestMessage, ResponseMessage, StatusCode};
use gryphon_core::serializer::{MessageSerializer, SerializerFormat, serializer_for};
use std::sync::Arc;

use crate::error::ClientError;

pub(crate) struct Submission {
    pub request: RequestMessage,
    pub responses: mpsc::UnboundedSender<ResponseMessage>,
}

/// Handle for submitting requests over one live connection.
pub(crate) struct Connection {
    tx: mpsc::Sender<Submission>,
}

impl Connection {
    /// Connects, performs the one-byte serializer negotiation, and spawns the
    /// driver. `on_close` fires exactly once when the connection dies.
    pub(crate) async fn open(
        addr: &str,
        format: SerializerFormat,
        registry: Arc<gryphon_core::serializer::TypeRegistry>,
        on_close: Box<dyn FnOnce() + Send>,
    ) -> std::io::Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&[format.wire_id()]).await?;
        let serializer = serializer_for(format, registry);
        let (read_half, write_half) = stream.into_split();
        let reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let sink = FramedWrite::new(write_half, LengthDelimitedCodec::new());
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(drive(reader, sink, rx, serializer, on_close));
        Ok(Self { tx })
    }

    /// Hands a request to the driver. An error here means the request never
    /// reached the wire, so resubmitting elsewhere cannot duplicate it.
    pub(crate) async fn submit(
        &self,
        request: RequestMessage,
    ) -> Result<mpsc::UnboundedReceiver<ResponseMessage>, ClientError> {
        let (responses, rx) = mpsc::unbounded_channel();
        self.tx
            .send(Submission { request, responses })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        Ok(rx)
    }
}

async fn drive(
    mut reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    mut sink: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    mut rx: mpsc::Receiver<Submission>,
    serializer: Arc<dyn MessageSerializer>,
    on_close: Box<dyn FnOnce() + Send>,
) {
    let mut pending: HashMap<Uuid, mpsc::UnboundedSender<ResponseMessage>> = HashMap::new();
    loop {
        tokio::select! {
            submission = rx.recv() => match submission {
                Some(Submission { request, responses }) => {
                    match serializer.serialize_request(&request) {
                        Ok(bytes) => {
                            if sink.send(bytes).await.is_err() {
                                debug!("request write failed, closing connection");
                                break;
                            }
                            pending.insert(request.request_id, responses);
                        }
                        Err(err) => {
                            // Local failure, the request was never sent.
                            let _ = responses.send(ResponseMessage::error(
                                request.request_id,
                                StatusCode::ServerSerializationError,
                                err.to_string(),
                            ));
                        }
                    }
                }
                None => break,
            },
            frame = reader.next() => match frame {
                Some(Ok(bytes)) => match serializer.deserialize_response(&bytes) {
                    Ok(msg) => {
                        let terminal = msg.status.code.is_terminal();
                        let request_id = msg.request_id;
                        if let Some(sender) = pending.get(&request_id) {
                            let _ = sender.send(msg);
                        } else {
                            debug!(%request_id, "response for unknown request");
                        }
                        if terminal {
                            pending.remove(&request_id);
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "undecodable response frame");
                    }
                },
                Some(Err(err)) => {
                    debug!(error = %err, "connection error");
                    break;
                }
                None => break,
            },
        }
    }
    // Dropping the pending senders fails every in-flight request.
    drop(pending);
    on_close();
}
