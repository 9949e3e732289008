//! Consuming a response stream.

use tokio::sync::mpsc;
use uuid::Uuid;

use gryphon_core::Value;
use gryphon_core::message::ResponseMessage;

use crate::error::{ClientError, Result};

/// The stream of responses for one submitted request. Messages arrive in
/// order; the stream ends at the first terminal status.
#[derive(Debug)]
pub struct ResultSet {
    request_id: Uuid,
    rx: mpsc::UnboundedReceiver<ResponseMessage>,
    finished: bool,
}

impl ResultSet {
    pub(crate) fn new(request_id: Uuid, rx: mpsc::UnboundedReceiver<ResponseMessage>) -> Self {
        Self {
            request_id,
            rx,
            finished: false,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Next raw response message, including partials. `None` after the
    /// terminal message; an abrupt close before it is an error.
    pub async fn next_message(&mut self) -> Result<Option<ResponseMessage>> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(msg) => {
                if msg.status.code.is_terminal() {
                    self.finished = true;
                }
                Ok(Some(msg))
            }
            None => Err(ClientError::ConnectionClosed),
        }
    }

    /// Drains the stream into the flattened list of result values. An error
    /// status anywhere in the stream aborts with [`ClientError::Server`].
    pub async fn all(mut self) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        while let Some(msg) = self.next_message().await? {
            if msg.status.code.is_error() {
                return Err(ClientError::Server {
                    code: msg.status.code,
                    message: msg.status.message,
                });
            }
            match msg.result.data {
                Some(Value::List(items)) => out.extend(items),
                Some(value) => out.push(value),
                None => {}
            }
        }
        Ok(out)
    }

    /// First result value, if any.
    pub async fn one(self) -> Result<Option<Value>> {
        let mut items = self.all().await?;
        if items.is_empty() {
            Ok(None)
        } else {
            Ok(Some(items.remove(0)))
        }
    }
}
