//! Request submission and session pinning.

use std::sync::Arc;

use gryphon_core::message::{RequestMessage, RequestOp};

use crate::cluster::Cluster;
use crate::error::{ClientError, Result};
use crate::host::Host;
use crate::result_set::ResultSet;

/// Cluster-wide client. Sessionless submissions rotate across available
/// hosts; sessions pin to one host for their lifetime since that host owns
/// the session's bindings.
#[derive(Clone)]
pub struct Client {
    cluster: Arc<Cluster>,
}

impl Client {
    pub(crate) fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Submits a request to the next available host. A request is handed to
    /// at most one connection; another host is tried only when the first one
    /// refused the request before it reached the wire.
    pub async fn submit(&self, request: RequestMessage) -> Result<ResultSet> {
        let attempts = self.cluster.hosts().len();
        for _ in 0..attempts {
            let host = self.cluster.pick()?;
            match host.submit(request.clone()).await {
                Ok(rx) => return Ok(ResultSet::new(request.request_id, rx)),
                Err(ClientError::ConnectionClosed) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(ClientError::NoHostAvailable)
    }

    /// Convenience for a sessionless script with no bindings.
    pub async fn submit_script(&self, script: impl Into<String>) -> Result<ResultSet> {
        self.submit(RequestMessage::eval(script.into()).create()).await
    }

    /// Opens a session pinned to one currently-available host.
    pub fn session(&self, session_id: impl Into<String>) -> Result<SessionClient> {
        let host = self.cluster.pick()?;
        Ok(SessionClient {
            host,
            session_id: session_id.into(),
        })
    }
}

/// Client for one named session. All requests go to the pinned host and
/// execute there in submission order.
pub struct SessionClient {
    host: Arc<Host>,
    session_id: String,
}

impl SessionClient {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn submit_script(&self, script: impl Into<String>) -> Result<ResultSet> {
        let request = RequestMessage::eval(script.into())
            .session(self.session_id.clone())
            .create();
        self.submit(request).await
    }

    /// Submits a prebuilt request, forcing it onto this session.
    pub async fn submit(&self, mut request: RequestMessage) -> Result<ResultSet> {
        request.args.session_id = Some(self.session_id.clone());
        let rx = self.host.submit(request.clone()).await?;
        Ok(ResultSet::new(request.request_id, rx))
    }

    /// Closes the session on the server, discarding its bindings. A forced
    /// close also cancels whatever is currently running.
    pub async fn close(&self, force: bool) -> Result<()> {
        let request = RequestMessage::build(RequestOp::Close)
            .session(self.session_id.clone())
            .force_close(force)
            .create();
        let rx = self.host.submit(request.clone()).await?;
        ResultSet::new(request.request_id, rx).all().await?;
        Ok(())
    }
}
