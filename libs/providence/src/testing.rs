//! Scripted transport and fixtures for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use http::Method;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::client::Client;
use crate::config::ProvidenceConfig;
use crate::derivers::DefaultDerivers;
use crate::fetchable::QueryParams;
use crate::forms::validators::ValidatorRegistry;
use crate::paginator::DefaultPaginator;
use crate::runtime::Providence;
use crate::transport::{NetRequest, NetResponse, Transport, TransportError};

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub url: String,
    pub method: Method,
    pub data: Option<Value>,
    pub params: Option<QueryParams>,
}

type Reply = Result<NetResponse, TransportError>;

enum Scripted {
    Now(Reply),
    Gated(oneshot::Receiver<Reply>),
}

/// Answers calls from a queue of scripted replies, in order.
#[derive(Default)]
pub(crate) struct MockTransport {
    requests: Mutex<Vec<RecordedRequest>>,
    replies: Mutex<VecDeque<Scripted>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, data: Value) {
        self.replies
            .lock()
            .push_back(Scripted::Now(Ok(NetResponse::ok(data))));
    }

    pub fn fail(&self, error: TransportError) {
        self.replies.lock().push_back(Scripted::Now(Err(error)));
    }

    /// Queues a reply that stays pending until the returned sender fires or
    /// the request is cancelled.
    pub fn gate(&self) -> oneshot::Sender<Reply> {
        let (tx, rx) = oneshot::channel();
        self.replies.lock().push_back(Scripted::Gated(rx));
        tx
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn call(&self, request: NetRequest) -> Result<NetResponse, TransportError> {
        self.requests.lock().push(RecordedRequest {
            url: request.url.clone(),
            method: request.method.clone(),
            data: request.data.clone(),
            params: request.params.clone(),
        });
        let scripted = self.replies.lock().pop_front();
        match scripted {
            Some(Scripted::Now(reply)) => {
                if request.signal.is_cancelled() {
                    return Err(TransportError::cancelled());
                }
                reply
            }
            Some(Scripted::Gated(rx)) => tokio::select! {
                _ = request.signal.cancelled() => Err(TransportError::cancelled()),
                reply = rx => reply.unwrap_or_else(|_| Err(TransportError::cancelled())),
            },
            None => Err(TransportError::network(
                "UNSCRIPTED",
                format!("no reply scripted for {} {}", request.method, request.url),
            )),
        }
    }
}

pub(crate) fn client(transport: Arc<MockTransport>) -> Client {
    let config = ProvidenceConfig::default();
    Client {
        paginator: Arc::new(DefaultPaginator::new(config.page_size)),
        config,
        transport,
        derivers: Arc::new(DefaultDerivers),
        validators: ValidatorRegistry::with_defaults(),
    }
}

pub(crate) fn providence(transport: Arc<MockTransport>) -> Providence {
    Providence::builder()
        .transport(transport)
        .build()
        .expect("test root builds")
}
