use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::ingest::Ingestor;
use crate::query::QueryService;
use crate::rpc::server::RequestHandler;
use crate::rpc::{Request, Response};

/// Methods a transfer instance answers over RPC
pub struct TransferService {
    ingestor: Arc<Ingestor>,
    query: Arc<QueryService>,
}

impl TransferService {
    pub fn new(ingestor: Arc<Ingestor>, query: Arc<QueryService>) -> Self {
        Self { ingestor, query }
    }
}

#[async_trait]
impl RequestHandler for TransferService {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Push(points) => match self.ingestor.push(points) {
                Ok(summary) => Response::Push(summary),
                Err(e) => Response::Error(e.to_string()),
            },
            Request::Query(requests) => match self.query.query(requests).await {
                Ok(results) => Response::Query(results),
                Err(e) => {
                    warn!("query failed: {e}");
                    Response::Error(e.to_string())
                }
            },
            Request::Ping => Response::Pong,
            other => Response::Error(format!("method {} is not served by transfer", other.method())),
        }
    }
}
