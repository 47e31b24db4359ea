use async_trait::async_trait;

use super::{PushEndpoint, PushError};
use crate::point::SharedPoint;
use crate::rpc::{AggrPacket, JudgeItem, PoolRegistry, QueryRequest, QueryResponse, Request, Response, RpcError};

/// Item kinds that ship over the framed RPC
pub trait RpcItem: Clone + Send + Sync + 'static {
    fn into_request(batch: Vec<Self>) -> Request;
}

impl RpcItem for SharedPoint {
    fn into_request(batch: Vec<Self>) -> Request {
        Request::Store(batch)
    }
}

impl RpcItem for JudgeItem {
    fn into_request(batch: Vec<Self>) -> Request {
        Request::Judge(batch)
    }
}

impl RpcItem for AggrPacket {
    fn into_request(batch: Vec<Self>) -> Request {
        Request::Aggregate(batch)
    }
}

/// Storage, judge or aggregation detector reached through the pool
///
/// The pool is resolved per call, so a pool dropped by a membership rebuild
/// is recreated on demand.
pub struct RpcEndpoint {
    addr: String,
    pools: PoolRegistry,
}

impl RpcEndpoint {
    pub fn new(addr: impl Into<String>, pools: PoolRegistry) -> Self {
        Self {
            addr: addr.into(),
            pools,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn call(&self, request: Request) -> Result<Response, RpcError> {
        self.pools.call(&self.addr, &request).await
    }

    /// Read series back from a storage instance
    pub async fn query(&self, requests: Vec<QueryRequest>) -> Result<Vec<QueryResponse>, PushError> {
        match self.call(Request::Query(requests)).await? {
            Response::Query(results) => Ok(results),
            _ => Err(RpcError::UnexpectedResponse("Query").into()),
        }
    }
}

#[async_trait]
impl<T: RpcItem> PushEndpoint<T> for RpcEndpoint {
    fn name(&self) -> &str {
        &self.addr
    }

    async fn push(&self, batch: &[T]) -> Result<(), PushError> {
        let request = T::into_request(batch.to_vec());
        let method = request.method();
        match self.call(request).await? {
            Response::Ack(_) => Ok(()),
            _ => Err(RpcError::UnexpectedResponse(method).into()),
        }
    }
}
