//! Read path: route series queries to the storage node that owns them

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::adapters::{PushError, RpcEndpoint};
use crate::cluster::MembershipCache;
use crate::point::{Fingerprint, PointError, join_tags, parse_tag_string};
use crate::rpc::{PoolRegistry, QueryRequest, QueryResponse};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no storage node for {0}")]
    NoNode(String),
    #[error("invalid counter {counter:?}: {source}")]
    Counter {
        counter: String,
        #[source]
        source: PointError,
    },
    #[error("query to {addr} failed: {source}")]
    Storage {
        addr: String,
        #[source]
        source: PushError,
    },
}

/// Fingerprint of the series a query names, identical to the one the write
/// path computed for its points
pub fn series_fingerprint(endpoint: &str, counter: &str) -> Result<Fingerprint, PointError> {
    let (metric, tags) = counter.split_once('/').unwrap_or((counter, ""));
    let tags: BTreeMap<String, String> = parse_tag_string(tags)?
        .into_iter()
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    Ok(Fingerprint::of(&format!("{endpoint}/{metric}/{}", join_tags(&tags))))
}

pub struct QueryService {
    membership: Arc<MembershipCache>,
    pools: PoolRegistry,
}

impl QueryService {
    pub fn new(membership: Arc<MembershipCache>, pools: PoolRegistry) -> Self {
        Self { membership, pools }
    }

    /// Group requests by owning node, query nodes concurrently, keep only
    /// values inside each request's `[start, end]`
    #[instrument(skip_all, fields(requests = requests.len()))]
    pub async fn query(&self, requests: Vec<QueryRequest>) -> Result<Vec<QueryResponse>, QueryError> {
        let mut groups: HashMap<Vec<String>, Vec<QueryRequest>> = HashMap::new();
        {
            let view = self.membership.storage();
            for request in requests {
                let fp = series_fingerprint(&request.endpoint, &request.counter).map_err(|source| QueryError::Counter {
                    counter: request.counter.clone(),
                    source,
                })?;
                let addrs = view.addresses_for(fp.ring_key());
                if addrs.is_empty() {
                    return Err(QueryError::NoNode(format!("{}/{}", request.endpoint, request.counter)));
                }
                groups.entry(addrs.to_vec()).or_default().push(request);
            }
        }

        let calls = groups.into_iter().map(|(addrs, requests)| self.query_node(addrs, requests));
        let mut responses = Vec::new();
        for result in join_all(calls).await {
            responses.extend(result?);
        }

        for response in &mut responses {
            let (start, end) = (response.start, response.end);
            response.values.retain(|tv| tv.timestamp >= start && tv.timestamp <= end);
        }
        Ok(responses)
    }

    /// Replicas of a node hold the same data; the first that answers wins
    async fn query_node(&self, addrs: Vec<String>, requests: Vec<QueryRequest>) -> Result<Vec<QueryResponse>, QueryError> {
        let mut last_err = None;
        for addr in addrs {
            let endpoint = RpcEndpoint::new(addr.clone(), self.pools.clone());
            match endpoint.query(requests.clone()).await {
                Ok(responses) => return Ok(responses),
                Err(e) => {
                    debug!("query via {addr} failed: {e}");
                    last_err = Some(QueryError::Storage { addr, source: e });
                }
            }
        }
        Err(last_err.unwrap_or_else(|| QueryError::NoNode("empty node".to_string())))
    }
}
