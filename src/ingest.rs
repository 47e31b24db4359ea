//! Ingestion edge shared by the RPC and HTTP listeners

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, instrument};

use crate::dispatch::{DispatchError, Dispatcher};
use crate::point::{PointError, RawPoint, Validator};
use crate::rpc::PushResponse;
use crate::stats::{self, Counter, Stats};

/// Errors listed verbatim in a push summary; the rest are only counted
const MAX_LISTED_ERRORS: usize = 10;

pub struct Ingestor {
    validator: Validator,
    dispatcher: Arc<Dispatcher>,
    invalid: Counter,
}

impl Ingestor {
    pub fn new(validator: Validator, dispatcher: Arc<Dispatcher>, stats: &Stats) -> Self {
        Self {
            validator,
            dispatcher,
            invalid: stats.counter(stats::POINTS_IN_ERR),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn push(&self, points: Vec<RawPoint>) -> Result<PushResponse, DispatchError> {
        self.push_results(points.into_iter().map(Ok).collect())
    }

    /// Validate and dispatch each point independently
    ///
    /// Returns once every accepted point is enqueued. Only a dispatcher that
    /// stopped accepting fails the whole call.
    #[instrument(skip_all, fields(points = points.len()))]
    pub fn push_results(&self, points: Vec<Result<RawPoint, PointError>>) -> Result<PushResponse, DispatchError> {
        if !self.dispatcher.is_accepting() {
            return Err(DispatchError::ShuttingDown);
        }

        let started = Instant::now();
        let total = points.len();
        let mut errors: Vec<(usize, PointError)> = Vec::new();

        for (i, raw) in points.into_iter().enumerate() {
            match raw.and_then(|raw| self.validator.validate(raw)) {
                Ok(point) => {
                    self.dispatcher.dispatch(point)?;
                }
                Err(e) => errors.push((i, e)),
            }
        }

        if !errors.is_empty() {
            self.invalid.add(errors.len() as u64);
            debug!("{} of {total} points rejected", errors.len());
        }

        Ok(PushResponse {
            total_received: total as u32,
            invalid: errors.len() as u32,
            latency_ms: started.elapsed().as_millis() as u64,
            message: summarize(&errors),
        })
    }
}

/// `"point 3: metric is empty; point 7: ..."`, capped
fn summarize(errors: &[(usize, PointError)]) -> String {
    let mut message = String::new();
    for (i, e) in errors.iter().take(MAX_LISTED_ERRORS) {
        if !message.is_empty() {
            message.push_str("; ");
        }
        let _ = write!(message, "point {i}: {e}");
    }
    if errors.len() > MAX_LISTED_ERRORS {
        let _ = write!(message, "; and {} more", errors.len() - MAX_LISTED_ERRORS);
    }
    message
}
