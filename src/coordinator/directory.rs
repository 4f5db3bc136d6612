//! Broker directory: resolves which nodes can serve a stream.

use crate::client::StreamClient;
use crate::error::RillmqClientError;
use crate::protocol::{Broker, ResponseCode};
use crate::Result;
use std::sync::Arc;

/// Outcome of a candidate lookup, before error mapping.
///
/// Subscribe and recovery react differently to the non-`Found` cases, so the
/// raw classification is kept separate from [`find_brokers_for_stream`].
pub(crate) enum CandidateLookup {
    Found(Vec<Broker>),
    /// No metadata entry, or the broker says the stream does not exist.
    Missing,
    /// Metadata is OK but neither leader nor replicas were reported.
    NoNodes,
    /// Any other non-OK metadata code.
    Failed(ResponseCode),
}

/// Queries the locator for the nodes serving `stream`.
///
/// Replicas are preferred over the leader to keep read load off it.
pub(crate) async fn lookup_candidates(
    locator: &Arc<dyn StreamClient>,
    stream: &str,
) -> Result<CandidateLookup> {
    let mut metadata = locator.metadata(&[stream]).await?;
    let Some(stream_metadata) = metadata.remove(stream) else {
        return Ok(CandidateLookup::Missing);
    };
    match stream_metadata.code {
        ResponseCode::Ok => {}
        ResponseCode::StreamDoesNotExist => return Ok(CandidateLookup::Missing),
        code => return Ok(CandidateLookup::Failed(code)),
    }
    if !stream_metadata.replicas.is_empty() {
        Ok(CandidateLookup::Found(stream_metadata.replicas))
    } else if let Some(leader) = stream_metadata.leader {
        Ok(CandidateLookup::Found(vec![leader]))
    } else {
        Ok(CandidateLookup::NoNodes)
    }
}

/// Candidate lookup with subscribe-time error mapping.
pub(crate) async fn find_brokers_for_stream(
    locator: &Arc<dyn StreamClient>,
    stream: &str,
) -> Result<Vec<Broker>> {
    match lookup_candidates(locator, stream).await? {
        CandidateLookup::Found(candidates) => Ok(candidates),
        CandidateLookup::Missing => Err(RillmqClientError::stream_does_not_exist(stream)),
        CandidateLookup::NoNodes => Err(RillmqClientError::illegal_state(format!(
            "no node available for stream '{}'",
            stream
        ))),
        CandidateLookup::Failed(code) => Err(RillmqClientError::illegal_state(format!(
            "metadata request for stream '{}' failed: {}",
            stream, code
        ))),
    }
}
