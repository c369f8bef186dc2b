//! Pluggable request/response inspection.

use std::sync::Arc;

use bytes::Bytes;

use crate::http1::{HttpRequest, HttpResponse};

/// Inspect or mutate every request after the proxy's own header rewriting.
///
/// Mutations are forwarded verbatim; a filter that re-introduces
/// hop-by-hop headers owns the consequences, the proxy does not scrub a
/// second time. Returning a response (head plus body) short-circuits the
/// exchange: nothing is sent upstream and the returned response is written
/// to the client with the usual response rewriting applied.
pub trait RequestFilter: Send + Sync {
    fn filter(&self, request: &mut HttpRequest) -> Option<(HttpResponse, Bytes)>;
}

/// Inspect or mutate response heads before they are written to the client.
pub trait ResponseFilter: Send + Sync {
    fn filter(&self, response: &mut HttpResponse);
}

/// Yields the response filter (if any) for a given upstream authority.
pub trait ResponseFilterSource: Send + Sync {
    fn filter_for(&self, authority: &str) -> Option<Arc<dyn ResponseFilter>>;
}
