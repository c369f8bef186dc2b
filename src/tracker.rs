//! Activity tracking: observability callbacks fanned out per proxied flow.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::chain::TransportProtocol;
use crate::http1::{HttpRequest, HttpResponse};

/// Where a tracked event happened: which client, over what transport,
/// toward which upstream (and through which chained proxy, if any).
#[derive(Debug, Clone)]
pub struct FlowContext {
    pub client_address: SocketAddr,
    pub transport: TransportProtocol,
    pub server_authority: Option<String>,
    pub chain_authority: Option<String>,
}

impl FlowContext {
    pub fn new(client_address: SocketAddr) -> FlowContext {
        FlowContext {
            client_address,
            transport: TransportProtocol::Tcp,
            server_authority: None,
            chain_authority: None,
        }
    }
}

/// Observer for proxy activity. All callbacks have empty defaults so a
/// tracker implements only what it cares about.
#[allow(unused_variables)]
pub trait ActivityTracker: Send + Sync {
    fn bytes_received_from_client(&self, context: &FlowContext, bytes: usize) {}

    fn request_received_from_client(&self, context: &FlowContext, request: &HttpRequest) {}

    fn request_sent(&self, context: &FlowContext, request: &HttpRequest) {}

    fn bytes_received_from_server(&self, context: &FlowContext, bytes: usize) {}

    fn response_received(&self, context: &FlowContext, response: &HttpResponse) {}
}

/// Fan-out to every registered tracker. Cloned freely across connection
/// tasks.
#[derive(Clone, Default)]
pub struct ActivityRecorder {
    trackers: Arc<Vec<Arc<dyn ActivityTracker>>>,
}

impl ActivityRecorder {
    pub fn new(trackers: Vec<Arc<dyn ActivityTracker>>) -> ActivityRecorder {
        ActivityRecorder {
            trackers: Arc::new(trackers),
        }
    }

    pub fn bytes_received_from_client(&self, context: &FlowContext, bytes: usize) {
        if bytes == 0 {
            return;
        }
        for tracker in self.trackers.iter() {
            tracker.bytes_received_from_client(context, bytes);
        }
    }

    pub fn request_received_from_client(&self, context: &FlowContext, request: &HttpRequest) {
        for tracker in self.trackers.iter() {
            tracker.request_received_from_client(context, request);
        }
    }

    pub fn request_sent(&self, context: &FlowContext, request: &HttpRequest) {
        for tracker in self.trackers.iter() {
            tracker.request_sent(context, request);
        }
    }

    pub fn bytes_received_from_server(&self, context: &FlowContext, bytes: usize) {
        if bytes == 0 {
            return;
        }
        for tracker in self.trackers.iter() {
            tracker.bytes_received_from_server(context, bytes);
        }
    }

    pub fn response_received(&self, context: &FlowContext, response: &HttpResponse) {
        for tracker in self.trackers.iter() {
            tracker.response_received(context, response);
        }
    }
}
