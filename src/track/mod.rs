//! Activity tracking

use crate::chain::Transport;
use crate::common::Authority;
use crate::http::{RequestHead, ResponseHead};
use std::net::SocketAddr;
use std::sync::Arc;

/// Identifies one client→server flow for tracker callbacks.
#[derive(Debug, Clone)]
pub struct FlowContext {
    pub client_address: SocketAddr,
    pub transport: Transport,
    pub server_authority: Authority,
    pub chain_authority: Option<Authority>,
}

/// Observability callbacks for proxied traffic. All methods default to
/// no-ops so trackers implement only what they care about.
pub trait ActivityTracker: Send + Sync {
    fn bytes_received_from_client(&self, _ctx: &FlowContext, _bytes: usize) {}
    fn request_received_from_client(&self, _ctx: &FlowContext, _request: &RequestHead) {}
    fn request_sent(&self, _ctx: &FlowContext, _request: &RequestHead) {}
    fn bytes_received_from_server(&self, _ctx: &FlowContext, _bytes: usize) {}
    fn response_received(&self, _ctx: &FlowContext, _response: &ResponseHead) {}
}

/// Fans events out to every registered tracker.
#[derive(Clone, Default)]
pub struct ActivityRecorder {
    trackers: Arc<Vec<Arc<dyn ActivityTracker>>>,
}

impl ActivityRecorder {
    pub fn new(trackers: Vec<Arc<dyn ActivityTracker>>) -> Self {
        ActivityRecorder {
            trackers: Arc::new(trackers),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn bytes_received_from_client(&self, ctx: &FlowContext, bytes: usize) {
        for tracker in self.trackers.iter() {
            tracker.bytes_received_from_client(ctx, bytes);
        }
    }

    pub fn request_received_from_client(&self, ctx: &FlowContext, request: &RequestHead) {
        for tracker in self.trackers.iter() {
            tracker.request_received_from_client(ctx, request);
        }
    }

    pub fn request_sent(&self, ctx: &FlowContext, request: &RequestHead) {
        for tracker in self.trackers.iter() {
            tracker.request_sent(ctx, request);
        }
    }

    pub fn bytes_received_from_server(&self, ctx: &FlowContext, bytes: usize) {
        for tracker in self.trackers.iter() {
            tracker.bytes_received_from_server(ctx, bytes);
        }
    }

    pub fn response_received(&self, ctx: &FlowContext, response: &ResponseHead) {
        for tracker in self.trackers.iter() {
            tracker.response_received(ctx, response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Version;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTracker {
        requests: AtomicUsize,
        responses: AtomicUsize,
    }

    impl ActivityTracker for CountingTracker {
        fn request_received_from_client(&self, _ctx: &FlowContext, _request: &RequestHead) {
            self.requests.fetch_add(1, Ordering::Relaxed);
        }

        fn response_received(&self, _ctx: &FlowContext, _response: &ResponseHead) {
            self.responses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flow_context() -> FlowContext {
        FlowContext {
            client_address: "127.0.0.1:55000".parse().unwrap(),
            transport: Transport::Tcp,
            server_authority: Authority::new("example.org", 80),
            chain_authority: None,
        }
    }

    #[test]
    fn test_fan_out() {
        let a = Arc::new(CountingTracker::default());
        let b = Arc::new(CountingTracker::default());
        let recorder = ActivityRecorder::new(vec![a.clone(), b.clone()]);

        let ctx = flow_context();
        let req = RequestHead::new("GET", "/", Version::Http11);
        recorder.request_received_from_client(&ctx, &req);
        recorder.response_received(&ctx, &ResponseHead::new(Version::Http11, 200, "OK"));

        assert_eq!(a.requests.load(Ordering::Relaxed), 1);
        assert_eq!(b.requests.load(Ordering::Relaxed), 1);
        assert_eq!(a.responses.load(Ordering::Relaxed), 1);
    }
}
