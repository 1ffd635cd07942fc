//! Pluggable request and response filtering

use crate::common::Authority;
use crate::http::{RequestHead, ResponseHead};
use std::sync::Arc;

/// Inspects and may mutate every request before it is forwarded upstream.
///
/// Filters run after proxy header rewriting; hop-by-hop headers a filter
/// introduces are scrubbed again before the request leaves the proxy.
pub trait RequestFilter: Send + Sync {
    fn filter(&self, request: &mut RequestHead);
}

/// Inspects and may mutate a response head before it reaches the client.
pub trait ResponseFilter: Send + Sync {
    fn filter(&self, response: &mut ResponseHead);
}

/// Yields the response filter to apply for a given upstream authority.
pub trait ResponseFilterSource: Send + Sync {
    fn filter_for(&self, authority: &Authority) -> Option<Arc<dyn ResponseFilter>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Version;

    struct TagFilter;

    impl RequestFilter for TagFilter {
        fn filter(&self, request: &mut RequestHead) {
            request.headers.set("X-Filtered", "1");
        }
    }

    #[test]
    fn test_filter_mutates_request() {
        let mut req = RequestHead::new("GET", "/", Version::Http11);
        TagFilter.filter(&mut req);
        assert_eq!(req.headers.get("X-Filtered"), Some("1"));
    }
}
