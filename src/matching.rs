use std::{any::Any, fmt};

use crate::exchange::{Exchange, RecordedRequest, RequestUrl};

/// A loaded exchange plus whether a live request has already been answered with it.
///
/// Custom matchers can keep their own per-entry state in the user data slot; it lives as long
/// as the player that loaded the entry and is never written to the archive.
pub struct ReplayEntry {
    exchange: Exchange,
    consumed: bool,
    user_data: Option<Box<dyn Any + Send + Sync>>,
}

impl ReplayEntry {
    pub fn new(exchange: Exchange) -> Self {
        Self {
            exchange,
            consumed: false,
            user_data: None,
        }
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    pub fn mark_consumed(&mut self) {
        self.consumed = true;
    }

    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_deref()?.downcast_ref()
    }

    pub fn user_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.user_data.as_deref_mut()?.downcast_mut()
    }

    pub fn set_user_data<T: Any + Send + Sync>(&mut self, data: T) {
        self.user_data = Some(Box::new(data));
    }
}

impl fmt::Debug for ReplayEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayEntry")
            .field("exchange", &self.exchange)
            .field("consumed", &self.consumed)
            .field("has_user_data", &self.user_data.is_some())
            .finish()
    }
}

/// Decides whether a live request is answered by a recorded entry.
///
/// Implementations are expected to return `false` for consumed entries and to mark the entry
/// consumed when they return `true`.
pub trait Matcher: Send + Sync {
    fn matches(&self, live: &Exchange, entry: &mut ReplayEntry) -> bool;
}

impl<F> Matcher for F
where
    F: Fn(&Exchange, &mut ReplayEntry) -> bool + Send + Sync,
{
    fn matches(&self, live: &Exchange, entry: &mut ReplayEntry) -> bool {
        self(live, entry)
    }
}

/// Exact comparison of URL, body, headers and trailers.
///
/// The HTTP method is deliberately left out, so a recording made with `GET` answers a `HEAD`
/// for the same URL.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMatcher;

impl Matcher for DefaultMatcher {
    fn matches(&self, live: &Exchange, entry: &mut ReplayEntry) -> bool {
        if entry.is_consumed() {
            return false;
        }
        if !requests_equivalent(&live.request, &entry.exchange().request) {
            return false;
        }
        entry.mark_consumed();
        true
    }
}

pub fn requests_equivalent(live: &RecordedRequest, recorded: &RecordedRequest) -> bool {
    urls_equivalent(&live.url, &recorded.url)
        && live.body == recorded.body
        && live.headers == recorded.headers
        && live.trailers == recorded.trailers
}

fn urls_equivalent(live: &RequestUrl, recorded: &RequestUrl) -> bool {
    live.scheme == recorded.scheme
        && live.opaque == recorded.opaque
        && live.host == recorded.host
        && live.path == recorded.path
        && live.raw_query == recorded.raw_query
        && live.fragment == recorded.fragment
        && live.user_info == recorded.user_info
}
