//! Error collection.
//!
//! Beyond DNS response codes, the collector is the only user-visible
//! failure-reporting surface of the data plane. Implementations must never
//! block the caller; queries keep flowing while errors are recorded.

use crate::error::Error;
use crate::pipeline::RequestId;

/// A sink for runtime errors. The stderr backend is built in; a
/// Sentry-compatible sink is another implementation of this trait living
/// outside the data plane.
pub trait ErrorCollector: Send + Sync {
    /// Records an error. Must not block.
    fn collect(&self, err: &Error);

    /// Records an error attributed to a single query.
    fn collect_for_request(&self, request_id: RequestId, err: &Error) {
        tracing::debug!(%request_id, "collecting request error");
        self.collect(err);
    }
}

/// Writes collected errors to the process log on stderr. Client-induced
/// errors (malformed messages, bad device IDs) are routine on a public
/// resolver and land at debug; everything else at error.
#[derive(Clone, Copy, Debug, Default)]
pub struct StderrErrorCollector;

impl ErrorCollector for StderrErrorCollector {
    fn collect(&self, err: &Error) {
        if err.is_client_fault() {
            tracing::debug!(error = %err, "client error");
        } else {
            tracing::error!(error = %err, "collected error");
        }
    }

    fn collect_for_request(&self, request_id: RequestId, err: &Error) {
        if err.is_client_fault() {
            tracing::debug!(%request_id, error = %err, "client error");
        } else {
            tracing::error!(%request_id, error = %err, "collected error");
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Mutex;

    use super::*;

    /// Captures collected error strings for assertions.
    #[derive(Default)]
    pub struct CapturingErrorCollector {
        pub errors: Mutex<Vec<String>>,
    }

    impl ErrorCollector for CapturingErrorCollector {
        fn collect(&self, err: &Error) {
            self.errors.lock().unwrap().push(err.to_string());
        }
    }
}
