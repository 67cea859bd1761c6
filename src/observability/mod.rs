//! Distributed-trace subsegments.
//!
//! A thin shim over `tracing` spans: a [`Subsegment`] opens a span when
//! it begins and logs the elapsed time when it drops, which is enough
//! for trace backends fed by a `tracing` subscriber. The library never
//! installs a subscriber itself; transport selection belongs to the
//! embedding application.

use std::time::Instant;

use tracing::{debug, span, Level, Span};

pub struct Subsegment {
    name: String,
    started: Instant,
    span: Span,
}

impl Subsegment {
    pub fn begin(name: &str) -> Self {
        let span = span!(Level::DEBUG, "subsegment", segment = name);
        Self {
            name: name.to_string(),
            started: Instant::now(),
            span,
        }
    }

    /// Run a future inside this subsegment's span.
    pub async fn wrap<F, T>(self, future: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        use tracing::Instrument;
        let span = self.span.clone();
        future.instrument(span).await
        // `self` drops here, logging the elapsed time.
    }
}

impl Drop for Subsegment {
    fn drop(&mut self) {
        let _entered = self.span.enter();
        debug!(
            segment = %self.name,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "subsegment closed"
        );
    }
}
