use std::fmt::Display;

use metrics::counter;
use tokio::sync::mpsc;
use tracing::debug;

/// A failure that was logged and swallowed, for operators that want to alert on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub context: &'static str,
    pub topic: String,
    pub error: String,
}

/// Fans swallowed failures out to metrics and, optionally, to a channel.
#[derive(Clone, Default)]
pub struct FailureReporter {
    sender: Option<mpsc::UnboundedSender<FailureReport>>,
}

impl FailureReporter {
    /// Only count failures in metrics.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FailureReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { sender: Some(tx) }, rx)
    }

    pub fn report(&self, context: &'static str, topic: &str, error: &dyn Display) {
        counter!("doc_stream_failures_total", "context" => context).increment(1);

        let Some(sender) = &self.sender else {
            return;
        };
        let report = FailureReport {
            context,
            topic: topic.to_owned(),
            error: error.to_string(),
        };
        if sender.send(report).is_err() {
            debug!("failure report receiver is gone, dropping report");
        }
    }
}
