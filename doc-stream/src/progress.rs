use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::info;

static NEXT_ACTIVITY_ID: AtomicU64 = AtomicU64::new(1);

/// A unit of work being reported on, such as one batch.
#[derive(Debug)]
pub struct Activity {
    pub id: u64,
    pub name: String,
    started: Instant,
}

impl Activity {
    pub fn new(name: &str) -> Self {
        Self {
            id: NEXT_ACTIVITY_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_owned(),
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}

/// Advisory progress reporting. Implementations must not affect processing.
pub trait ProgressReporter: Send + Sync {
    fn start_activity(&self, message: &str) -> Activity;
    fn progress(&self, activity: &Activity, message: &str);
    fn success(&self, activity: &Activity, message: &str);
}

pub struct TracingProgress;

impl ProgressReporter for TracingProgress {
    fn start_activity(&self, message: &str) -> Activity {
        let activity = Activity::new(message);
        info!(activity = activity.id, "{message}");
        activity
    }

    fn progress(&self, activity: &Activity, message: &str) {
        info!(activity = activity.id, "{}: {message}", activity.name);
    }

    fn success(&self, activity: &Activity, message: &str) {
        info!(
            activity = activity.id,
            elapsed_ms = activity.elapsed_ms() as u64,
            "{}: {message}",
            activity.name
        );
    }
}

pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn start_activity(&self, message: &str) -> Activity {
        Activity::new(message)
    }

    fn progress(&self, _: &Activity, _: &str) {}

    fn success(&self, _: &Activity, _: &str) {}
}
