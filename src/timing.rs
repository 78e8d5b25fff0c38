//! Stage timing.

use std::time::{Duration, Instant};

/// Measures one pipeline stage and logs its duration when finished.
pub struct Timer {
    name: String,
    start: Instant,
}

impl Timer {
    /// Start a new timer for the given stage.
    pub fn start(name: &str) -> Self {
        tracing::debug!(stage = name, "starting");
        Self {
            name: name.to_string(),
            start: Instant::now(),
        }
    }

    /// Finish the timer and log the elapsed time.
    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        tracing::info!("{}", format_elapsed(&self.name, elapsed));
        elapsed
    }
}

fn format_elapsed(name: &str, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs >= 60.0 {
        format!("[{:.1}m] {}", secs / 60.0, name)
    } else {
        format!("[{:.1}s] {}", secs, name)
    }
}
