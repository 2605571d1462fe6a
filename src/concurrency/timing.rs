use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Measures one operation; logs its duration when finished
#[derive(Debug)]
pub struct Stopwatch {
    operation: String,
    start: Instant,
}

impl Stopwatch {
    pub fn start(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn finish(self) -> Duration {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis() as u64,
            "Operation completed"
        );
        duration
    }
}

/// Await `future` and report how long it took
pub async fn timed<F: Future>(future: F) -> (F::Output, Duration) {
    let start = Instant::now();
    let output = future.await;
    (output, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timed_measures_paused_clock() {
        let (value, elapsed) = timed(async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            7
        })
        .await;
        assert_eq!(value, 7);
        assert!(elapsed >= Duration::from_secs(2));

        let watch = Stopwatch::start("noop");
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(watch.finish() >= Duration::from_millis(5));
    }
}
