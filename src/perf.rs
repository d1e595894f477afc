//! Stage timing for the performance report.

use std::fmt::Write as _;
use std::time::Duration;

use web_time::Instant;

#[derive(Debug)]
struct Stage {
    name: String,
    total: Duration,
    calls: usize,
}

/// Accumulates wall-clock time per named stage, in first-use order.
#[derive(Debug)]
pub struct PerfStats {
    started: Instant,
    stages: Vec<Stage>,
}

impl Default for PerfStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PerfStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            stages: Vec::new(),
        }
    }

    pub fn record(&mut self, name: &str, elapsed: Duration) {
        match self.stages.iter_mut().find(|s| s.name == name) {
            Some(stage) => {
                stage.total += elapsed;
                stage.calls += 1;
            }
            None => self.stages.push(Stage {
                name: name.to_string(),
                total: elapsed,
                calls: 1,
            }),
        }
    }

    /// Runs `f` and charges its duration to `name`.
    pub fn time<T>(&mut self, name: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record(name, start.elapsed());
        out
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.name.as_str())
    }

    pub fn total(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn report(&self) -> String {
        let mut out = String::new();
        for stage in &self.stages {
            let _ = writeln!(
                out,
                "{}: {:.3} s ({} calls)",
                stage.name,
                stage.total.as_secs_f64(),
                stage.calls
            );
        }
        let _ = writeln!(out, "Total: {:.3} s", self.total().as_secs_f64());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_keep_first_use_order() {
        let mut stats = PerfStats::new();
        stats.record("SimulateSlices", Duration::from_millis(20));
        stats.record("Superresolution", Duration::from_millis(5));
        stats.record("SimulateSlices", Duration::from_millis(10));
        let names: Vec<&str> = stats.stage_names().collect();
        assert_eq!(names, ["SimulateSlices", "Superresolution"]);
        let report = stats.report();
        assert!(report.starts_with("SimulateSlices: 0.030 s (2 calls)"));
        assert!(report.contains("Total:"));
    }

    #[test]
    fn timed_closure_returns_its_value() {
        let mut stats = PerfStats::new();
        assert_eq!(stats.time("work", || 7), 7);
        assert_eq!(stats.stage_names().count(), 1);
    }
}
