//! System metrics sampler
//!
//! Collects CPU, memory, fps and tick latency for the supervisor. These
//! do not go through user metric specs: the sampler records straight
//! into the registry, and they flow through the same allowlist as
//! everything else under the names `cpu`, `mem`, `fps`, `lat_in`,
//! `lat_out`.

use std::collections::VecDeque;

use hdrhistogram::Histogram;
use tokio::time::Instant;

use openfilter_core::metrics::{MetricRegistry, MetricSpec, MetricValue};
use openfilter_core::Result;

/// Rolling window of tick times used for the fps estimate
const FPS_WINDOW: usize = 30;

/// Linux kernels report `/proc` CPU times in USER_HZ ticks; 100 is the
/// universal default
const CLK_TCK: f64 = 100.0;

/// Names the sampler records under
pub const SYSTEM_METRICS: &[&str] = &["cpu", "mem", "fps", "lat_in", "lat_out"];

/// Per-filter system sampler
pub struct SystemSampler {
    tick_times: VecDeque<Instant>,
    lat_in: Histogram<u64>,
    lat_out: Histogram<u64>,
    last_cpu: Option<(Instant, f64)>,
    cores: f64,
}

impl SystemSampler {
    /// Fresh sampler
    pub fn new() -> Self {
        SystemSampler {
            tick_times: VecDeque::with_capacity(FPS_WINDOW),
            lat_in: Histogram::new_with_bounds(1, 600_000, 2).expect("static bounds"),
            lat_out: Histogram::new_with_bounds(1, 600_000, 2).expect("static bounds"),
            last_cpu: None,
            cores: num_cpus::get().max(1) as f64,
        }
    }

    /// Register the system gauges on a registry.
    ///
    /// Extraction is a no-op: values come from [`SystemSampler::on_tick`]
    /// and [`SystemSampler::sample_system`] via direct records.
    pub fn register_specs(registry: &MetricRegistry) -> Result<()> {
        for name in SYSTEM_METRICS {
            registry.register(MetricSpec::gauge(*name, MetricValue::func(|_| None)))?;
        }
        Ok(())
    }

    /// Record one processed tick
    pub fn on_tick(&mut self, registry: &MetricRegistry, lat_in_ms: f64, lat_out_ms: f64) {
        let now = Instant::now();
        self.tick_times.push_back(now);
        if self.tick_times.len() > FPS_WINDOW {
            self.tick_times.pop_front();
        }
        let _ = self.lat_in.record(lat_in_ms.max(1.0) as u64);
        let _ = self.lat_out.record(lat_out_ms.max(1.0) as u64);

        registry.record("fps", self.fps());
        registry.record("lat_in", lat_in_ms);
        registry.record("lat_out", lat_out_ms);
    }

    /// Ticks per second over the rolling window
    pub fn fps(&self) -> f64 {
        if self.tick_times.len() < 2 {
            return 0.0;
        }
        let span = *self.tick_times.back().expect("non-empty")
            - *self.tick_times.front().expect("non-empty");
        if span.is_zero() {
            return 0.0;
        }
        (self.tick_times.len() - 1) as f64 / span.as_secs_f64()
    }

    /// Latency percentile in milliseconds, for debug logging
    pub fn lat_in_percentile(&self, quantile: f64) -> u64 {
        self.lat_in.value_at_quantile(quantile)
    }

    /// Sample process CPU and memory into the registry.
    ///
    /// Reads `/proc/self`; on other platforms this records nothing.
    pub fn sample_system(&mut self, registry: &MetricRegistry) {
        if let Some(cpu) = self.sample_cpu() {
            registry.record("cpu", cpu);
        }
        if let Some(mem) = sample_rss_bytes() {
            registry.record("mem", mem);
        }
    }

    fn sample_cpu(&mut self) -> Option<f64> {
        let ticks = read_proc_cpu_ticks()?;
        let now = Instant::now();
        let seconds = ticks / CLK_TCK;
        let sample = match self.last_cpu.replace((now, seconds)) {
            Some((prev_t, prev_s)) => {
                let elapsed = (now - prev_t).as_secs_f64();
                if elapsed <= 0.0 {
                    return None;
                }
                ((seconds - prev_s) / elapsed / self.cores * 100.0).max(0.0)
            }
            None => return None,
        };
        Some(sample)
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// utime + stime in clock ticks from `/proc/self/stat`
fn read_proc_cpu_ticks() -> Option<f64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // the comm field may contain spaces; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 2..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // utime and stime are fields 14 and 15 of stat, i.e. 11 and 12 here
    let utime: f64 = fields.get(11)?.parse().ok()?;
    let stime: f64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// Resident set size in bytes from `/proc/self/statm`
fn sample_rss_bytes() -> Option<f64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fps_over_window() {
        let registry = MetricRegistry::new();
        SystemSampler::register_specs(&registry).unwrap();
        let mut sampler = SystemSampler::new();
        for _ in 0..5 {
            sampler.on_tick(&registry, 3.0, 5.0);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let fps = sampler.fps();
        assert!(fps > 10.0 && fps < 500.0, "fps {fps}");
        let snap = registry.snapshot();
        let lat_in = snap.metrics.iter().find(|m| m.name == "lat_in").unwrap();
        assert_eq!(lat_in.gauge, Some(3.0));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_procfs_readable() {
        assert!(read_proc_cpu_ticks().is_some());
        assert!(sample_rss_bytes().unwrap() > 0.0);
    }

    #[test]
    fn test_system_specs_do_not_extract_from_metadata() {
        let registry = MetricRegistry::new();
        SystemSampler::register_specs(&registry).unwrap();
        let mut meta = serde_json::Map::new();
        meta.insert("cpu".into(), serde_json::Value::from(99));
        registry.observe(&meta);
        let snap = registry.snapshot();
        let cpu = snap.metrics.iter().find(|m| m.name == "cpu").unwrap();
        assert_eq!(cpu.gauge, None);
    }
}
