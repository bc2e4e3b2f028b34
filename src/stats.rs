//! Resource usage derived from cumulative sandbox counters.

use crate::sandbox::ResourceSample;

/// Memory and CPU usage at one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Usage {
    pub memory_bytes: u64,
    /// Percentage of one CPU; may exceed 100 on multi-core hosts
    pub cpu_percent: f32,
}

/// Turns successive cumulative samples into per-interval CPU usage.
#[derive(Debug, Default)]
pub(crate) struct CpuSampler {
    previous: Option<ResourceSample>,
}

impl CpuSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Usage over the interval since the previous sample.
    ///
    /// The first sample has no interval and reports 0%. A counter that
    /// goes backwards (container restart, engine hiccup) also reports 0%.
    pub fn observe(&mut self, sample: ResourceSample) -> Usage {
        let cpu_percent = match self.previous {
            Some(previous) => cpu_percent(&previous, &sample),
            None => 0.0,
        };
        self.previous = Some(sample);

        Usage {
            memory_bytes: sample.memory_bytes,
            cpu_percent,
        }
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn cpu_percent(previous: &ResourceSample, current: &ResourceSample) -> f32 {
    let cpu_delta = current.cpu_total_ns.saturating_sub(previous.cpu_total_ns);
    let system_delta = current.system_total_ns.saturating_sub(previous.system_total_ns);
    if cpu_delta == 0 || system_delta == 0 {
        return 0.0;
    }

    let cpus = f64::from(current.online_cpus.max(1));
    let percent = (cpu_delta as f64 / system_delta as f64) * cpus * 100.0;
    percent.clamp(0.0, cpus * 100.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: u64, system: u64, cpus: u32, memory: u64) -> ResourceSample {
        ResourceSample {
            cpu_total_ns: cpu,
            system_total_ns: system,
            online_cpus: cpus,
            memory_bytes: memory,
        }
    }

    #[test]
    fn test_first_sample_reports_zero_cpu() {
        let mut sampler = CpuSampler::new();
        let usage = sampler.observe(sample(500, 10_000, 4, 1024));
        assert_eq!(usage.cpu_percent, 0.0);
        assert_eq!(usage.memory_bytes, 1024);
    }

    #[test]
    fn test_cpu_percent_scales_with_online_cpus() {
        let mut sampler = CpuSampler::new();
        sampler.observe(sample(0, 0, 2, 0));

        // 250 of 1000 host ns on a 2-CPU host is half of one CPU
        let usage = sampler.observe(sample(250, 1000, 2, 2048));
        assert!((usage.cpu_percent - 50.0).abs() < 0.001);
        assert_eq!(usage.memory_bytes, 2048);

        // Deltas are per interval, not since the first sample
        let usage = sampler.observe(sample(1250, 2000, 2, 2048));
        assert!((usage.cpu_percent - 200.0).abs() < 0.001);
    }

    #[test]
    fn test_counter_reset_reports_zero() {
        let mut sampler = CpuSampler::new();
        sampler.observe(sample(5000, 10_000, 1, 0));
        let usage = sampler.observe(sample(100, 20_000, 1, 0));
        assert_eq!(usage.cpu_percent, 0.0);
    }

    #[test]
    fn test_cpu_percent_is_clamped() {
        let mut sampler = CpuSampler::new();
        sampler.observe(sample(0, 0, 1, 0));
        let usage = sampler.observe(sample(5000, 1000, 1, 0));
        assert_eq!(usage.cpu_percent, 100.0);
    }

    #[test]
    fn test_zero_online_cpus_counts_as_one() {
        let mut sampler = CpuSampler::new();
        sampler.observe(sample(0, 0, 0, 0));
        let usage = sampler.observe(sample(100, 1000, 0, 0));
        assert!((usage.cpu_percent - 10.0).abs() < 0.001);
    }
}
