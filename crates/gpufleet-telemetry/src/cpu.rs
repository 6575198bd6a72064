//! CPU usage from raw stats frames

use chrono::Datelike;
use gpufleet_runtime::StatsFrame;

/// CPU usage derived from stats frames
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuPercent {
    /// Cores in use times 100; may exceed 100
    pub raw: f64,
    /// `raw` divided by the CPU count, clamped to 0..=100
    pub normalized: f64,
}

/// CPUs visible to the unit according to a frame, 0 when unknown
pub fn frame_cpus(frame: &StatsFrame) -> u32 {
    match frame.cpu_stats.online_cpus {
        Some(n) if n > 0 => n,
        _ => frame
            .cpu_stats
            .cpu_usage
            .percpu_usage
            .as_ref()
            .map_or(0, |v| v.len() as u32),
    }
}

fn read_nanos_between(prev: &StatsFrame, curr: &StatsFrame) -> Option<f64> {
    let (prev, curr) = (prev.read_at()?, curr.read_at()?);
    // the engine reports an unset timestamp as year 1
    if prev.year() <= 1 || curr.year() <= 1 {
        return None;
    }
    (curr - prev).num_nanoseconds().map(|n| n as f64)
}

fn system_delta_percent(cpu_delta: f64, curr: u64, prev: u64, cpus: u32) -> f64 {
    let system_delta = curr as f64 - prev as f64;
    if cpu_delta > 0.0 && system_delta > 0.0 {
        cpu_delta / system_delta * cpus as f64 * 100.0
    } else {
        0.0
    }
}

/// Compute CPU usage from one or two consecutive frames.
///
/// With two frames the container's CPU time delta is divided by the wall time
/// between reads, falling back to the host CPU delta when read timestamps are
/// unusable. With one frame the engine's own previous counters are used.
/// `fallback_cpus` applies when the frames carry no CPU count.
pub fn cpu_percent(frames: &[StatsFrame], fallback_cpus: u32) -> CpuPercent {
    let (prev, curr) = match frames {
        [] => return CpuPercent::default(),
        [only] => (None, only),
        [first, second, ..] => (Some(first), second),
    };
    let cpus = match frame_cpus(curr) {
        0 => fallback_cpus,
        n => n,
    };

    let raw = match prev {
        Some(prev) => {
            let cpu_delta = curr.cpu_stats.cpu_usage.total_usage as f64
                - prev.cpu_stats.cpu_usage.total_usage as f64;
            match read_nanos_between(prev, curr) {
                Some(elapsed) if elapsed > 0.0 && cpu_delta >= 0.0 => cpu_delta / elapsed * 100.0,
                _ => system_delta_percent(
                    cpu_delta,
                    curr.cpu_stats.system_cpu_usage.unwrap_or(0),
                    prev.cpu_stats.system_cpu_usage.unwrap_or(0),
                    cpus,
                ),
            }
        }
        None => {
            let total = curr.cpu_stats.cpu_usage.total_usage;
            let pre_total = curr.precpu_stats.cpu_usage.total_usage;
            if total > 0 && pre_total > 0 {
                system_delta_percent(
                    total as f64 - pre_total as f64,
                    curr.cpu_stats.system_cpu_usage.unwrap_or(0),
                    curr.precpu_stats.system_cpu_usage.unwrap_or(0),
                    cpus,
                )
            } else {
                0.0
            }
        }
    };

    CpuPercent {
        raw,
        normalized: normalize(raw, cpus),
    }
}

/// Spread `raw` over `cpus` and clamp to 0..=100; 0 when the count is unknown
pub fn normalize(raw: f64, cpus: u32) -> f64 {
    if cpus > 0 {
        (raw / cpus as f64).clamp(0.0, 100.0)
    } else {
        0.0
    }
}
