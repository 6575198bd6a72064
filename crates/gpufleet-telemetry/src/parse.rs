//! Tolerant parsers for engine CLI and GPU query output

/// Split a string into its leading numeric part and the unit that follows
fn split_number(s: &str) -> (&str, &str) {
    let s = s.trim();
    let end = s
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || matches!(c, '+' | '-' | '.')))
        .map_or(s.len(), |(i, _)| i);
    (s[..end].trim(), s[end..].trim())
}

/// Parse `"12.34%"` into `12.34`; anything unparsable is 0
pub fn parse_percent(s: &str) -> f64 {
    s.trim()
        .trim_end_matches('%')
        .trim()
        .parse()
        .unwrap_or(0.0)
}

/// Parse a size such as `"824KiB"`, `"1.23GB"` or `"12.5 MB"` into bytes.
///
/// `KiB/MiB/GiB/TiB` and bare `K/M/G/T` are binary; `kB/KB/MB/GB/TB` are
/// decimal. A number without unit is bytes.
pub fn parse_bytes(s: &str) -> u64 {
    let (number, unit) = split_number(s);
    let value: f64 = match number.parse() {
        Ok(v) => v,
        Err(_) => return 0,
    };
    let factor = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kib" => 1024.0,
        "m" | "mib" => 1024.0 * 1024.0,
        "g" | "gib" => 1024.0 * 1024.0 * 1024.0,
        "t" | "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "kb" => 1e3,
        "mb" => 1e6,
        "gb" => 1e9,
        "tb" => 1e12,
        _ => 1.0,
    };
    if value <= 0.0 {
        return 0;
    }
    (value * factor) as u64
}

/// Parse `"X / Y"` into `(X, Y)` bytes; a single value yields `(X, 0)`
pub fn parse_used_total(s: &str) -> (u64, u64) {
    let mut parts = s.splitn(2, '/');
    let used = parts.next().map_or(0, parse_bytes);
    let total = parts.next().map_or(0, parse_bytes);
    (used, total)
}

/// Parse a GPU memory field into MB, accepting `"48000"`, `"48000 MiB"` or `"47 GB"`
pub fn parse_mb_allow_units(s: &str) -> f64 {
    let (number, unit) = split_number(s);
    let value: f64 = match number.parse() {
        Ok(v) => v,
        Err(_) => return 0.0,
    };
    match unit.to_ascii_lowercase().as_str() {
        "gib" | "gb" | "g" => value * 1024.0,
        "kib" | "kb" | "k" => value / 1024.0,
        _ => value,
    }
}

/// Total and used GPU memory in MB summed across cards
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuMemoryLines {
    /// Summed total memory in MB
    pub total_mb: f64,
    /// Summed used memory in MB
    pub used_mb: f64,
}

/// Parse `memory.total, memory.used` CSV lines, one per card.
///
/// Lines with fewer than two fields or a non-positive total are skipped.
/// Returns `None` when no card could be read.
pub fn parse_gpu_memory_lines(output: &str) -> Option<GpuMemoryLines> {
    let mut total_mb = 0.0;
    let mut used_mb = 0.0;
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut fields = line.split(',');
        let (Some(total), Some(used)) = (fields.next(), fields.next()) else {
            continue;
        };
        let total = parse_mb_allow_units(total);
        if total > 0.0 {
            total_mb += total;
            used_mb += parse_mb_allow_units(used);
        }
    }
    (total_mb > 0.0).then_some(GpuMemoryLines { total_mb, used_mb })
}

/// Count the CPUs of a cpuset such as `"0-3,5"`
pub fn cpuset_count(set: &str) -> u32 {
    set.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|part| match part.split_once('-') {
            Some((start, end)) => match (start.trim().parse::<u32>(), end.trim().parse::<u32>()) {
                (Ok(start), Ok(end)) if end >= start => (end - start).checked_add(1).unwrap_or(0),
                _ => 0,
            },
            None => u32::from(part.parse::<u32>().is_ok()),
        })
        .fold(0u32, u32::saturating_add)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy)]
    enum Unit {
        None,
        MiB,
        GB,
    }

    fn format_gpu_line(total_mb: f64, used_mb: f64, unit: Unit) -> String {
        match unit {
            Unit::None => format!("{}, {}", total_mb, used_mb),
            Unit::MiB => format!("{} MiB, {} MiB", total_mb, used_mb),
            Unit::GB => format!("{} GB, {} GB", total_mb / 1024.0, used_mb / 1024.0),
        }
    }

    #[test]
    fn test_gpu_line_round_trip() {
        for (total, used) in [(40960.0, 1024.0), (81920.0, 0.0), (24576.0, 12288.0)] {
            for unit in [Unit::None, Unit::MiB, Unit::GB] {
                let parsed = parse_gpu_memory_lines(&format_gpu_line(total, used, unit)).unwrap();
                assert_eq!(parsed.total_mb, total);
                assert_eq!(parsed.used_mb, used);
            }
        }
    }

    #[test]
    fn test_gpu_lines_multi_card() {
        let out = "40960, 1024\n40960, 3072\n\n";
        let parsed = parse_gpu_memory_lines(out).unwrap();
        assert_eq!(parsed.total_mb, 81920.0);
        assert_eq!(parsed.used_mb, 4096.0);
    }

    #[test]
    fn test_gpu_lines_unusable() {
        assert!(parse_gpu_memory_lines("").is_none());
        assert!(parse_gpu_memory_lines("NVIDIA-SMI has failed").is_none());
        assert!(parse_gpu_memory_lines("[N/A], [N/A]").is_none());
        assert!(parse_gpu_memory_lines("0, 0").is_none());
    }

    #[test]
    fn test_parse_percent() {
        assert_eq!(parse_percent("12.34%"), 12.34);
        assert_eq!(parse_percent(" 250.5 % "), 250.5);
        assert_eq!(parse_percent("--"), 0.0);
    }

    #[test]
    fn test_parse_bytes_units() {
        assert_eq!(parse_bytes("824KiB"), 824 * 1024);
        assert_eq!(parse_bytes("1.5GiB"), 1610612736);
        assert_eq!(parse_bytes("12.5 MB"), 12_500_000);
        assert_eq!(parse_bytes("3kB"), 3000);
        assert_eq!(parse_bytes("2G"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_bytes("512"), 512);
        assert_eq!(parse_bytes("0B"), 0);
        assert_eq!(parse_bytes("n/a"), 0);
    }

    #[test]
    fn test_parse_used_total() {
        assert_eq!(
            parse_used_total("512MiB / 2GiB"),
            (512 * 1024 * 1024, 2 * 1024 * 1024 * 1024)
        );
        assert_eq!(parse_used_total("100B"), (100, 0));
    }

    #[test]
    fn test_cpuset_count() {
        assert_eq!(cpuset_count("0-3,5"), 5);
        assert_eq!(cpuset_count(" 0 , 2-2 "), 2);
        assert_eq!(cpuset_count("3-1,x"), 0);
        assert_eq!(cpuset_count(""), 0);
        assert_eq!(cpuset_count("0-4294967295"), 0);
        assert_eq!(cpuset_count("1-4294967295,0-4294967295"), u32::MAX);
    }
}
