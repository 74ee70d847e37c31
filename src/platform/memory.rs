//! Platform-reported memory figure used to size the decoded-image cache.

use tracing::debug;

/// Assumed when the platform does not report anything usable.
pub const FALLBACK_AVAILABLE_MEMORY: u64 = 512 * 1024 * 1024;

/// Memory currently available to the process, in bytes.
pub fn available_memory_bytes() -> u64 {
    match read_available_memory() {
        Some(bytes) if bytes > 0 => bytes,
        _ => {
            debug!(
                fallback = FALLBACK_AVAILABLE_MEMORY,
                "platform memory figure unavailable; using fallback"
            );
            FALLBACK_AVAILABLE_MEMORY
        }
    }
}

#[cfg(target_os = "linux")]
fn read_available_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_available(&meminfo)
}

#[cfg(not(target_os = "linux"))]
fn read_available_memory() -> Option<u64> {
    None
}

/// Extract `MemAvailable` (reported in kB) from a `/proc/meminfo` dump.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mem_available_line() {
        let dump = "MemTotal:       16318480 kB\nMemFree:         1022188 kB\nMemAvailable:    8159240 kB\n";
        assert_eq!(parse_mem_available(dump), Some(8_159_240 * 1024));
    }

    #[test]
    fn missing_line_yields_none() {
        assert_eq!(parse_mem_available("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn reported_figure_is_positive() {
        assert!(available_memory_bytes() > 0);
    }
}
