//! Resource guard: point-in-time memory/CPU sampling and threshold gates.
//!
//! Read-only with respect to daemon state. Each gate takes a fresh snapshot
//! (a single `/proc` read on Linux), so it is cheap enough to call on every
//! enqueue. Thresholds come from configuration, not from this module.

use std::fs;

use tracing::{debug, warn};

/// Instantaneous view of host resources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    /// Fraction of system memory in use (0.0–1.0).
    pub used_memory_fraction: f64,
    /// 1-minute load average.
    pub cpu_load: f64,
}

/// Samples host memory/CPU and gates memory-sensitive actions.
#[derive(Debug, Clone)]
pub struct ResourceGuard {
    /// Used-memory fraction above which model loads are refused.
    pub memory_threshold: f64,
    /// Used-memory fraction above which new enqueues are rejected.
    pub critical_threshold: f64,
}

impl ResourceGuard {
    pub fn new(memory_threshold: f64, critical_threshold: f64) -> Self {
        Self {
            memory_threshold,
            critical_threshold,
        }
    }

    /// Take a fresh sample. Unreadable sources read as zero pressure; the
    /// guard fails open rather than wedging playback on a sampling error.
    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            used_memory_fraction: used_memory_fraction().unwrap_or(0.0),
            cpu_load: load_average().unwrap_or(0.0),
        }
    }

    /// May the daemon load the model right now?
    pub fn allow_load(&self) -> bool {
        let snap = self.snapshot();
        if snap.used_memory_fraction > self.memory_threshold {
            warn!(
                used = format!("{:.1}%", snap.used_memory_fraction * 100.0),
                threshold = format!("{:.1}%", self.memory_threshold * 100.0),
                "Refusing model load, memory above threshold"
            );
            return false;
        }
        true
    }

    /// May the daemon accept another request onto the queue?
    pub fn allow_enqueue(&self) -> bool {
        let snap = self.snapshot();
        if snap.used_memory_fraction > self.critical_threshold {
            warn!(
                used = format!("{:.1}%", snap.used_memory_fraction * 100.0),
                "Rejecting enqueue, memory critically high"
            );
            return false;
        }
        true
    }

    /// Apply a nice value to the current process. Returns true on success.
    pub fn apply_nice(&self, nice_value: i32) -> bool {
        #[cfg(target_os = "linux")]
        {
            // nice() returns -1 both on error and as a valid result, so
            // check errno explicitly
            unsafe {
                *libc::__errno_location() = 0;
                let result = libc::nice(nice_value);
                let errno = *libc::__errno_location();
                if errno != 0 {
                    warn!(nice = nice_value, errno = errno, "Failed to set nice value");
                    return false;
                }
                debug!(nice = result, "Applied nice value");
                true
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            debug!(nice = nice_value, "nice not supported on this platform");
            let _ = nice_value;
            false
        }
    }

    /// Current process RSS in bytes. Returns 0 on error or non-Linux.
    pub fn rss_bytes(&self) -> u64 {
        #[cfg(target_os = "linux")]
        {
            // /proc/self/statm: size resident share text lib data dt, in pages
            match fs::read_to_string("/proc/self/statm") {
                Ok(content) => {
                    let parts: Vec<&str> = content.split_whitespace().collect();
                    if parts.len() >= 2
                        && let Ok(pages) = parts[1].parse::<u64>()
                    {
                        return pages * 4096;
                    }
                    0
                }
                Err(e) => {
                    debug!(error = %e, "Failed to read /proc/self/statm");
                    0
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            0
        }
    }
}

/// System used-memory fraction from /proc/meminfo (MemTotal vs MemAvailable).
fn used_memory_fraction() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        let content = fs::read_to_string("/proc/meminfo").ok()?;
        let mut total_kb = None;
        let mut avail_kb = None;
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                total_kb = parse_kb(rest);
            } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                avail_kb = parse_kb(rest);
            }
            if total_kb.is_some() && avail_kb.is_some() {
                break;
            }
        }
        let total = total_kb?;
        let avail = avail_kb?;
        if total == 0 {
            return None;
        }
        Some(1.0 - (avail as f64 / total as f64))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(target_os = "linux")]
fn parse_kb(rest: &str) -> Option<u64> {
    rest.split_whitespace().next()?.parse().ok()
}

/// 1-minute load average from /proc/loadavg.
fn load_average() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        let content = fs::read_to_string("/proc/loadavg").ok()?;
        content.split_whitespace().next()?.parse().ok()
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_in_range() {
        let guard = ResourceGuard::new(0.85, 0.95);
        let snap = guard.snapshot();
        assert!((0.0..=1.0).contains(&snap.used_memory_fraction));
        assert!(snap.cpu_load >= 0.0);
    }

    #[test]
    fn test_impossible_threshold_always_allows() {
        let guard = ResourceGuard::new(1.0, 1.0);
        assert!(guard.allow_load());
        assert!(guard.allow_enqueue());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_zero_threshold_blocks_on_linux() {
        // Any running system uses some memory
        let guard = ResourceGuard::new(0.0, 0.0);
        assert!(!guard.allow_load());
        assert!(!guard.allow_enqueue());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_rss_nonzero_on_linux() {
        let guard = ResourceGuard::new(0.85, 0.95);
        assert!(guard.rss_bytes() > 0);
    }

    #[test]
    fn test_apply_nice() {
        let guard = ResourceGuard::new(0.85, 0.95);
        #[cfg(target_os = "linux")]
        {
            // Raising niceness never needs privileges; may still fail at max
            let _ = guard.apply_nice(19);
        }
        #[cfg(not(target_os = "linux"))]
        {
            assert!(!guard.apply_nice(10));
        }
    }
}
