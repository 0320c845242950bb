//! Process resident-set sampling.

use std::sync::Arc;

/// Returns the current resident set size in bytes, or `None` when the platform
/// offers no cheap way to read it.
pub type MemoryProbe = Arc<dyn Fn() -> Option<u64> + Send + Sync>;

pub fn process_probe() -> MemoryProbe {
    Arc::new(resident_bytes)
}

#[cfg(target_os = "linux")]
pub fn resident_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    // SAFETY: sysconf has no memory-safety preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = u64::try_from(page_size).ok().filter(|size| *size > 0)?;
    pages.checked_mul(page_size)
}

#[cfg(not(target_os = "linux"))]
pub fn resident_bytes() -> Option<u64> {
    None
}

/// Resident memory observed around one render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryDelta {
    pub before_bytes: Option<u64>,
    pub after_bytes: Option<u64>,
}

impl MemoryDelta {
    /// Growth in bytes. Shrinkage and missing samples count as zero.
    pub fn growth_bytes(&self) -> u64 {
        match (self.before_bytes, self.after_bytes) {
            (Some(before), Some(after)) => after.saturating_sub(before),
            _ => 0,
        }
    }
}
