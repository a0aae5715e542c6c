//! Host capacity probe.
//!
//! All controller processes share the host the scheduler runs on; its vCPU
//! count and memory size are measured once and turned into slot budgets.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostResources {
    pub cpus: u32,
    pub memory_bytes: u64,
}

impl HostResources {
    pub fn new(cpus: u32, memory_bytes: u64) -> Self {
        Self { cpus, memory_bytes }
    }

    pub fn measure() -> Self {
        Self {
            cpus: get_cpu_count(),
            memory_bytes: get_total_memory(),
        }
    }

    /// Replace measured values with configured ones.
    pub fn with_overrides(self, cpus: Option<u32>, memory_bytes: Option<u64>) -> Self {
        Self {
            cpus: cpus.unwrap_or(self.cpus),
            memory_bytes: memory_bytes.unwrap_or(self.memory_bytes),
        }
    }
}

const FALLBACK_MEMORY_BYTES: u64 = 8 * 1024 * 1024 * 1024;

fn get_cpu_count() -> u32 {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as u32;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get() as u32)
        .unwrap_or(1)
}

fn get_total_memory() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Some(total) = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|content| parse_meminfo_total(&content))
        {
            return total;
        }
    }

    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        if page_size > 0 && total_pages > 0 {
            return page_size as u64 * total_pages as u64;
        }
    }

    FALLBACK_MEMORY_BYTES
}

/// Extract `MemTotal` from `/proc/meminfo` content.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo_total(content: &str) -> Option<u64> {
    const KB_TO_BYTES: u64 = 1024;

    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("MemTotal:"), Some(value)) => value.parse::<u64>().ok().map(|kb| kb * KB_TO_BYTES),
            _ => None,
        }
    })
}
