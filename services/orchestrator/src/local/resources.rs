//! Host capacity measurement for the local provider.

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

/// Fallback when the host cannot be measured.
const FALLBACK_TOTAL_MB: u64 = 16 * 1024;
const FALLBACK_AVAILABLE_MB: u64 = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostResources {
    pub cpu_cores: u32,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
}

impl HostResources {
    pub fn measure() -> Self {
        let (total, available) = memory_info();

        Self {
            cpu_cores: cpu_count(),
            total_memory_mb: total / MB,
            available_memory_mb: available / MB,
        }
    }
}

fn cpu_count() -> u32 {
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

/// (total, available) in bytes.
#[cfg(target_os = "linux")]
fn memory_info() -> (u64, u64) {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        let (total, available) = parse_meminfo(&meminfo);
        if total > 0 {
            return (total, available);
        }
    }

    sysconf_memory().unwrap_or((FALLBACK_TOTAL_MB * MB, FALLBACK_AVAILABLE_MB * MB))
}

#[cfg(not(target_os = "linux"))]
fn memory_info() -> (u64, u64) {
    sysconf_memory()
        .map(|(total, _)| (total, total / 2))
        .unwrap_or((FALLBACK_TOTAL_MB * MB, FALLBACK_AVAILABLE_MB * MB))
}

#[cfg(unix)]
fn sysconf_memory() -> Option<(u64, u64)> {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if page_size <= 0 || total_pages <= 0 {
        return None;
    }

    let total = page_size as u64 * total_pages as u64;

    #[cfg(target_os = "linux")]
    let available = {
        let avail_pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };
        if avail_pages > 0 {
            page_size as u64 * avail_pages as u64
        } else {
            total
        }
    };
    #[cfg(not(target_os = "linux"))]
    let available = total;

    Some((total, available))
}

#[cfg(not(unix))]
fn sysconf_memory() -> Option<(u64, u64)> {
    None
}

/// Parse `/proc/meminfo` into (total, available) bytes.
///
/// Kernels without `MemAvailable` fall back to free + buffers + cached.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(content: &str) -> (u64, u64) {
    let mut total = 0;
    let mut available = 0;
    let mut free = 0;
    let mut buffers = 0;
    let mut cached = 0;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value = value.parse::<u64>().unwrap_or(0) * KB;
        match key {
            "MemTotal:" => total = value,
            "MemAvailable:" => available = value,
            "MemFree:" => free = value,
            "Buffers:" => buffers = value,
            "Cached:" => cached = value,
            _ => {}
        }
    }

    if available == 0 {
        available = free + buffers + cached;
    }

    (total, available)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measure_resources() {
        let resources = HostResources::measure();
        assert!(resources.cpu_cores > 0);
        assert!(resources.total_memory_mb > 0);
        assert!(resources.available_memory_mb <= resources.total_memory_mb);
    }

    #[test]
    fn test_parse_meminfo() {
        let sample = r#"MemTotal:       16384000 kB
MemFree:         1234567 kB
MemAvailable:    8000000 kB
Buffers:          123456 kB
Cached:          2345678 kB
"#;
        let (total, available) = parse_meminfo(sample);
        assert_eq!(total, 16384000 * 1024);
        assert_eq!(available, 8000000 * 1024);
    }

    #[test]
    fn test_parse_meminfo_no_available() {
        let sample = r#"MemTotal:       16384000 kB
MemFree:         1000000 kB
Buffers:          500000 kB
Cached:          2000000 kB
"#;
        let (total, available) = parse_meminfo(sample);
        assert_eq!(total, 16384000 * 1024);
        assert_eq!(available, (1000000 + 500000 + 2000000) * 1024);
    }

    #[test]
    fn test_parse_meminfo_ignores_garbage() {
        let (total, available) = parse_meminfo("garbage\nMemTotal: abc kB\n");
        assert_eq!((total, available), (0, 0));
    }
}
