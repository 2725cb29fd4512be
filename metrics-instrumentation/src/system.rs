//! Process statistics read from the operating system.
//!
//! Every function returns `None` when the value is unavailable on the current platform.
use std::time::Duration;

/// Resident set size of the current process, in bytes.
pub fn memory_usage() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        // /proc/self/statm: "size resident shared text lib data dt", in pages.
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident.saturating_mul(page_size()?))
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Number of file descriptors currently open in the current process.
pub fn file_descriptor_count() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let entries = std::fs::read_dir("/proc/self/fd").ok()?;
        // The directory handle used for listing is itself one of the entries.
        let count = entries.filter_map(Result::ok).count() as u64;
        Some(count.saturating_sub(1))
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Soft limit on the number of file descriptors the current process may open.
pub fn max_open_file_descriptors() -> Option<u64> {
    #[cfg(unix)]
    {
        let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        // SAFETY: `limit` is a valid, writable rlimit.
        let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
        if rc != 0 || limit.rlim_cur == libc::RLIM_INFINITY {
            return None;
        }
        Some(limit.rlim_cur as u64)
    }

    #[cfg(not(unix))]
    {
        None
    }
}

/// CPU time consumed by the whole process.
pub fn process_cpu_time() -> Option<Duration> {
    #[cfg(unix)]
    {
        cpu_clock(libc::CLOCK_PROCESS_CPUTIME_ID)
    }

    #[cfg(not(unix))]
    {
        None
    }
}

/// CPU time consumed by the calling thread.
pub fn thread_cpu_time() -> Option<Duration> {
    #[cfg(unix)]
    {
        cpu_clock(libc::CLOCK_THREAD_CPUTIME_ID)
    }

    #[cfg(not(unix))]
    {
        None
    }
}

#[cfg(unix)]
fn cpu_clock(clock: libc::clockid_t) -> Option<Duration> {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `ts` is a valid, writable timespec.
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    if rc != 0 {
        return None;
    }

    let secs = u64::try_from(ts.tv_sec).ok()?;
    let nanos = u32::try_from(ts.tv_nsec).ok()?;
    Some(Duration::new(secs, nanos))
}

#[cfg(target_os = "linux")]
fn page_size() -> Option<u64> {
    // SAFETY: sysconf has no memory safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(size).ok().filter(|size| *size > 0)
}
