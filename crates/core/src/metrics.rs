//! Point-in-time host metrics. Every function here either succeeds or
//! returns the documented sentinel (`0`/`0.0` for numbers, `"Unknown"`
//! for strings) rather than propagating an error — the polling loop must
//! never fail a cycle because a metrics probe couldn't read `/proc`.

use std::time::{Duration, Instant};

use sysinfo::{Disks, Pid, System};

const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, serde::Serialize)]
pub struct Metrics {
    pub cpu_usage_percent: f32,
    pub ram_usage_mb: u64,
    pub ram_total_mb: u64,
    pub disk_total_gb: f64,
    pub disk_free_gb: f64,
    pub agent_uptime: String,
    pub ip: String,
    pub os: String,
}

/// Samples CPU over [`CPU_SAMPLE_WINDOW`] (an async suspension point), then
/// takes every other reading instantaneously.
pub async fn sample(process_start: Instant) -> Metrics {
    Metrics {
        cpu_usage_percent: cpu_usage_percent().await,
        ram_usage_mb: ram_usage_mb(),
        ram_total_mb: ram_total_mb(),
        disk_total_gb: disk_total_gb(),
        disk_free_gb: disk_free_gb(),
        agent_uptime: format_uptime(process_start.elapsed()),
        ip: first_non_loopback_ipv4(),
        os: os_string(),
    }
}

async fn cpu_usage_percent() -> f32 {
    let pid = Pid::from_u32(std::process::id());
    let mut sys = System::new();
    sys.refresh_process(pid);
    tokio::time::sleep(CPU_SAMPLE_WINDOW).await;
    sys.refresh_process(pid);

    let Some(process) = sys.process(pid) else {
        return 0.0;
    };
    let cores = sys.cpus().len().max(1) as f32;
    let raw = process.cpu_usage() / cores;
    (raw * 10.0).round() / 10.0
}

fn ram_usage_mb() -> u64 {
    let pid = Pid::from_u32(std::process::id());
    let mut sys = System::new();
    sys.refresh_process(pid);
    sys.process(pid).map(|p| p.memory() / 1024 / 1024).unwrap_or(0)
}

fn ram_total_mb() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory() / 1024 / 1024
}

fn disk_total_gb() -> f64 {
    with_cwd_disk(|disk| disk.total_space() as f64 / 1_000_000_000.0).unwrap_or(0.0)
}

fn disk_free_gb() -> f64 {
    with_cwd_disk(|disk| disk.available_space() as f64 / 1_000_000_000.0).unwrap_or(0.0)
}

fn with_cwd_disk<T>(f: impl Fn(&sysinfo::Disk) -> T) -> Option<T> {
    let cwd = std::env::current_dir().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| cwd.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(f)
}

fn format_uptime(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;
    format!("{days:02}:{hours:02}:{minutes:02}:{seconds:02}")
}

fn first_non_loopback_ipv4() -> String {
    match local_ip_address::local_ip() {
        Ok(std::net::IpAddr::V4(v4)) if !v4.is_loopback() => v4.to_string(),
        _ => "Unknown".to_string(),
    }
}

fn os_string() -> String {
    System::long_os_version().unwrap_or_else(|| "Unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_uptime_zero() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "00:00:00:00");
    }

    #[test]
    fn format_uptime_one_day_and_change() {
        let elapsed = Duration::from_secs(86_400 + 3_600 * 2 + 60 * 5 + 9);
        assert_eq!(format_uptime(elapsed), "01:02:05:09");
    }

    #[tokio::test]
    async fn sample_returns_values_in_documented_ranges() {
        let metrics = sample(Instant::now()).await;
        assert!(metrics.cpu_usage_percent >= 0.0 && metrics.cpu_usage_percent <= 100.0);
        assert!(metrics.agent_uptime.len() == "dd:hh:mm:ss".len());
        assert_eq!(metrics.agent_uptime.matches(':').count(), 3);
    }
}
