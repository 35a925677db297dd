//! GetNodeInfo — live host telemetry, sampled at call time.

use std::time::Duration;

use sysinfo::{Disks, System};

use nacc_protocol::NodeInfo;

use crate::root::RootContext;

/// CPU usage needs two samples; this is the spacing between them.
const CPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

/// Sample the host and assemble a [`NodeInfo`] snapshot. Nothing is cached
/// on the node; the orchestrator decides how long a snapshot stays fresh.
pub async fn node_info(ctx: &RootContext) -> NodeInfo {
    let mut sys = System::new();
    sys.refresh_cpu_usage();
    tokio::time::sleep(CPU_SAMPLE_INTERVAL).await;
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_percent = sys.global_cpu_info().cpu_usage();
    let memory_percent = if sys.total_memory() > 0 {
        (sys.used_memory() as f32 / sys.total_memory() as f32) * 100.0
    } else {
        0.0
    };

    NodeInfo {
        node_id: ctx.node_id().to_string(),
        tags: ctx.tags().to_vec(),
        allowed_commands: ctx.allowed_commands(),
        os: format!(
            "{} {}",
            System::name().unwrap_or_else(|| "unknown".into()),
            System::os_version().unwrap_or_default()
        )
        .trim()
        .to_string(),
        arch: std::env::consts::ARCH.to_string(),
        hostname: System::host_name().unwrap_or_else(|| "unknown".into()),
        cpu_percent,
        memory_percent,
        disk_percent: disk_percent_for_root(ctx),
        uptime_seconds: System::uptime(),
    }
}

/// Usage of the disk mounted closest to the node root.
fn disk_percent_for_root(ctx: &RootContext) -> f32 {
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(usize, f32)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if !ctx.root().starts_with(mount) {
            continue;
        }
        let depth = mount.components().count();
        let total = disk.total_space();
        if total == 0 {
            continue;
        }
        let used = total.saturating_sub(disk.available_space());
        let percent = (used as f32 / total as f32) * 100.0;
        match best {
            Some((best_depth, _)) if best_depth >= depth => {}
            _ => best = Some((depth, percent)),
        }
    }
    best.map(|(_, p)| p).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn snapshot_echoes_identity_and_samples_metrics() {
        let dir = TempDir::new().unwrap();
        let ctx = RootContext::new(
            "info-test",
            dir.path(),
            vec!["echo".to_string(), "ls".to_string()],
            "/usr/bin:/bin",
            vec!["lab".into()],
            HashMap::new(),
        )
        .unwrap();

        let info = node_info(&ctx).await;

        assert_eq!(info.node_id, "info-test");
        assert_eq!(info.tags, vec!["lab".to_string()]);
        assert_eq!(info.allowed_commands, vec!["echo", "ls"]);
        assert!(!info.os.is_empty());
        assert!(!info.arch.is_empty());
        assert!((0.0..=100.0).contains(&info.memory_percent));
        assert!((0.0..=100.0).contains(&info.disk_percent));
    }

    #[tokio::test]
    async fn back_to_back_snapshots_only_differ_in_metrics() {
        let dir = TempDir::new().unwrap();
        let ctx = RootContext::new(
            "info-test",
            dir.path(),
            Vec::new(),
            "/usr/bin:/bin",
            Vec::new(),
            HashMap::new(),
        )
        .unwrap();

        let a = node_info(&ctx).await;
        let b = node_info(&ctx).await;

        assert_eq!(a.node_id, b.node_id);
        assert_eq!(a.tags, b.tags);
        assert_eq!(a.os, b.os);
        assert_eq!(a.arch, b.arch);
        assert_eq!(a.hostname, b.hostname);
    }
}
