//! Cleanup Handler: prunes installed versions and artifacts under an
//! aggregated multi-dimensional retention policy. Grounded in the
//! family/owner-directory-walk-then-prune-empty-parents shape used by a
//! skills installer elsewhere in this lineage, generalized here from
//! owner/repo pairs to family/version pairs.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use kraken_agent_domain::types::{CleanupTask, RetentionPolicy};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct EffectivePolicy {
    retain_deployed_versions: u64,
    retain_days: i64,
}

fn aggregate(policies: &[RetentionPolicy]) -> Option<EffectivePolicy> {
    let active: Vec<&RetentionPolicy> = policies.iter().filter(|p| p.enabled).collect();
    if active.is_empty() {
        return None;
    }
    let retain_deployed_versions = active.iter().map(|p| p.retain_deployed_versions.max(0) as u64).max().unwrap_or(0);
    let retain_days = active.iter().map(|p| p.retain_days.max(0)).max().unwrap_or(0);
    Some(EffectivePolicy { retain_deployed_versions, retain_days })
}

struct VersionDir {
    path: PathBuf,
    modified: SystemTime,
}

fn list_version_dirs(family_dir: &Path) -> Vec<VersionDir> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(family_dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let modified = entry.metadata().and_then(|m| m.modified()).unwrap_or(SystemTime::UNIX_EPOCH);
        out.push(VersionDir { path, modified });
    }
    out.sort_by(|a, b| b.modified.cmp(&a.modified));
    out
}

fn list_family_dirs(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    entries.flatten().map(|e| e.path()).filter(|p| p.is_dir()).collect()
}

fn is_dir_empty(path: &Path) -> bool {
    std::fs::read_dir(path).map(|mut it| it.next().is_none()).unwrap_or(false)
}

fn clear_readonly_best_effort(path: &Path) {
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut perms = metadata.permissions();
        if perms.readonly() {
            perms.set_readonly(false);
            let _ = std::fs::set_permissions(path, perms);
        }
    }
}

fn prune_family(family_dir: &Path, policy: EffectivePolicy, cutoff: DateTime<Utc>) {
    let versions = list_version_dirs(family_dir);
    let keep_by_count: std::collections::HashSet<PathBuf> =
        versions.iter().take(policy.retain_deployed_versions as usize).map(|v| v.path.clone()).collect();

    for version in &versions {
        let modified: DateTime<Utc> = version.modified.into();
        let keep = keep_by_count.contains(&version.path) || modified >= cutoff;
        if keep {
            continue;
        }
        clear_readonly_best_effort(&version.path);
        if let Err(e) = std::fs::remove_dir_all(&version.path) {
            tracing::warn!(path = %version.path.display(), error = %e, "cleanup: failed to remove version directory");
        }
    }

    if is_dir_empty(family_dir) {
        let _ = std::fs::remove_dir(family_dir);
    }
}

fn prune_root(agent_root: &Path, policy: EffectivePolicy, cutoff: DateTime<Utc>) {
    for family_dir in list_family_dirs(agent_root) {
        prune_family(&family_dir, policy, cutoff);
    }
    if is_dir_empty(agent_root) {
        let _ = std::fs::remove_dir(agent_root);
    }
}

/// Runs cleanup for `agent_id` against `artifacts_root` and
/// `installations_root`. Failures at any level are logged and do not
/// abort sibling work.
pub fn handle_cleanup(task: &CleanupTask, agent_id: Uuid, artifacts_root: &Path, installations_root: &Path) {
    let Some(policy) = aggregate(&task.retention_policies) else {
        return;
    };
    let cutoff = Utc::now() - chrono::Duration::days(policy.retain_days);

    prune_root(&artifacts_root.join(agent_id.to_string()), policy, cutoff);
    prune_root(&installations_root.join(agent_id.to_string()), policy, cutoff);
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::fs;

    fn make_version_dir(family_dir: &Path, name: &str, age_days: i64) {
        let dir = family_dir.join(name);
        fs::create_dir_all(&dir).unwrap();
        let mtime = FileTime::from_system_time(SystemTime::now() - std::time::Duration::from_secs((age_days * 86_400) as u64));
        filetime::set_file_mtime(&dir, mtime).unwrap();
    }

    #[test]
    fn aggregate_takes_max_across_enabled_policies() {
        let policies = vec![
            RetentionPolicy { enabled: true, environment: None, retain_deployed_versions: 2, retain_days: 0 },
            RetentionPolicy { enabled: true, environment: None, retain_deployed_versions: 0, retain_days: 7 },
        ];
        let effective = aggregate(&policies).unwrap();
        assert_eq!(effective.retain_deployed_versions, 2);
        assert_eq!(effective.retain_days, 7);
    }

    #[test]
    fn aggregate_ignores_disabled_policies() {
        let policies = vec![RetentionPolicy { enabled: false, environment: None, retain_deployed_versions: 100, retain_days: 100 }];
        assert!(aggregate(&policies).is_none());
    }

    #[test]
    fn aggregate_treats_negative_as_zero() {
        let policies = vec![RetentionPolicy { enabled: true, environment: None, retain_deployed_versions: -5, retain_days: -1 }];
        let effective = aggregate(&policies).unwrap();
        assert_eq!(effective.retain_deployed_versions, 0);
        assert_eq!(effective.retain_days, 0);
    }

    #[test]
    fn keeps_union_of_topk_and_recency_deletes_rest() {
        let dir = tempfile::tempdir().unwrap();
        let agent_id = Uuid::new_v4();
        let family_dir = dir.path().join(agent_id.to_string()).join("myapp");
        fs::create_dir_all(&family_dir).unwrap();
        make_version_dir(&family_dir, "d1", 1);
        make_version_dir(&family_dir, "d5", 5);
        make_version_dir(&family_dir, "d10", 10);
        make_version_dir(&family_dir, "d30", 30);

        let task = CleanupTask {
            retention_policies: vec![
                RetentionPolicy { enabled: true, environment: None, retain_deployed_versions: 2, retain_days: 0 },
                RetentionPolicy { enabled: true, environment: None, retain_deployed_versions: 0, retain_days: 7 },
            ],
        };
        handle_cleanup(&task, agent_id, dir.path(), dir.path().join("unused-installations").as_path());

        assert!(family_dir.join("d1").exists());
        assert!(family_dir.join("d5").exists());
        assert!(!family_dir.join("d10").exists());
        assert!(!family_dir.join("d30").exists());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let agent_id = Uuid::new_v4();
        let family_dir = dir.path().join(agent_id.to_string()).join("myapp");
        fs::create_dir_all(&family_dir).unwrap();
        make_version_dir(&family_dir, "d1", 1);
        make_version_dir(&family_dir, "d30", 30);

        let task = CleanupTask {
            retention_policies: vec![RetentionPolicy { enabled: true, environment: None, retain_deployed_versions: 1, retain_days: 0 }],
        };
        handle_cleanup(&task, agent_id, dir.path(), dir.path().join("unused-installations").as_path());
        let after_first: Vec<_> = fs::read_dir(&family_dir).unwrap().collect();
        handle_cleanup(&task, agent_id, dir.path(), dir.path().join("unused-installations").as_path());
        let after_second: Vec<_> = fs::read_dir(&family_dir).unwrap().collect();
        assert_eq!(after_first.len(), after_second.len());
    }

    #[test]
    fn no_enabled_policies_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let agent_id = Uuid::new_v4();
        let family_dir = dir.path().join(agent_id.to_string()).join("myapp");
        fs::create_dir_all(&family_dir).unwrap();
        make_version_dir(&family_dir, "d1", 1);

        let task = CleanupTask { retention_policies: vec![] };
        handle_cleanup(&task, agent_id, dir.path(), dir.path().join("unused-installations").as_path());
        assert!(family_dir.join("d1").exists());
    }

    #[test]
    fn empty_family_and_root_dirs_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let agent_id = Uuid::new_v4();
        let family_dir = dir.path().join(agent_id.to_string()).join("myapp");
        fs::create_dir_all(&family_dir).unwrap();
        make_version_dir(&family_dir, "d30", 30);

        let task = CleanupTask {
            retention_policies: vec![RetentionPolicy { enabled: true, environment: None, retain_deployed_versions: 0, retain_days: 0 }],
        };
        handle_cleanup(&task, agent_id, dir.path(), dir.path().join("unused-installations").as_path());
        assert!(!family_dir.exists());
        assert!(!dir.path().join(agent_id.to_string()).exists());
    }
}
