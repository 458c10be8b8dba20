use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::store::{ObjectMeta, ObjectStore};

/// Per-job output lives under `jobs/{auth_name}/{uid}/`.
pub const JOBS_PREFIX: &str = "jobs/";
/// Activity batches, one independent object each.
pub const ACTIVITY_PREFIX: &str = "logs/";

/// The `jobs/{auth_name}/{uid}/` directory a key belongs to, or the key
/// itself when it sits outside that layout.
fn job_dir(key: &str) -> &str {
    let mut slashes = key.match_indices('/').map(|(i, _)| i);
    match slashes.nth(2) {
        Some(end) => &key[..=end],
        None => key,
    }
}

/// Delete order inside one job: the completion pair first, so a reader
/// never sees a finished job whose log is already gone.
fn delete_rank(key: &str) -> u8 {
    if key.ends_with("/size") {
        0
    } else if key.ends_with("/exit") {
        1
    } else {
        2
    }
}

/// Group job objects by job directory. A job expires only when its newest
/// object is older than the cutoff, and then it goes as a whole.
fn expired_jobs(objects: Vec<ObjectMeta>, cutoff: DateTime<Utc>) -> Vec<Vec<String>> {
    let mut jobs: BTreeMap<String, (DateTime<Utc>, Vec<String>)> = BTreeMap::new();
    for meta in objects {
        let entry = jobs
            .entry(job_dir(&meta.key).to_string())
            .or_insert((meta.modified, Vec::new()));
        entry.0 = entry.0.max(meta.modified);
        entry.1.push(meta.key);
    }
    jobs.into_values()
        .filter(|(newest, _)| *newest < cutoff)
        .map(|(_, mut keys)| {
            keys.sort_by_key(|k| delete_rank(k));
            keys
        })
        .collect()
}

/// Delete expired jobs and activity batches. Returns the number of objects
/// removed.
pub async fn sweep_expired(store: &dyn ObjectStore, cutoff: DateTime<Utc>) -> Result<usize> {
    let mut removed = 0;

    let jobs = expired_jobs(store.list(JOBS_PREFIX).await?, cutoff);
    let expired_jobs = jobs.len();
    for keys in jobs {
        for key in keys {
            store.delete(&key).await?;
            removed += 1;
        }
    }

    for meta in store.list(ACTIVITY_PREFIX).await? {
        if meta.modified < cutoff {
            store.delete(&meta.key).await?;
            removed += 1;
        }
    }

    tracing::info!(removed, expired_jobs, cutoff = %cutoff, "Swept expired objects");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use bytes::Bytes;
    use chrono::Duration;

    #[tokio::test]
    async fn removes_only_old_objects_under_swept_prefixes() {
        let store = MemoryStore::new();
        let old = Utc::now() - Duration::hours(48);
        for key in ["jobs/a/1.x/log.txt", "logs/1.x.000", "jobs/a/2.y/log.txt", "keep/old"] {
            store.put(key, Bytes::from_static(b"x")).await.unwrap();
        }
        store.set_modified("jobs/a/1.x/log.txt", old).await;
        store.set_modified("logs/1.x.000", old).await;
        store.set_modified("keep/old", old).await;

        let removed = sweep_expired(&store, Utc::now() - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store.get("jobs/a/2.y/log.txt").await.is_ok());
        assert!(store.get("keep/old").await.is_ok());
        assert!(store.get("logs/1.x.000").await.is_err());
    }

    #[tokio::test]
    async fn job_with_a_recent_object_is_kept_whole() {
        let store = MemoryStore::new();
        let old = Utc::now() - Duration::hours(48);
        for key in ["jobs/a/1.x/log.txt", "jobs/a/1.x/exit", "jobs/a/1.x/size"] {
            store.put(key, Bytes::from_static(b"1")).await.unwrap();
        }
        // The log is old but the completion pair was written recently.
        store.set_modified("jobs/a/1.x/log.txt", old).await;

        let removed = sweep_expired(&store, Utc::now() - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert!(store.get("jobs/a/1.x/log.txt").await.is_ok());

        for key in ["jobs/a/1.x/exit", "jobs/a/1.x/size"] {
            store.set_modified(key, old).await;
        }
        let removed = sweep_expired(&store, Utc::now() - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert!(store.list("jobs/").await.unwrap().is_empty());
    }

    #[test]
    fn completion_pair_is_deleted_before_log() {
        let now = Utc::now();
        let meta = |key: &str| ObjectMeta {
            key: key.to_string(),
            size: 1,
            modified: now - Duration::hours(48),
        };
        let jobs = expired_jobs(
            vec![
                meta("jobs/a/1.x/exit"),
                meta("jobs/a/1.x/log.txt"),
                meta("jobs/a/1.x/size"),
                meta("jobs/b/2.y/log.txt"),
            ],
            now,
        );
        assert_eq!(
            jobs,
            vec![
                vec!["jobs/a/1.x/size", "jobs/a/1.x/exit", "jobs/a/1.x/log.txt"],
                vec!["jobs/b/2.y/log.txt"],
            ]
        );
    }

    #[test]
    fn job_dir_groups_by_uid() {
        assert_eq!(job_dir("jobs/alice:ab/1.x/log.txt"), "jobs/alice:ab/1.x/");
        assert_eq!(job_dir("jobs/stray"), "jobs/stray");
    }
}
