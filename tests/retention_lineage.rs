//! Retention reaper behaviour: lineage-safe deletion, idempotence, and
//! orphan cleanup.

mod common;

use chrono::{TimeZone, Utc};
use common::{test_env, TestEnv};
use snapsend::config::RetentionConfig;
use snapsend::retention::RetentionReaper;
use snapsend::snapshot::SnapshotSource;
use snapsend::store::{ArchiveKind, NewArchive};

fn reaper(env: &TestEnv, retention: RetentionConfig) -> RetentionReaper {
    RetentionReaper::new(
        env.remote.clone(),
        env.store.clone(),
        env.source.clone(),
        env.client_prefix(),
        vec!["root".to_string(), "home".to_string()],
        retention,
    )
}

/// Seed one committed archive: a remote file with a valid header plus the
/// matching store row.
async fn seed_archive(
    env: &TestEnv,
    subvolume: &str,
    ts: &str,
    kind: ArchiveKind,
    parent: Option<&str>,
) -> String {
    let month = &ts[..6];
    let filename = match parent {
        Some(parent) => format!("{subvolume}_{ts}__from_{parent}.zst.enc"),
        None => format!("{subvolume}_{ts}.zst.enc"),
    };
    let remote_path = format!(
        "{}/{}/{}/{}",
        env.client_prefix(),
        month,
        kind.as_str(),
        filename
    );

    let mut data = snapsend::stages::crypt::MAGIC.to_vec();
    data.extend_from_slice(b"opaque archive bytes");
    let mtime = snapsend::snapshot::parse_timestamp(ts).unwrap().timestamp();
    env.remote.put_file(&remote_path, data.clone(), mtime);

    env.store
        .record_commit(NewArchive {
            subvolume: subvolume.to_string(),
            snapshot_ts: ts.to_string(),
            kind,
            parent_ts: parent.map(|p| p.to_string()),
            month_bucket: month.to_string(),
            remote_path: remote_path.clone(),
            local_path: format!("/.snapshots/{subvolume}-{ts}"),
            size_bytes: data.len() as i64,
            digest: "seeded".to_string(),
            compress_algo: "zstd".to_string(),
        })
        .await
        .expect("seed commit");
    remote_path
}

fn fixed_now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 20, 12, 0, 0).unwrap()
}

/// Expired incrementals are deleted only when nothing committed depends on
/// them; a link another archive still builds on is skipped.
#[tokio::test]
async fn incremental_reaping_respects_lineage() {
    let env = test_env();
    let retention = RetentionConfig {
        months_to_keep: 6,
        daily_incremental_days: 3,
        local_snapshot_days: 7,
    };

    // root: full + 5 expired incrementals, nothing newer depends on them
    seed_archive(&env, "root", "20260610-020000", ArchiveKind::Full, None).await;
    let mut parent = "20260610-020000".to_string();
    for d in 11..=15 {
        let ts = format!("202606{d}-020000");
        seed_archive(&env, "root", &ts, ArchiveKind::Incremental, Some(&parent)).await;
        parent = ts;
    }

    // home: an expired incremental that a fresh one still depends on
    seed_archive(&env, "home", "20260601-020000", ArchiveKind::Full, None).await;
    let old_link =
        seed_archive(&env, "home", "20260602-020000", ArchiveKind::Incremental, Some("20260601-020000")).await;
    let fresh_link =
        seed_archive(&env, "home", "20260619-020000", ArchiveKind::Incremental, Some("20260602-020000")).await;

    let reaper = reaper(&env, retention);
    let deleted = reaper.reap_remote_incrementals(fixed_now()).await.unwrap();

    // The root chain unwinds from the tip; the protected home link stays
    assert_eq!(deleted, 5);
    assert!(env.store.latest_committed_full("root").await.unwrap().is_some());
    assert_eq!(
        env.store
            .latest_committed("root")
            .await
            .unwrap()
            .unwrap()
            .kind,
        ArchiveKind::Full
    );
    assert!(env.remote.contains(&old_link), "protected link was deleted");
    assert!(env.remote.contains(&fresh_link));

    // Every surviving incremental still has a committed parent
    for record in env.store.list_committed(None).await.unwrap() {
        if let Some(parent_ts) = &record.parent_ts {
            assert!(
                env.store
                    .find_by_ts(&record.subvolume, parent_ts)
                    .await
                    .unwrap()
                    .is_some(),
                "dangling parent for {} at {}",
                record.subvolume,
                record.snapshot_ts
            );
        }
    }

    // Idempotence: a second pass deletes nothing
    let deleted_again = reaper.reap_remote_incrementals(fixed_now()).await.unwrap();
    assert_eq!(deleted_again, 0);
}

#[tokio::test]
async fn month_bucket_reaping_skips_cross_month_parents() {
    let env = test_env();
    let retention = RetentionConfig {
        months_to_keep: 1,
        daily_incremental_days: 30,
        local_snapshot_days: 7,
    };

    // 202601: standalone full, safe to drop
    let old_full = seed_archive(&env, "home", "20260110-020000", ArchiveKind::Full, None).await;
    // 202603 full is the parent of a 202604 incremental: bucket must survive
    let pinned_full = seed_archive(&env, "root", "20260310-020000", ArchiveKind::Full, None).await;
    seed_archive(&env, "root", "20260410-020000", ArchiveKind::Incremental, Some("20260310-020000")).await;

    let reaper = reaper(&env, retention);
    let deleted = reaper.reap_remote_months().await.unwrap();

    assert_eq!(deleted, vec!["202601".to_string()]);
    assert!(!env.remote.contains(&old_full));
    assert!(env.store.latest_committed("home").await.unwrap().is_none());
    assert!(env.remote.contains(&pinned_full), "lineage-bearing month was deleted");
    assert!(env.store.latest_committed_full("root").await.unwrap().is_some());

    // Second pass: 202603 is still protected, nothing else to do
    assert!(reaper.reap_remote_months().await.unwrap().is_empty());
}

#[tokio::test]
async fn local_snapshot_reaping_keeps_pinned_and_grace_snapshots() {
    let env = test_env();
    let retention = RetentionConfig {
        months_to_keep: 6,
        daily_incremental_days: 30,
        local_snapshot_days: 7,
    };
    let spec = env.config.subvolumes[0].clone();

    // Chain full 0601 ← incr 0603 ← incr 0605. The two parents are pinned
    // (no newer full has committed); the tip is old, committed, and has no
    // dependents, so only it is reaped.
    env.source.create_snapshot(&spec, "20260601-020000").await.unwrap();
    seed_archive(&env, "root", "20260601-020000", ArchiveKind::Full, None).await;
    env.source.create_snapshot(&spec, "20260603-020000").await.unwrap();
    seed_archive(&env, "root", "20260603-020000", ArchiveKind::Incremental, Some("20260601-020000")).await;
    env.source.create_snapshot(&spec, "20260605-020000").await.unwrap();
    seed_archive(&env, "root", "20260605-020000", ArchiveKind::Incremental, Some("20260603-020000")).await;

    // Old but never committed: inside the doubled grace window
    env.source.create_snapshot(&spec, "20260611-020000").await.unwrap();

    // Fresh: untouched
    env.source.create_snapshot(&spec, "20260619-020000").await.unwrap();

    let reaper = reaper(&env, retention);
    let deleted = reaper.reap_local_snapshots(fixed_now()).await.unwrap();
    assert_eq!(deleted, 1);

    let remaining = env.source.snapshot_timestamps("root");
    assert_eq!(
        remaining,
        vec![
            "20260601-020000".to_string(),
            "20260603-020000".to_string(),
            "20260611-020000".to_string(),
            "20260619-020000".to_string(),
        ]
    );

    // Uncommitted snapshot past double retention is given up on
    let late = Utc.with_ymd_and_hms(2026, 6, 27, 12, 0, 0).unwrap();
    let deleted = reaper.reap_local_snapshots(late).await.unwrap();
    assert!(deleted >= 1);
    assert!(!env
        .source
        .snapshot_timestamps("root")
        .contains(&"20260611-020000".to_string()));
}

#[tokio::test]
async fn orphan_cleanup_removes_stale_unknown_files() {
    let env = test_env();
    let retention = RetentionConfig::default();

    let committed = seed_archive(&env, "root", "20260610-020000", ArchiveKind::Full, None).await;

    let now = fixed_now();
    let stale_orphan = format!("{}/202606/full/root_20260608-020000.zst.enc", env.client_prefix());
    let stale_part = format!("{}/202606/full/root_20260609-020000.zst.enc.part", env.client_prefix());
    let fresh_orphan = format!("{}/202606/full/root_20260620-110000.zst.enc", env.client_prefix());
    env.remote.put_file(&stale_orphan, vec![1, 2, 3], now.timestamp() - 7200);
    env.remote.put_file(&stale_part, vec![4, 5], now.timestamp() - 7200);
    env.remote.put_file(&fresh_orphan, vec![6], now.timestamp() - 60);

    let reaper = reaper(&env, retention);
    let deleted = reaper.cleanup_orphans(now).await.unwrap();
    assert_eq!(deleted, 2);

    assert!(env.remote.contains(&committed));
    assert!(!env.remote.contains(&stale_orphan));
    assert!(!env.remote.contains(&stale_part));
    assert!(env.remote.contains(&fresh_orphan), "in-flight upload was deleted");

    // Idempotent
    assert_eq!(reaper.cleanup_orphans(now).await.unwrap(), 0);
}
