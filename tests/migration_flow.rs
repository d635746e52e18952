//! End-to-end migration through the full application wiring: JSON config
//! on disk, providers built by the registry, engine state under a
//! temporary directory.

use bytes::Bytes;
use migration::MigrateOptions;
use provider::WriteOptions;
use volshift::{App, AppConfig};

async fn app_with_assets(dir: &std::path::Path, count: usize) -> App {
    let config = format!(
        r#"{{
            "providers": {{
                "old_store": {{ "type": "memory" }},
                "new_store": {{ "type": "memory" }}
            }},
            "source": "old_store",
            "target": "new_store",
            "volume_prefixes": ["assets/"],
            "state_dir": "{}"
        }}"#,
        dir.join("state").display()
    );
    let config_path = dir.join("volshift.json");
    tokio::fs::write(&config_path, config).await.unwrap();

    let app = App::bootstrap(AppConfig::load(&config_path).await.unwrap())
        .await
        .unwrap();
    let source = app.provider("old_store").unwrap();
    for i in 0..count {
        source
            .write(
                &format!("assets/file-{i:02}.jpg"),
                Bytes::from(vec![b'j'; 100 + i]),
                WriteOptions::default(),
            )
            .await
            .unwrap();
    }
    app
}

#[tokio::test]
async fn migrate_then_compare_is_clean() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with_assets(dir.path(), 8).await;

    let report = app.migrate(&MigrateOptions::with_verify()).await.unwrap();
    assert_eq!(report.copied, 8);
    assert_eq!(report.failed, 0);
    assert!(!report.has_failures());

    let comparison = app.compare("assets/").await.unwrap();
    assert!(comparison.is_clean());
    assert_eq!(comparison.matched, 8);
}

#[tokio::test]
async fn second_run_skips_everything() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with_assets(dir.path(), 5).await;

    app.migrate(&MigrateOptions::with_verify()).await.unwrap();
    let opts = MigrateOptions {
        resume: true,
        verify: true,
        ..Default::default()
    };
    let second = app.migrate(&opts).await.unwrap();
    assert_eq!(second.copied, 0);
    assert_eq!(second.skipped, 5);
}

#[tokio::test]
async fn dry_run_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with_assets(dir.path(), 4).await;

    let opts = MigrateOptions {
        dry_run: true,
        verify: true,
        ..Default::default()
    };
    let report = app.migrate(&opts).await.unwrap();
    assert!(report.dry_run);
    assert_eq!(report.copied, 4);

    // Nothing landed at the target and no checkpoint was recorded.
    let comparison = app.compare("").await.unwrap();
    assert_eq!(comparison.only_in_source.len(), 4);
    assert!(app.status(None).await.is_err());
}

#[tokio::test]
async fn filter_narrows_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with_assets(dir.path(), 3).await;
    let source = app.provider("old_store").unwrap();
    source
        .write("assets/report.pdf", Bytes::from_static(b"pdf"), WriteOptions::default())
        .await
        .unwrap();

    let opts = MigrateOptions {
        filter: Some(".pdf".to_string()),
        verify: true,
        ..Default::default()
    };
    let report = app.migrate(&opts).await.unwrap();
    assert_eq!(report.total, 1);
    assert_eq!(report.copied, 1);
}

#[tokio::test]
async fn rollback_restores_the_target() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with_assets(dir.path(), 6).await;

    let report = app.migrate(&MigrateOptions::with_verify()).await.unwrap();
    let rollback = app.rollback(&report.checkpoint_id).await.unwrap();
    assert_eq!(rollback.reversed, 6);
    assert!(rollback.failures.is_empty());

    let comparison = app.compare("").await.unwrap();
    assert_eq!(comparison.only_in_source.len(), 6);
    assert_eq!(comparison.matched, 0);
}

#[tokio::test]
async fn cleanup_purges_finished_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with_assets(dir.path(), 2).await;

    let report = app.migrate(&MigrateOptions::with_verify()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // Retention window of zero hours makes everything terminal eligible.
    let cleanup = app.cleanup(Some(0), false).await.unwrap();
    assert_eq!(cleanup.purged, vec![report.checkpoint_id.clone()]);
    assert!(app.status(Some(&report.checkpoint_id)).await.is_err());
}
