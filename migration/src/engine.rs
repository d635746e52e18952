use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use provider::{copy_object, ProviderError, StorageProvider};

use crate::catalog::{AssetCatalog, AssetRecord};
use crate::changelog::{ChangeLog, ChangeLogEntry, CopyOutcome};
use crate::checkpoint::{CheckpointStatus, CheckpointStore, MigrationCheckpoint, Phase};
use crate::lock::LockStore;
use crate::{MigrationError, Result};

/// Per-asset retry policy. `attempt_timeout` bounds each provider call;
/// the backoff schedule sits between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with up to 50% jitter, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        let jitter_ms = exp.as_millis() as u64 / 2;
        if jitter_ms == 0 {
            return exp;
        }
        exp + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    /// Pure read-only simulation: decision logic runs, nothing is
    /// written and no checkpoint state is persisted.
    pub dry_run: bool,
    pub resume: bool,
    pub checkpoint_id: Option<String>,
    /// Operator escape hatch, not a default.
    pub skip_lock: bool,
    pub verify: bool,
    pub filter: Option<String>,
}

impl MigrateOptions {
    pub fn with_verify() -> Self {
        Self {
            verify: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub checkpoint_id: String,
    pub phase: Phase,
    pub total: usize,
    pub copied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub dry_run: bool,
}

impl MigrationReport {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

#[derive(Debug, Clone)]
pub struct RollbackReport {
    pub checkpoint_id: String,
    pub reversed: usize,
    pub already_absent: usize,
    pub failures: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct CleanupReport {
    pub purged: Vec<String>,
    pub locks_cleared: usize,
}

/// Resumable, at-least-once batch copy pipeline. Progress is persisted
/// at batch boundaries; an interrupted run loses at most one batch of
/// re-validation, never completed work.
pub struct MigrationEngine {
    source: Arc<dyn StorageProvider>,
    target: Arc<dyn StorageProvider>,
    catalog: Arc<dyn AssetCatalog>,
    checkpoints: CheckpointStore,
    locks: LockStore,
    retry: RetryPolicy,
}

impl MigrationEngine {
    pub fn new(
        source: Arc<dyn StorageProvider>,
        target: Arc<dyn StorageProvider>,
        catalog: Arc<dyn AssetCatalog>,
        checkpoints: CheckpointStore,
        locks: LockStore,
    ) -> Self {
        Self {
            source,
            target,
            catalog,
            checkpoints,
            locks,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn scope(&self) -> String {
        format!("{}->{}", self.source.handle(), self.target.handle())
    }

    /// Negotiated from both sides: the more constrained provider governs.
    fn batch_size(&self) -> usize {
        self.source
            .capabilities()
            .optimal_batch_size
            .min(self.target.capabilities().optimal_batch_size)
            .max(1)
    }

    pub async fn run(&self, opts: &MigrateOptions) -> Result<MigrationReport> {
        let scope = self.scope();
        let mut checkpoint = self.resolve_checkpoint(opts).await?;

        let lock = if opts.dry_run {
            None
        } else if opts.skip_lock {
            warn!(scope, "migration lock bypassed by operator");
            None
        } else {
            Some(self.locks.acquire(&scope).await?)
        };

        let outcome = self.drive(&mut checkpoint, opts).await;

        if let Some(lock) = lock {
            if let Err(e) = self.locks.release(&lock).await {
                warn!(scope, "failed to release migration lock: {e}");
            }
        }

        match outcome {
            Ok(report) => Ok(report),
            Err(e) => {
                if !opts.dry_run {
                    checkpoint.phase = Phase::Failed;
                    if let Err(save_err) = self.checkpoints.save(&mut checkpoint).await {
                        error!(
                            checkpoint = %checkpoint.checkpoint_id,
                            "could not persist failed checkpoint: {save_err}"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn resolve_checkpoint(&self, opts: &MigrateOptions) -> Result<MigrationCheckpoint> {
        let scope = self.scope();
        if !opts.resume {
            if opts.checkpoint_id.is_some() {
                return Err(MigrationError::InvalidState(
                    "a checkpoint id only makes sense together with resume".to_string(),
                ));
            }
            return Ok(MigrationCheckpoint::new(
                self.source.handle(),
                self.target.handle(),
            ));
        }

        let existing = match &opts.checkpoint_id {
            Some(id) => Some(self.checkpoints.load(id).await?),
            None => self.checkpoints.load_latest(&scope).await?,
        };
        match existing {
            Some(checkpoint) if checkpoint.scope != scope => Err(MigrationError::InvalidState(
                format!(
                    "checkpoint {} belongs to scope '{}', not '{}'",
                    checkpoint.checkpoint_id, checkpoint.scope, scope
                ),
            )),
            Some(checkpoint) if checkpoint.phase == Phase::Done => {
                // A done checkpoint is superseded, never merged into.
                info!(
                    checkpoint = %checkpoint.checkpoint_id,
                    "previous migration already done; starting a fresh checkpoint"
                );
                Ok(MigrationCheckpoint::new(
                    self.source.handle(),
                    self.target.handle(),
                ))
            }
            Some(checkpoint) => {
                info!(
                    checkpoint = %checkpoint.checkpoint_id,
                    completed = checkpoint.completed.len(),
                    failed = checkpoint.failed.len(),
                    "resuming migration"
                );
                Ok(checkpoint)
            }
            None => Ok(MigrationCheckpoint::new(
                self.source.handle(),
                self.target.handle(),
            )),
        }
    }

    async fn drive(
        &self,
        checkpoint: &mut MigrationCheckpoint,
        opts: &MigrateOptions,
    ) -> Result<MigrationReport> {
        let dry = opts.dry_run;

        checkpoint.phase = Phase::Discovering;
        let assets = self.catalog.discover(opts.filter.as_deref()).await?;
        if checkpoint.total_assets != 0 && checkpoint.total_assets != assets.len() {
            warn!(
                was = checkpoint.total_assets,
                now = assets.len(),
                "asset catalog changed since checkpoint was created"
            );
        }
        checkpoint.total_assets = assets.len();
        checkpoint.phase = Phase::Copying;
        if !dry {
            self.checkpoints.save(checkpoint).await?;
        }
        info!(
            checkpoint = %checkpoint.checkpoint_id,
            total = assets.len(),
            batch_size = self.batch_size(),
            dry_run = dry,
            "starting copy phase"
        );

        let changelog = ChangeLog::for_checkpoint(self.checkpoints.dir(), &checkpoint.checkpoint_id);
        let batch_size = self.batch_size();
        let mut copied = 0usize;
        let mut skipped = 0usize;
        let mut dry_failed = 0usize;

        for (batch_index, batch) in assets.chunks(batch_size).enumerate() {
            for asset in batch {
                self.process_asset(
                    asset,
                    checkpoint,
                    &changelog,
                    dry,
                    &mut copied,
                    &mut skipped,
                    &mut dry_failed,
                )
                .await?;
            }
            // The resume boundary: nothing from this batch is considered
            // durable until this write completes.
            checkpoint.cursor = ((batch_index + 1) * batch_size).min(assets.len());
            if !dry {
                self.checkpoints.save(checkpoint).await?;
            }
            debug!(
                checkpoint = %checkpoint.checkpoint_id,
                cursor = checkpoint.cursor,
                copied,
                skipped,
                failed = checkpoint.failed.len(),
                "batch persisted"
            );
        }

        if opts.verify && !dry {
            self.verify(checkpoint, &assets).await?;
        }

        if !dry {
            checkpoint.phase = Phase::Done;
            self.checkpoints.save(checkpoint).await?;
        }

        let failed = if dry {
            dry_failed
        } else {
            checkpoint.failed.len()
        };
        let report = MigrationReport {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            phase: if dry { checkpoint.phase } else { Phase::Done },
            total: assets.len(),
            copied,
            skipped,
            failed,
            dry_run: dry,
        };
        info!(
            checkpoint = %report.checkpoint_id,
            copied = report.copied,
            skipped = report.skipped,
            failed = report.failed,
            "migration finished"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_asset(
        &self,
        asset: &AssetRecord,
        checkpoint: &mut MigrationCheckpoint,
        changelog: &ChangeLog,
        dry: bool,
        copied: &mut usize,
        skipped: &mut usize,
        dry_failed: &mut usize,
    ) -> Result<()> {
        let previously_completed = checkpoint.completed.contains(&asset.id);

        match self.target_matches(asset).await {
            Ok(true) => {
                *skipped += 1;
                if !previously_completed && !dry {
                    changelog
                        .append(&ChangeLogEntry::new(
                            &asset.id,
                            &asset.path,
                            self.source.handle(),
                            self.target.handle(),
                            asset.size.unwrap_or(0),
                            CopyOutcome::SkippedAlreadyPresent,
                        ))
                        .await?;
                    checkpoint.mark_completed(&asset.id);
                    if let Err(e) = self.catalog.mark_migrated(&asset.id).await {
                        warn!(asset = %asset.id, "mark_migrated failed: {e}");
                    }
                }
                Ok(())
            }
            Ok(false) => {
                if previously_completed {
                    warn!(
                        asset = %asset.id,
                        "previously completed asset no longer matches target; re-copying"
                    );
                    if !dry {
                        checkpoint.completed.remove(&asset.id);
                    }
                }
                if dry {
                    *copied += 1;
                    return Ok(());
                }
                match self.copy_with_retry(asset).await {
                    Ok(size) => {
                        changelog
                            .append(&ChangeLogEntry::new(
                                &asset.id,
                                &asset.path,
                                self.source.handle(),
                                self.target.handle(),
                                size,
                                CopyOutcome::Copied,
                            ))
                            .await?;
                        checkpoint.mark_completed(&asset.id);
                        if let Err(e) = self.catalog.mark_migrated(&asset.id).await {
                            warn!(asset = %asset.id, "mark_migrated failed: {e}");
                        }
                        *copied += 1;
                        Ok(())
                    }
                    Err(e) => {
                        // One bad file never aborts the batch.
                        warn!(asset = %asset.id, "copy failed: {e}");
                        changelog
                            .append(
                                &ChangeLogEntry::new(
                                    &asset.id,
                                    &asset.path,
                                    self.source.handle(),
                                    self.target.handle(),
                                    asset.size.unwrap_or(0),
                                    CopyOutcome::Failed,
                                )
                                .with_error(e.to_string()),
                            )
                            .await?;
                        checkpoint.mark_failed(&asset.id, e.to_string());
                        Ok(())
                    }
                }
            }
            Err(e) => {
                warn!(asset = %asset.id, "could not check target: {e}");
                if dry {
                    *dry_failed += 1;
                } else {
                    checkpoint.mark_failed(&asset.id, e.to_string());
                }
                Ok(())
            }
        }
    }

    /// Skip-on-match: present at target with matching size. This is what
    /// makes resume idempotent and re-runs cheap.
    async fn target_matches(&self, asset: &AssetRecord) -> Result<bool> {
        let meta = match self.target.metadata(&asset.path).await {
            Ok(meta) => meta,
            Err(ProviderError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let expected = match asset.size {
            Some(size) => size,
            None => self.source.file_size(&asset.path).await?,
        };
        Ok(meta.size == expected)
    }

    async fn copy_with_retry(&self, asset: &AssetRecord) -> Result<u64> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = timeout(
                self.retry.attempt_timeout,
                copy_object(
                    self.source.as_ref(),
                    &asset.path,
                    self.target.as_ref(),
                    &asset.path,
                ),
            )
            .await;
            let err = match result {
                Ok(Ok(_mode)) => {
                    let size = match asset.size {
                        Some(size) => size,
                        None => self.target.file_size(&asset.path).await.unwrap_or(0),
                    };
                    return Ok(size);
                }
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Transport(format!(
                    "copy attempt timed out after {:?}",
                    self.retry.attempt_timeout
                )),
            };
            if err.is_retryable() && attempt < self.retry.max_attempts {
                let delay = self.retry.backoff(attempt);
                debug!(
                    asset = %asset.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after error: {err}"
                );
                sleep(delay).await;
                continue;
            }
            return Err(err.into());
        }
    }

    /// Re-check every completed asset at target; mismatches are demoted
    /// back to failed rather than silently accepted.
    async fn verify(
        &self,
        checkpoint: &mut MigrationCheckpoint,
        assets: &[AssetRecord],
    ) -> Result<()> {
        checkpoint.phase = Phase::Verifying;
        self.checkpoints.save(checkpoint).await?;

        let by_id: HashMap<&str, &AssetRecord> =
            assets.iter().map(|a| (a.id.as_str(), a)).collect();
        let completed: Vec<String> = checkpoint.completed.iter().cloned().collect();
        for id in completed {
            let Some(asset) = by_id.get(id.as_str()) else {
                continue;
            };
            match self.target_matches(asset).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(asset = %id, "verification found missing or mismatched target object");
                    checkpoint.demote(&id, "verification: missing or size mismatch at target".into());
                }
                Err(e) => {
                    warn!(asset = %id, "verification error: {e}");
                    checkpoint.demote(&id, format!("verification error: {e}"));
                }
            }
        }
        self.checkpoints.save(checkpoint).await?;
        Ok(())
    }

    /// Replay the change log in reverse, deleting what this migration
    /// copied. Best-effort: failures are reported, the rest is still
    /// restored. Idempotent if re-run.
    pub async fn rollback(&self, checkpoint_id: &str) -> Result<RollbackReport> {
        let checkpoint = self.checkpoints.load(checkpoint_id).await?;
        // Same guard as resume: a checkpoint from another provider pair
        // must never drive deletes against this engine's target.
        if checkpoint.scope != self.scope() {
            return Err(MigrationError::InvalidState(format!(
                "checkpoint {} belongs to scope '{}', not '{}'",
                checkpoint.checkpoint_id,
                checkpoint.scope,
                self.scope()
            )));
        }
        info!(checkpoint = %checkpoint_id, scope = %checkpoint.scope, "rolling back migration");

        let changelog = ChangeLog::for_checkpoint(self.checkpoints.dir(), checkpoint_id);
        let entries = changelog.entries().await?;
        let mut report = RollbackReport {
            checkpoint_id: checkpoint_id.to_string(),
            reversed: 0,
            already_absent: 0,
            failures: Vec::new(),
        };

        for entry in entries.iter().rev() {
            if entry.outcome != CopyOutcome::Copied {
                continue;
            }
            match self.target.object_exists(&entry.target_path).await {
                Ok(true) => match self.target.delete(&entry.target_path).await {
                    Ok(()) => report.reversed += 1,
                    Err(e) => report
                        .failures
                        .push((entry.target_path.clone(), format!("delete failed: {e}"))),
                },
                Ok(false) => report.already_absent += 1,
                Err(e) => report
                    .failures
                    .push((entry.target_path.clone(), format!("existence check failed: {e}"))),
            }
            // The source must still be intact for the rollback to mean
            // anything.
            match self.source.object_exists(&entry.source_path).await {
                Ok(true) => {}
                Ok(false) => report
                    .failures
                    .push((entry.source_path.clone(), "source object missing".to_string())),
                Err(e) => report
                    .failures
                    .push((entry.source_path.clone(), format!("source check failed: {e}"))),
            }
        }
        Ok(report)
    }

    /// Purge terminal checkpoints older than the retention window.
    /// Non-terminal checkpoints survive regardless of age; `force`
    /// additionally clears all locks.
    pub async fn cleanup(&self, older_than: Duration, force: bool) -> Result<CleanupReport> {
        let cutoff =
            Utc::now() - ChronoDuration::from_std(older_than).unwrap_or_else(|_| ChronoDuration::hours(72));
        let mut purged = Vec::new();
        for status in self.checkpoints.list().await? {
            if status.phase.is_terminal() && status.updated_at < cutoff {
                self.checkpoints.purge(&status.checkpoint_id).await?;
                info!(checkpoint = %status.checkpoint_id, phase = %status.phase, "purged checkpoint");
                purged.push(status.checkpoint_id);
            }
        }
        let locks_cleared = if force {
            self.locks.force_clear().await?
        } else {
            0
        };
        Ok(CleanupReport {
            purged,
            locks_cleared,
        })
    }

    /// Status of a specific checkpoint, or the latest for this scope.
    /// Reads only the compact sidecar.
    pub async fn status(&self, checkpoint_id: Option<&str>) -> Result<CheckpointStatus> {
        match checkpoint_id {
            Some(id) => self.checkpoints.status(id).await,
            None => {
                let scope = self.scope();
                let mut candidates: Vec<CheckpointStatus> = self
                    .checkpoints
                    .list()
                    .await?
                    .into_iter()
                    .filter(|s| s.scope == scope)
                    .collect();
                candidates.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
                candidates
                    .pop()
                    .ok_or(MigrationError::CheckpointNotFound(scope))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::VolumeAssetCatalog;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream::BoxStream;
    use provider::{
        ListOptions, ListPage, MemoryProvider, ProviderCapabilities, WriteOptions,
    };
    use std::collections::{HashMap as StdHashMap, HashSet};
    use std::sync::Mutex;

    /// Memory provider wrapper with per-path fault injection and write
    /// accounting, for exercising failure isolation and resume.
    struct FlakyProvider {
        inner: MemoryProvider,
        fail_writes: Mutex<HashSet<String>>,
        drop_writes: Mutex<HashSet<String>>,
        write_counts: Mutex<StdHashMap<String, usize>>,
    }

    impl FlakyProvider {
        fn new(handle: &str) -> Self {
            Self {
                inner: MemoryProvider::new(handle),
                fail_writes: Mutex::new(HashSet::new()),
                drop_writes: Mutex::new(HashSet::new()),
                write_counts: Mutex::new(StdHashMap::new()),
            }
        }

        fn fail_writes_to(&self, path: &str) {
            self.fail_writes.lock().unwrap().insert(path.to_string());
        }

        fn heal(&self, path: &str) {
            self.fail_writes.lock().unwrap().remove(path);
        }

        fn drop_writes_to(&self, path: &str) {
            self.drop_writes.lock().unwrap().insert(path.to_string());
        }

        fn writes_to(&self, path: &str) -> usize {
            *self.write_counts.lock().unwrap().get(path).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl StorageProvider for FlakyProvider {
        fn handle(&self) -> &str {
            self.inner.handle()
        }
        fn capabilities(&self) -> &ProviderCapabilities {
            self.inner.capabilities()
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
        async fn object_exists(&self, path: &str) -> provider::Result<bool> {
            self.inner.object_exists(path).await
        }
        async fn metadata(&self, path: &str) -> provider::Result<provider::StorageObject> {
            self.inner.metadata(path).await
        }
        async fn read(&self, path: &str) -> provider::Result<Bytes> {
            self.inner.read(path).await
        }
        async fn read_stream(
            &self,
            path: &str,
        ) -> provider::Result<BoxStream<'static, provider::Result<Bytes>>> {
            self.inner.read_stream(path).await
        }
        async fn write(
            &self,
            path: &str,
            data: Bytes,
            options: WriteOptions,
        ) -> provider::Result<()> {
            *self
                .write_counts
                .lock()
                .unwrap()
                .entry(path.to_string())
                .or_insert(0) += 1;
            if self.fail_writes.lock().unwrap().contains(path) {
                return Err(ProviderError::Transport(format!("injected failure: {path}")));
            }
            if self.drop_writes.lock().unwrap().contains(path) {
                return Ok(());
            }
            self.inner.write(path, data, options).await
        }
        async fn delete(&self, path: &str) -> provider::Result<()> {
            self.inner.delete(path).await
        }
        async fn list_page(
            &self,
            prefix: &str,
            options: &ListOptions,
            continuation: Option<String>,
        ) -> provider::Result<ListPage> {
            self.inner.list_page(prefix, options, continuation).await
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    async fn seeded_source(count: usize) -> Arc<MemoryProvider> {
        let source = Arc::new(MemoryProvider::new("src"));
        for i in 0..count {
            source
                .put(
                    format!("images/file-{i:02}.jpg"),
                    Bytes::from(vec![b'x'; 10 + i]),
                )
                .await;
        }
        source
    }

    async fn engine_for(
        source: Arc<dyn StorageProvider>,
        target: Arc<dyn StorageProvider>,
        dir: &std::path::Path,
    ) -> MigrationEngine {
        let catalog = Arc::new(VolumeAssetCatalog::new(source.clone(), vec![]));
        let checkpoints = CheckpointStore::open(dir).await.unwrap();
        let locks = LockStore::open(dir, Duration::from_secs(3600)).await.unwrap();
        MigrationEngine::new(source, target, catalog, checkpoints, locks)
            .with_retry_policy(fast_retry())
    }

    #[tokio::test]
    async fn migrates_everything_and_finishes_done() {
        let dir = tempfile::tempdir().unwrap();
        let source = seeded_source(5).await;
        let target = Arc::new(MemoryProvider::new("dst"));
        let engine = engine_for(source, target.clone(), dir.path()).await;

        let report = engine.run(&MigrateOptions::with_verify()).await.unwrap();
        assert_eq!(report.copied, 5);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.failed, 0);
        assert_eq!(target.len().await, 5);

        let status = engine.status(None).await.unwrap();
        assert_eq!(status.phase, Phase::Done);
        assert_eq!(status.completed, 5);
    }

    #[tokio::test]
    async fn skip_on_match_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let source = seeded_source(3).await;
        let target = Arc::new(FlakyProvider::new("dst"));
        // Pre-seed one object with matching size; any write to it would
        // be counted.
        let existing = source.read("images/file-01.jpg").await.unwrap();
        target
            .inner
            .put("images/file-01.jpg".to_string(), existing)
            .await;

        let engine = engine_for(source, target.clone(), dir.path()).await;
        let report = engine.run(&MigrateOptions::with_verify()).await.unwrap();
        assert_eq!(report.copied, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(target.writes_to("images/file-01.jpg"), 0);
    }

    #[tokio::test]
    async fn one_bad_asset_does_not_abort_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let source = seeded_source(10).await;
        let target = Arc::new(FlakyProvider::new("dst"));
        target.fail_writes_to("images/file-03.jpg");

        let engine = engine_for(source, target.clone(), dir.path()).await;
        let report = engine.run(&MigrateOptions::with_verify()).await.unwrap();
        assert_eq!(report.copied, 9);
        assert_eq!(report.failed, 1);
        assert!(report.has_failures());

        let status = engine.status(None).await.unwrap();
        assert_eq!(status.phase, Phase::Done);
        assert_eq!(status.completed, 9);
        assert_eq!(status.failed, 1);
        // Bounded retries were attempted before giving up.
        assert_eq!(target.writes_to("images/file-03.jpg"), 2);
    }

    #[tokio::test]
    async fn resume_retries_failures_without_recopying() {
        let dir = tempfile::tempdir().unwrap();
        let source = seeded_source(6).await;
        let target = Arc::new(FlakyProvider::new("dst"));
        target.fail_writes_to("images/file-02.jpg");

        let engine = engine_for(source, target.clone(), dir.path()).await;
        let first = engine.run(&MigrateOptions::with_verify()).await.unwrap();
        assert_eq!(first.copied, 5);
        assert_eq!(first.failed, 1);

        target.heal("images/file-02.jpg");
        let opts = MigrateOptions {
            resume: true,
            verify: true,
            ..Default::default()
        };
        let second = engine.run(&opts).await.unwrap();
        assert_eq!(second.failed, 0);
        assert_eq!(second.copied, 1);
        assert_eq!(second.skipped, 5);
        assert_eq!(target.inner.len().await, 6);
        // Objects that landed in the first run were not written again.
        assert_eq!(target.writes_to("images/file-00.jpg"), 1);
        // Resume reused the same checkpoint.
        assert_eq!(second.checkpoint_id, first.checkpoint_id);
    }

    #[tokio::test]
    async fn resume_of_done_checkpoint_supersedes_it() {
        let dir = tempfile::tempdir().unwrap();
        let source = seeded_source(2).await;
        let target = Arc::new(MemoryProvider::new("dst"));
        let engine = engine_for(source, target, dir.path()).await;

        let first = engine.run(&MigrateOptions::with_verify()).await.unwrap();
        let opts = MigrateOptions {
            resume: true,
            verify: true,
            ..Default::default()
        };
        let second = engine.run(&opts).await.unwrap();
        assert_ne!(first.checkpoint_id, second.checkpoint_id);
        assert_eq!(second.skipped, 2);
        assert_eq!(second.copied, 0);
    }

    #[tokio::test]
    async fn dry_run_is_side_effect_free() {
        let dir = tempfile::tempdir().unwrap();
        let source = seeded_source(4).await;
        let target = Arc::new(MemoryProvider::new("dst"));
        let pre = source.read("images/file-02.jpg").await.unwrap();
        target.put("images/file-02.jpg".to_string(), pre).await;

        let engine = engine_for(source, target.clone(), dir.path()).await;
        let opts = MigrateOptions {
            dry_run: true,
            verify: true,
            ..Default::default()
        };
        let report = engine.run(&opts).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.copied, 3);
        assert_eq!(report.skipped, 1);
        // Target untouched, no checkpoint state persisted.
        assert_eq!(target.len().await, 1);
        assert!(engine.checkpoints.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lock_conflict_blocks_and_skip_lock_bypasses() {
        let dir = tempfile::tempdir().unwrap();
        let source = seeded_source(2).await;
        let target = Arc::new(MemoryProvider::new("dst"));
        let engine = engine_for(source, target, dir.path()).await;

        let _held = engine.locks.acquire(&engine.scope()).await.unwrap();
        let err = engine.run(&MigrateOptions::with_verify()).await.unwrap_err();
        assert!(matches!(err, MigrationError::LockConflict { .. }));

        let opts = MigrateOptions {
            skip_lock: true,
            verify: true,
            ..Default::default()
        };
        let report = engine.run(&opts).await.unwrap();
        assert_eq!(report.copied, 2);
    }

    #[tokio::test]
    async fn verification_demotes_phantom_copies() {
        let dir = tempfile::tempdir().unwrap();
        let source = seeded_source(3).await;
        let target = Arc::new(FlakyProvider::new("dst"));
        // Write claims success but stores nothing; only verification
        // can catch it.
        target.drop_writes_to("images/file-01.jpg");

        let engine = engine_for(source, target, dir.path()).await;
        let report = engine.run(&MigrateOptions::with_verify()).await.unwrap();
        assert_eq!(report.failed, 1);

        let status = engine.status(None).await.unwrap();
        assert_eq!(status.completed, 2);
        assert_eq!(status.failed, 1);
    }

    #[tokio::test]
    async fn rollback_deletes_exactly_what_was_copied() {
        let dir = tempfile::tempdir().unwrap();
        let source = seeded_source(3).await;
        let target = Arc::new(MemoryProvider::new("dst"));
        // One object was already present: skipped, so rollback must
        // leave it alone.
        let existing = source.read("images/file-00.jpg").await.unwrap();
        target.put("images/file-00.jpg".to_string(), existing).await;

        let engine = engine_for(source.clone(), target.clone(), dir.path()).await;
        let report = engine.run(&MigrateOptions::with_verify()).await.unwrap();
        assert_eq!(report.copied, 2);
        assert_eq!(report.skipped, 1);

        let rollback = engine.rollback(&report.checkpoint_id).await.unwrap();
        assert_eq!(rollback.reversed, 2);
        assert!(rollback.failures.is_empty());
        assert_eq!(target.paths().await, vec!["images/file-00.jpg"]);
        // Source untouched.
        assert_eq!(source.len().await, 3);

        // Idempotent when re-run.
        let again = engine.rollback(&report.checkpoint_id).await.unwrap();
        assert_eq!(again.reversed, 0);
        assert_eq!(again.already_absent, 2);
    }

    #[tokio::test]
    async fn rollback_refuses_foreign_scope_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let source = seeded_source(1).await;
        let target = Arc::new(MemoryProvider::new("dst"));
        let engine = engine_for(source, target, dir.path()).await;
        let report = engine.run(&MigrateOptions::with_verify()).await.unwrap();

        // A second engine over the same state dir but wired to different
        // providers must not act on the first engine's checkpoint.
        let other_source = Arc::new(MemoryProvider::new("elsewhere"));
        let other_target = Arc::new(MemoryProvider::new("dst"));
        other_target
            .put("images/file-00.jpg".to_string(), Bytes::from_static(b"keep"))
            .await;
        let other = engine_for(other_source, other_target.clone(), dir.path()).await;

        let err = other.rollback(&report.checkpoint_id).await.unwrap_err();
        assert!(matches!(err, MigrationError::InvalidState(_)));
        assert_eq!(other_target.len().await, 1);
    }

    #[tokio::test]
    async fn cleanup_respects_terminal_state_and_age() {
        let dir = tempfile::tempdir().unwrap();
        let source = seeded_source(1).await;
        let target = Arc::new(MemoryProvider::new("dst"));
        let engine = engine_for(source, target, dir.path()).await;

        let done = engine.run(&MigrateOptions::with_verify()).await.unwrap();
        let mut in_flight = MigrationCheckpoint::new("src", "dst");
        in_flight.phase = Phase::Copying;
        engine.checkpoints.save(&mut in_flight).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = engine.cleanup(Duration::from_millis(1), false).await.unwrap();
        assert_eq!(report.purged, vec![done.checkpoint_id]);
        assert_eq!(report.locks_cleared, 0);
        // The copying-state checkpoint survives regardless of age.
        assert!(engine
            .checkpoints
            .status(&in_flight.checkpoint_id)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn force_cleanup_clears_locks_regardless_of_state() {
        let dir = tempfile::tempdir().unwrap();
        let source = seeded_source(1).await;
        let target = Arc::new(MemoryProvider::new("dst"));
        let engine = engine_for(source, target, dir.path()).await;

        engine.locks.acquire("somewhere->else").await.unwrap();
        let report = engine
            .cleanup(Duration::from_secs(3600), true)
            .await
            .unwrap();
        assert_eq!(report.locks_cleared, 1);
    }

    #[test]
    fn backoff_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            attempt_timeout: Duration::from_secs(1),
        };
        for attempt in 1..=10 {
            let delay = policy.backoff(attempt);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(600)); // cap + 50% jitter
        }
    }
}
