//! Read-only diagnostics over storage providers: connectivity probes,
//! single-file checks with "did you mean" suggestions, and source/target
//! drift reports. Nothing in this crate writes to any provider.

mod similarity;

pub use similarity::similarity;

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use migration::{AssetCatalog, AssetRecord, Result};
use provider::{ConnectionTest, ListOptions, ProviderError, StorageObject, StorageProvider};

/// Suggestions below this similarity are more confusing than helpful.
const SUGGESTION_CUTOFF: f64 = 0.7;
const MAX_SUGGESTIONS: usize = 5;

pub type ConnectionResults = Vec<(String, ConnectionTest)>;

/// Probe every provider, continuing past failures so one dead endpoint
/// does not mask the health of the rest.
pub async fn probe_all(providers: &[(String, Arc<dyn StorageProvider>)]) -> ConnectionResults {
    let mut results = Vec::with_capacity(providers.len());
    for (handle, provider) in providers {
        let test = provider.test_connection().await;
        if !test.success {
            warn!(handle, "connectivity probe failed: {:?}", test.error);
        }
        results.push((handle.clone(), test));
    }
    results
}

#[derive(Debug, Clone, Serialize)]
pub struct FileCheck {
    pub path: String,
    pub exists: bool,
    pub size: Option<u64>,
    pub content_type: Option<String>,
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,
    /// Similar paths that do exist, best first. Only populated when the
    /// requested path is missing.
    pub suggestions: Vec<(String, f64)>,
}

/// Check one path. When it is missing, sibling objects under the same
/// directory are scored for similarity so typos surface immediately.
pub async fn check_file(provider: &dyn StorageProvider, path: &str) -> Result<FileCheck> {
    match provider.metadata(path).await {
        Ok(meta) => Ok(FileCheck {
            path: path.to_string(),
            exists: true,
            size: Some(meta.size),
            content_type: Some(meta.content_type),
            last_modified: Some(meta.last_modified),
            suggestions: Vec::new(),
        }),
        Err(ProviderError::NotFound(_)) => {
            let suggestions = suggest_similar(provider, path).await;
            Ok(FileCheck {
                path: path.to_string(),
                exists: false,
                size: None,
                content_type: None,
                last_modified: None,
                suggestions,
            })
        }
        Err(e) => Err(e.into()),
    }
}

async fn suggest_similar(provider: &dyn StorageProvider, path: &str) -> Vec<(String, f64)> {
    let prefix = match path.rfind('/') {
        Some(idx) => &path[..=idx],
        None => "",
    };
    let candidates = match provider.list_all(prefix, ListOptions::default()).await {
        Ok(objects) => objects,
        Err(e) => {
            debug!(prefix, "could not list candidates for suggestions: {e}");
            return Vec::new();
        }
    };

    let mut scored: Vec<(String, f64)> = candidates
        .into_iter()
        .map(|o| {
            let score = similarity(path, &o.path);
            (o.path, score)
        })
        .filter(|(_, score)| *score >= SUGGESTION_CUTOFF)
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(MAX_SUGGESTIONS);
    scored
}

#[derive(Debug, Clone, Serialize)]
pub struct SizeMismatch {
    pub path: String,
    pub source_size: u64,
    pub target_size: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ComparisonReport {
    pub only_in_source: Vec<String>,
    pub only_in_target: Vec<String>,
    pub size_mismatches: Vec<SizeMismatch>,
    pub matched: usize,
}

impl ComparisonReport {
    pub fn is_clean(&self) -> bool {
        self.only_in_source.is_empty()
            && self.only_in_target.is_empty()
            && self.size_mismatches.is_empty()
    }
}

/// Set difference by path in both directions, plus size comparison for
/// common paths. The usual post-migration sanity check.
pub async fn compare(
    source: &dyn StorageProvider,
    target: &dyn StorageProvider,
    prefix: &str,
) -> Result<ComparisonReport> {
    let source_objects = index_by_path(source.list_all(prefix, ListOptions::default()).await?);
    let target_objects = index_by_path(target.list_all(prefix, ListOptions::default()).await?);

    let mut report = ComparisonReport::default();
    for (path, source_obj) in &source_objects {
        match target_objects.get(path) {
            None => report.only_in_source.push(path.clone()),
            Some(target_obj) if target_obj.size != source_obj.size => {
                report.size_mismatches.push(SizeMismatch {
                    path: path.clone(),
                    source_size: source_obj.size,
                    target_size: target_obj.size,
                });
            }
            Some(_) => report.matched += 1,
        }
    }
    for path in target_objects.keys() {
        if !source_objects.contains_key(path) {
            report.only_in_target.push(path.clone());
        }
    }
    Ok(report)
}

fn index_by_path(objects: Vec<StorageObject>) -> BTreeMap<String, StorageObject> {
    objects.into_iter().map(|o| (o.path.clone(), o)).collect()
}

/// Catalog records whose file does not exist at the provider.
pub async fn find_missing(
    provider: &dyn StorageProvider,
    catalog: &dyn AssetCatalog,
) -> Result<Vec<AssetRecord>> {
    let mut missing = Vec::new();
    for record in catalog.discover(None).await? {
        if !provider.object_exists(&record.path).await? {
            missing.push(record);
        }
    }
    Ok(missing)
}

/// Objects at the provider that no catalog record claims.
pub async fn find_orphans(
    provider: &dyn StorageProvider,
    catalog: &dyn AssetCatalog,
    prefix: &str,
) -> Result<Vec<StorageObject>> {
    let known: std::collections::BTreeSet<String> = catalog
        .discover(None)
        .await?
        .into_iter()
        .map(|r| r.path)
        .collect();
    let objects = provider.list_all(prefix, ListOptions::default()).await?;
    Ok(objects
        .into_iter()
        .filter(|o| !known.contains(&o.path))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use migration::VolumeAssetCatalog;
    use provider::MemoryProvider;

    async fn seeded(handle: &str, paths: &[(&str, usize)]) -> Arc<MemoryProvider> {
        let provider = Arc::new(MemoryProvider::new(handle));
        for (path, size) in paths {
            provider
                .put(path.to_string(), Bytes::from(vec![b'x'; *size]))
                .await;
        }
        provider
    }

    #[tokio::test]
    async fn probe_continues_past_failures() {
        let healthy = seeded("a", &[("f.txt", 1)]).await;
        let also_healthy = seeded("b", &[]).await;
        let providers: Vec<(String, Arc<dyn StorageProvider>)> = vec![
            ("a".to_string(), healthy),
            ("b".to_string(), also_healthy),
        ];
        let results = probe_all(&providers).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, test)| test.success));
    }

    #[tokio::test]
    async fn check_reports_existing_file() {
        let provider = seeded("src", &[("images/cat.jpg", 42)]).await;
        let check = check_file(provider.as_ref(), "images/cat.jpg").await.unwrap();
        assert!(check.exists);
        assert_eq!(check.size, Some(42));
        assert!(check.suggestions.is_empty());
    }

    #[tokio::test]
    async fn missing_file_suggests_near_matches() {
        let provider = seeded(
            "src",
            &[
                ("images/cat.jpg", 1),
                ("images/cats.jpg", 1),
                ("images/unrelated-name-entirely.bin", 1),
            ],
        )
        .await;
        let check = check_file(provider.as_ref(), "images/cat.jpeg").await.unwrap();
        assert!(!check.exists);
        let suggested: Vec<&str> = check.suggestions.iter().map(|(p, _)| p.as_str()).collect();
        assert!(suggested.contains(&"images/cat.jpg"));
        assert!(!suggested.contains(&"images/unrelated-name-entirely.bin"));
    }

    #[tokio::test]
    async fn compare_reports_drift_both_ways() {
        let source = seeded(
            "src",
            &[("a.txt", 10), ("b.txt", 20), ("c.txt", 30)],
        )
        .await;
        let target = seeded(
            "dst",
            &[("a.txt", 10), ("b.txt", 99), ("d.txt", 5)],
        )
        .await;

        let report = compare(source.as_ref(), target.as_ref(), "").await.unwrap();
        assert_eq!(report.only_in_source, vec!["c.txt"]);
        assert_eq!(report.only_in_target, vec!["d.txt"]);
        assert_eq!(report.size_mismatches.len(), 1);
        assert_eq!(report.size_mismatches[0].path, "b.txt");
        assert_eq!(report.matched, 1);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn missing_and_orphans_partition_the_drift() {
        let source = seeded("src", &[("kept.txt", 1), ("lost.txt", 1)]).await;
        let target = seeded("dst", &[("kept.txt", 1), ("stray.txt", 1)]).await;
        let catalog = VolumeAssetCatalog::new(source, vec![]);

        let missing = find_missing(target.as_ref(), &catalog).await.unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].path, "lost.txt");

        let orphans = find_orphans(target.as_ref(), &catalog, "").await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].path, "stray.txt");
    }
}
