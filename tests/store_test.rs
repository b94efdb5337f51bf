//! Version numbering under concurrent commits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use shipwright::error::{Error, Result};
use shipwright::model::{ChangeSet, FileChange, ProjectFile, Version};
use shipwright::store::{FileStore, MemoryFileStore, VersionWriter};

fn change(path: &str) -> ChangeSet {
    ChangeSet::new(vec![FileChange::create(path, "export default 1;\n")], format!("add {path}"))
}

#[tokio::test]
async fn concurrent_commits_get_consecutive_numbers() {
    let files = Arc::new(MemoryFileStore::new());
    let writer = Arc::new(VersionWriter::new(files.clone()));

    let handles: Vec<_> = (0..5)
        .map(|n| {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move { writer.commit("p1", &change(&format!("f{n}.js")), "").await })
        })
        .collect();
    let mut numbers = Vec::new();
    for handle in handles {
        numbers.push(handle.await.unwrap().unwrap().version_number);
    }
    numbers.sort_unstable();

    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    let latest = files.version("p1", 5).await.unwrap();
    assert_eq!(latest.snapshot.len(), 5);
}

#[tokio::test]
async fn projects_number_independently() {
    let writer = VersionWriter::new(Arc::new(MemoryFileStore::new()));
    assert_eq!(writer.commit("p1", &change("a.js"), "").await.unwrap().version_number, 1);
    assert_eq!(writer.commit("p2", &change("a.js"), "").await.unwrap().version_number, 1);
    assert_eq!(writer.commit("p1", &change("b.js"), "").await.unwrap().version_number, 2);
}

/// Store where another process slips in one commit right before ours.
struct RacingStore {
    inner: MemoryFileStore,
    raced: AtomicBool,
    always: bool,
}

impl RacingStore {
    fn new(always: bool) -> Self {
        Self {
            inner: MemoryFileStore::new(),
            raced: AtomicBool::new(false),
            always,
        }
    }
}

#[async_trait]
impl FileStore for RacingStore {
    async fn list_files(&self, project_id: &str) -> Result<Vec<ProjectFile>> {
        self.inner.list_files(project_id).await
    }

    async fn read_file(&self, project_id: &str, path: &str) -> Result<Option<ProjectFile>> {
        self.inner.read_file(project_id, path).await
    }

    async fn current_version(&self, project_id: &str) -> Result<u32> {
        self.inner.current_version(project_id).await
    }

    async fn version(&self, project_id: &str, version_number: u32) -> Result<Version> {
        self.inner.version(project_id, version_number).await
    }

    async fn commit_version(
        &self,
        project_id: &str,
        expected_current: u32,
        changes: &ChangeSet,
        prompt_summary: &str,
    ) -> Result<Version> {
        if self.always || !self.raced.swap(true, Ordering::SeqCst) {
            self.inner
                .commit_version(project_id, expected_current, &change("other.js"), "other writer")
                .await?;
        }
        self.inner
            .commit_version(project_id, expected_current, changes, prompt_summary)
            .await
    }
}

#[tokio::test]
async fn conflict_is_retried_once_with_a_fresh_number() {
    let store = Arc::new(RacingStore::new(false));
    let writer = VersionWriter::new(store.clone());

    let version = writer.commit("p1", &change("mine.js"), "mine").await.unwrap();

    assert_eq!(version.version_number, 2);
    assert!(version.snapshot.contains_key("other.js"));
    assert!(version.snapshot.contains_key("mine.js"));
    assert_eq!(version.prompt_summary, "mine");
}

#[tokio::test]
async fn second_conflict_surfaces() {
    let store = Arc::new(RacingStore::new(true));
    let writer = VersionWriter::new(store.clone());

    let err = writer.commit("p1", &change("mine.js"), "").await.unwrap_err();

    assert!(matches!(err, Error::PersistConflict { .. }));
    assert!(!err.is_retryable());
    // Only the racing writer's commits exist.
    assert_eq!(store.current_version("p1").await.unwrap(), 2);
    assert!(store.read_file("p1", "mine.js").await.unwrap().is_none());
}

#[tokio::test]
async fn deleting_a_missing_file_is_a_no_op() {
    let files = MemoryFileStore::new();
    let changes = ChangeSet::new(
        vec![FileChange::create("a.js", "1;\n"), FileChange::delete("ghost.js")],
        "",
    );
    let version = files.commit_version("p1", 0, &changes, "").await.unwrap();
    assert_eq!(version.snapshot.keys().collect::<Vec<_>>(), vec!["a.js"]);
}
