use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::file_utils::resolve_output_path;
use crate::models::{DownloadStatus, TaskRecord};
use crate::task::DownloadTask;

/// All known tasks, in creation order. Shared between running tasks and command callers.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<IndexMap<Uuid, Arc<DownloadTask>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, task: Arc<DownloadTask>) {
        self.tasks.write().await.insert(task.id(), task);
    }

    /// Register a new task unless an existing one matches `conflicts` (returns its id).
    ///
    /// `desired` is collision-resolved against files on disk and against the output
    /// path of every registered task, then handed to `build`. The check, the path
    /// reservation and the insert happen under one write lock.
    pub async fn admit<C, B>(
        &self,
        desired: &Path,
        suffix: &str,
        conflicts: C,
        build: B,
    ) -> Result<Arc<DownloadTask>, Uuid>
    where
        C: Fn(&DownloadTask) -> bool,
        B: FnOnce(PathBuf) -> DownloadTask,
    {
        let mut tasks = self.tasks.write().await;
        if let Some(existing) = tasks.values().find(|t| conflicts(t)) {
            return Err(existing.id());
        }

        let output_path = resolve_output_path(desired, suffix, |candidate| {
            tasks.values().any(|t| t.output_path() == candidate)
        });
        let task = Arc::new(build(output_path));
        tasks.insert(task.id(), Arc::clone(&task));
        Ok(task)
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<DownloadTask>> {
        self.tasks.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: Uuid) -> Option<Arc<DownloadTask>> {
        self.tasks.write().await.shift_remove(&id)
    }

    /// Remove every task matching `predicate`, keeping the order of the rest.
    pub async fn remove_where<F>(&self, predicate: F) -> Vec<Arc<DownloadTask>>
    where
        F: Fn(&DownloadTask) -> bool,
    {
        let mut tasks = self.tasks.write().await;
        let mut removed = Vec::new();
        tasks.retain(|_, task| {
            if predicate(task) {
                removed.push(Arc::clone(task));
                false
            } else {
                true
            }
        });
        removed
    }

    pub async fn list(&self) -> Vec<Arc<DownloadTask>> {
        self.tasks.read().await.values().cloned().collect()
    }

    pub async fn records(&self) -> Vec<TaskRecord> {
        self.tasks.read().await.values().map(|t| t.record()).collect()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn any_downloading(&self) -> bool {
        self.tasks
            .read()
            .await
            .values()
            .any(|t| t.status() == DownloadStatus::Downloading)
    }

    /// Ids whose textual form starts with `prefix` (case-insensitive).
    pub async fn find_by_prefix(&self, prefix: &str) -> Vec<Uuid> {
        let prefix = prefix.trim().to_ascii_lowercase();
        self.tasks
            .read()
            .await
            .keys()
            .filter(|id| id.to_string().starts_with(&prefix))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::models::NewDownload;

    fn task(title: &str) -> Arc<DownloadTask> {
        let path = PathBuf::from(format!("/d/{title}.mp4"));
        Arc::new(DownloadTask::new(
            NewDownload::new("https://x/v", "137", path.clone(), title),
            path,
            EventBus::new(),
        ))
    }

    #[tokio::test]
    async fn test_keeps_creation_order_after_removal() {
        let registry = TaskRegistry::new();
        let (a, b, c) = (task("a"), task("b"), task("c"));
        for t in [&a, &b, &c] {
            registry.insert(Arc::clone(t)).await;
        }

        assert!(registry.remove(b.id()).await.is_some());
        assert!(registry.remove(b.id()).await.is_none());

        let titles: Vec<String> = registry.list().await.iter().map(|t| t.title().to_string()).collect();
        assert_eq!(titles, vec!["a", "c"]);
    }

    fn build(new: NewDownload) -> impl FnOnce(PathBuf) -> DownloadTask {
        move |path| DownloadTask::new(new, path, EventBus::new())
    }

    #[tokio::test]
    async fn test_admit_reports_conflict() {
        let registry = TaskRegistry::new();
        let first = task("a");
        registry.insert(Arc::clone(&first)).await;

        let new = NewDownload::new("https://x/v", "137", PathBuf::from("/d/b.mp4"), "b");
        let result = registry
            .admit(Path::new("/d/b.mp4"), ".mp4", |t| t.source_url() == "https://x/v", build(new))
            .await;
        assert_eq!(result.map(|t| t.id()), Err(first.id()));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_admit_skips_output_paths_of_registered_tasks() {
        let registry = TaskRegistry::new();
        let desired = Path::new("/nonexistent-media-dir/Foo.mp4");

        let mut paths = Vec::new();
        for selector in ["137", "136", "22"] {
            let new = NewDownload::new("https://x/v", selector, desired.to_path_buf(), "Foo");
            let task = registry.admit(desired, ".mp4", |_| false, build(new)).await.unwrap();
            paths.push(task.output_path().to_path_buf());
        }

        assert_eq!(
            paths,
            vec![
                PathBuf::from("/nonexistent-media-dir/Foo.mp4"),
                PathBuf::from("/nonexistent-media-dir/Foo (1).mp4"),
                PathBuf::from("/nonexistent-media-dir/Foo (2).mp4"),
            ]
        );
    }

    #[tokio::test]
    async fn test_find_by_prefix() {
        let registry = TaskRegistry::new();
        let t = task("a");
        registry.insert(Arc::clone(&t)).await;
        let prefix = t.id().to_string()[..8].to_ascii_uppercase();
        assert_eq!(registry.find_by_prefix(&prefix).await, vec![t.id()]);
        assert!(registry.find_by_prefix("zzzz").await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_inserts_are_all_kept() {
        let registry = Arc::new(TaskRegistry::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.insert(task(&format!("t{i}"))).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(registry.len().await, 32);
    }
}
