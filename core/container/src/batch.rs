//! Best-effort bulk import and extract.
//!
//! Each item is attempted on its own. Per-item faults are recorded in the
//! report and in the session error log, and the batch moves on. A fault that
//! leaves the container unusable, or a cancellation, stops the batch and
//! marks the remaining items as skipped.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::container::Container;
use crate::store::ContainerStore;
use capsule_common::{Error, TaskContext};

/// What happened to one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Imported { id: u64 },
    Extracted { path: PathBuf },
    Failed { error: String },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    /// Source path or file id, as given.
    pub item: String,
    pub status: ItemStatus,
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            ItemStatus::Imported { .. } | ItemStatus::Extracted { .. }
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: Vec<ItemOutcome>,
    /// Why the batch stopped early, if it did.
    pub aborted: Option<String>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, ItemStatus::Failed { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == ItemStatus::Skipped)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.aborted.is_none() && self.failed() == 0
    }
}

fn stops_batch(error: &Error, ctx: &TaskContext) -> bool {
    let cause = match error {
        Error::RolledBack { cause, .. } => cause.as_ref(),
        other => other,
    };
    error.is_container_fatal() || matches!(cause, Error::Cancelled) || ctx.is_cancelled()
}

impl<S: ContainerStore> Container<S> {
    fn run_batch<T, F>(&mut self, items: Vec<(String, T)>, ctx: &TaskContext, mut step: F) -> BatchReport
    where
        F: FnMut(&mut Self, T) -> capsule_common::Result<ItemStatus>,
    {
        let mut report = BatchReport::default();
        let mut items = items.into_iter();

        for (label, item) in items.by_ref() {
            match step(self, item) {
                Ok(status) => report.outcomes.push(ItemOutcome { item: label, status }),
                Err(e) => {
                    self.log_mut().error(format!("{}: {}", label, e));
                    let stop = stops_batch(&e, ctx);
                    report.outcomes.push(ItemOutcome {
                        item: label,
                        status: ItemStatus::Failed {
                            error: e.to_string(),
                        },
                    });
                    if stop {
                        warn!(error = %e, "Batch aborted");
                        report.aborted = Some(e.to_string());
                        break;
                    }
                }
            }
        }
        for (label, _) in items {
            report.outcomes.push(ItemOutcome {
                item: label,
                status: ItemStatus::Skipped,
            });
        }

        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            "Batch finished"
        );
        report
    }

    /// Import every path into directory `parent`.
    pub fn import_files(&mut self, paths: &[PathBuf], parent: u64, ctx: &TaskContext) -> BatchReport {
        let items = paths
            .iter()
            .map(|p| (p.display().to_string(), p.clone()))
            .collect();
        self.run_batch(items, ctx, |container, path| {
            let id = container.import_file(&path, parent, ctx)?;
            Ok(ItemStatus::Imported { id })
        })
    }

    /// Extract every file into `dest_dir` under its display name.
    pub fn extract_files(&mut self, ids: &[u64], dest_dir: &Path, ctx: &TaskContext) -> BatchReport {
        let items = ids.iter().map(|&id| (format!("file {}", id), id)).collect();
        self.run_batch(items, ctx, |container, id| {
            let path = container.extract_file(id, dest_dir, ctx)?;
            Ok(ItemStatus::Extracted { path })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::registry::ROOT_DIR;
    use crate::store::MemoryStore;
    use tokio_util::sync::CancellationToken;

    fn container() -> Container<MemoryStore> {
        Container::create(MemoryStore::new(), "vault", "cap", b"pw", test_config()).unwrap()
    }

    #[test]
    fn test_import_continues_past_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let c_path = dir.path().join("c.txt");
        std::fs::write(&a, b"alpha").unwrap();
        std::fs::write(&c_path, b"gamma").unwrap();
        let paths = vec![a, dir.path().join("missing.txt"), c_path];

        let mut c = container();
        let report = c.import_files(&paths, ROOT_DIR, &TaskContext::detached());
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert!(report.aborted.is_none());
        assert!(!report.is_complete());
        assert!(c.session_log().error_log().contains("missing.txt"));
        assert_eq!(c.header().map.files.len(), 2);
    }

    #[test]
    fn test_extract_reports_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = container();
        let id = c
            .add_file(
                &b"data"[..],
                4,
                crate::container::NewFile::new("d", "bin"),
                &TaskContext::detached(),
            )
            .unwrap();

        let report = c.extract_files(&[id, 42], dir.path(), &TaskContext::detached());
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.outcomes[1].item, "file 42");
        assert!(matches!(report.outcomes[1].status, ItemStatus::Failed { .. }));
        assert_eq!(std::fs::read(dir.path().join("d.bin")).unwrap(), b"data");
    }

    #[test]
    fn test_extract_reports_stored_path_name() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("out");
        std::fs::create_dir(&dest).unwrap();
        let mut c = container();
        let id = c
            .add_file(
                &b"data"[..],
                4,
                crate::container::NewFile::new("d", "bin"),
                &TaskContext::detached(),
            )
            .unwrap();
        c.header_mut().file_mut(id).unwrap().metadata.name = "../d".to_string();

        let report = c.extract_files(&[id], &dest, &TaskContext::detached());
        assert_eq!(report.failed(), 1);
        assert!(report.aborted.is_none());
        assert!(!root.path().join("d.bin").exists());
    }

    #[test]
    fn test_cancellation_skips_rest() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..3)
            .map(|i| {
                let p = dir.path().join(format!("{}.txt", i));
                std::fs::write(&p, b"content").unwrap();
                p
            })
            .collect();
        let token = CancellationToken::new();
        token.cancel();

        let mut c = container();
        let report = c.import_files(&paths, ROOT_DIR, &TaskContext::new(token));
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 2);
        assert!(report.aborted.is_some());
        assert!(c.header().map.files.is_empty());
    }
}
