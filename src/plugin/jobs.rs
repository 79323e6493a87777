//! Host-side Job Mirror
//!
//! Running and failed job sets built from `JobResult` events. Both sets are
//! keyed by plugin name and job id; snapshots are sorted and point-in-time.

use crate::protocol::JobResult;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Number of entries shown in a summary line before it is elided
pub const SUMMARY_LIMIT: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobKey {
    pub plugin: String,
    pub id: String,
}

impl JobKey {
    pub fn new(plugin: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            id: id.into(),
        }
    }
}

/// A job summary: the first few descriptions and whether more exist
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSummary {
    pub entries: Vec<String>,
    pub has_more: bool,
}

#[derive(Debug, Default)]
struct JobSets {
    running: BTreeMap<JobKey, String>,
    failed: BTreeMap<JobKey, String>,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct JobMirror {
    inner: RwLock<JobSets>,
}

impl JobMirror {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, JobSets> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, JobSets> {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Fold one progress event into the sets
    ///
    /// `done=false` marks the job running. `done=true` removes it from the
    /// running set and, when a failure message is present, records it as
    /// failed. A success leaves any earlier failure record in place.
    pub fn apply(&self, plugin: &str, job: &JobResult) {
        let key = JobKey::new(plugin, &job.id);
        let mut sets = self.write();
        if !job.done {
            sets.running.insert(key, job.description.clone());
            return;
        }
        sets.running.remove(&key);
        if !job.failure_message.is_empty() {
            let line = format!("{} failed due to {}", job.description, job.failure_message);
            sets.failed.insert(key, line);
        }
    }

    /// Remember the latest plugin-level error for display
    pub fn record_error(&self, message: impl Into<String>) {
        self.write().last_error = Some(message.into());
    }

    pub fn last_error(&self) -> Option<String> {
        self.read().last_error.clone()
    }

    pub fn is_running(&self, plugin: &str, id: &str) -> bool {
        self.read().running.contains_key(&JobKey::new(plugin, id))
    }

    pub fn is_failed(&self, plugin: &str, id: &str) -> bool {
        self.read().failed.contains_key(&JobKey::new(plugin, id))
    }

    pub fn running(&self) -> Vec<(JobKey, String)> {
        self.read()
            .running
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn failed(&self) -> Vec<(JobKey, String)> {
        self.read()
            .failed
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.read().running.len()
    }

    pub fn failed_count(&self) -> usize {
        self.read().failed.len()
    }

    pub fn running_summary(&self) -> JobSummary {
        summarize(self.read().running.values())
    }

    pub fn failed_summary(&self) -> JobSummary {
        summarize(self.read().failed.values())
    }

    /// Drop every record of one plugin, e.g. after its session closed
    pub fn forget_plugin(&self, plugin: &str) {
        let mut sets = self.write();
        sets.running.retain(|k, _| k.plugin != plugin);
    }
}

fn summarize<'a>(descriptions: impl ExactSizeIterator<Item = &'a String>) -> JobSummary {
    let total = descriptions.len();
    let mut entries: Vec<String> = descriptions.cloned().collect();
    entries.sort();
    entries.truncate(SUMMARY_LIMIT);
    JobSummary {
        entries,
        has_more: total > SUMMARY_LIMIT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(id: &str) -> JobResult {
        JobResult::running(id, format!("job {id}"))
    }

    fn succeeded(id: &str) -> JobResult {
        JobResult::finished(id, format!("job {id}"), None)
    }

    fn failed(id: &str, why: &str) -> JobResult {
        JobResult::finished(id, format!("job {id}"), Some(why.to_string()))
    }

    // The pair (running, failed) for a job depends only on the last message
    #[test]
    fn test_last_message_determines_job_membership() {
        let sequences: Vec<Vec<JobResult>> = vec![
            vec![running("j")],
            vec![running("j"), succeeded("j")],
            vec![running("j"), failed("j", "boom")],
            vec![failed("j", "boom"), running("j")],
            vec![failed("j", "boom"), succeeded("j")],
            vec![succeeded("j"), running("j"), failed("j", "again")],
            vec![running("j"), running("j")],
        ];

        for seq in sequences {
            let mirror = JobMirror::new();
            let mut failed_before_last = false;
            for (i, msg) in seq.iter().enumerate() {
                if i == seq.len() - 1 {
                    failed_before_last = mirror.is_failed("p", "j");
                }
                mirror.apply("p", msg);
            }
            let last = seq.last().unwrap();
            let is_running = mirror.is_running("p", "j");
            let is_failed = mirror.is_failed("p", "j");

            if !last.done {
                assert!(is_running, "running after {:?}", seq);
                assert_eq!(is_failed, failed_before_last, "failed unchanged after {:?}", seq);
            } else if last.failure_message.is_empty() {
                assert!(!is_running, "not running after {:?}", seq);
                assert_eq!(is_failed, failed_before_last, "failed unchanged after {:?}", seq);
            } else {
                assert!(!is_running, "not running after {:?}", seq);
                assert!(is_failed, "failed after {:?}", seq);
            }
        }
    }

    #[test]
    fn test_jobs_of_different_plugins_are_separate() {
        let mirror = JobMirror::new();
        mirror.apply("a", &running("j1"));
        mirror.apply("b", &running("j1"));
        mirror.apply("a", &succeeded("j1"));
        assert!(!mirror.is_running("a", "j1"));
        assert!(mirror.is_running("b", "j1"));

        mirror.forget_plugin("b");
        assert_eq!(mirror.running_count(), 0);
    }

    #[test]
    fn test_failed_entries_are_described() {
        let mirror = JobMirror::new();
        mirror.apply("p", &failed("j2", "throttled"));
        assert_eq!(
            mirror.failed(),
            vec![(JobKey::new("p", "j2"), "job j2 failed due to throttled".to_string())]
        );
    }

    #[test]
    fn test_summary_shows_first_three() {
        let mirror = JobMirror::new();
        for id in ["d", "a", "c", "b"] {
            mirror.apply("p", &running(id));
        }
        let summary = mirror.running_summary();
        assert_eq!(summary.entries, vec!["job a", "job b", "job c"]);
        assert!(summary.has_more);

        mirror.apply("p", &succeeded("d"));
        assert!(!mirror.running_summary().has_more);
    }
}
