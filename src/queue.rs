//! Filesystem-backed ingestion queue.
//!
//! Three directories under the queue root — `pending`, `processing`,
//! `completed` — each holding small CSV work items (header
//! `url[,title,rating,importance,projects,class,attempts]`). An item moves
//! between states by atomic rename, so exactly one worker owns it at any
//! moment and a crash leaves it visible in `processing` for recovery.
//!
//! The rolling rate-limit window lives here too: a trailing-window admission
//! counter per request class (manual / scheduled), process-local, effectively
//! unlimited when a proxy is configured.

use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::WindowConfig;

/// Request class counted against its own window budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemClass {
    Manual,
    Scheduled,
}

impl ItemClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemClass::Manual => "manual",
            ItemClass::Scheduled => "scheduled",
        }
    }

    pub fn parse(s: &str) -> ItemClass {
        match s {
            "scheduled" => ItemClass::Scheduled,
            _ => ItemClass::Manual,
        }
    }
}

/// One queued ingestion request.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub url: String,
    pub title: Option<String>,
    pub rating: Option<f64>,
    pub importance: Option<String>,
    pub projects: Vec<String>,
    pub class: ItemClass,
    pub attempts: u32,
}

impl WorkItem {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
            rating: None,
            importance: None,
            projects: Vec::new(),
            class: ItemClass::Manual,
            attempts: 0,
        }
    }

    const HEADER: &'static str = "url,title,rating,importance,projects,class,attempts";

    /// Serialize as a two-line CSV file. Fields are comma-free by
    /// construction (`sanitize_field`); projects are `;`-separated.
    pub fn to_csv(&self) -> String {
        let row = [
            sanitize_field(&self.url),
            sanitize_field(self.title.as_deref().unwrap_or("")),
            self.rating.map(|r| r.to_string()).unwrap_or_default(),
            sanitize_field(self.importance.as_deref().unwrap_or("")),
            sanitize_field(&self.projects.join(";")),
            self.class.as_str().to_string(),
            self.attempts.to_string(),
        ]
        .join(",");
        format!("{}\n{}\n", Self::HEADER, row)
    }

    /// Parse a work-item CSV. Only `url` is required; unknown columns are
    /// ignored so hand-written single-column files work.
    pub fn parse_csv(content: &str) -> Result<WorkItem> {
        let mut lines = content.lines().filter(|l| !l.trim().is_empty());
        let header = lines.next().context("empty work item file")?;
        let row = lines.next().context("work item file has no data row")?;

        let columns: Vec<&str> = header.split(',').map(str::trim).collect();
        let values: Vec<&str> = row.split(',').map(str::trim).collect();

        let get = |name: &str| -> Option<&str> {
            columns
                .iter()
                .position(|c| *c == name)
                .and_then(|i| values.get(i).copied())
                .filter(|v| !v.is_empty())
        };

        let url = get("url").context("work item missing url column")?.to_string();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            bail!("work item url is not http(s): {}", url);
        }

        Ok(WorkItem {
            url,
            title: get("title").map(str::to_string),
            rating: get("rating").and_then(|r| r.parse().ok()),
            importance: get("importance").map(str::to_string),
            projects: get("projects")
                .map(|p| {
                    p.split(';')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            class: get("class").map(ItemClass::parse).unwrap_or(ItemClass::Manual),
            attempts: get("attempts").and_then(|a| a.parse().ok()).unwrap_or(0),
        })
    }
}

fn sanitize_field(value: &str) -> String {
    value.replace([',', '\n', '\r'], " ").trim().to_string()
}

/// Queue depths for the operator status view.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
}

#[derive(Debug, Clone)]
pub struct Queue {
    root: PathBuf,
}

impl Queue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.root.join("pending")
    }

    pub fn processing_dir(&self) -> PathBuf {
        self.root.join("processing")
    }

    pub fn completed_dir(&self) -> PathBuf {
        self.root.join("completed")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.pending_dir(), self.processing_dir(), self.completed_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Write a new work item into `pending`. Returns the item path.
    pub fn enqueue(&self, item: &WorkItem) -> Result<PathBuf> {
        self.ensure_dirs()?;
        let path = self.pending_dir().join(format!("{}.csv", Uuid::new_v4()));
        std::fs::write(&path, item.to_csv())?;
        Ok(path)
    }

    /// Pending item paths, FIFO by modification time.
    pub fn list_pending(&self) -> Result<Vec<PathBuf>> {
        let mut entries: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(self.pending_dir())? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            let mtime = entry
                .metadata()?
                .modified()
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            entries.push((mtime, path));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(entries.into_iter().map(|(_, p)| p).collect())
    }

    /// Claim a pending item by atomic rename into `processing`.
    pub fn claim(&self, pending_path: &Path) -> Result<(PathBuf, WorkItem)> {
        let file_name = pending_path
            .file_name()
            .context("claim: path has no file name")?;
        let processing_path = self.processing_dir().join(file_name);
        std::fs::rename(pending_path, &processing_path)?;
        let item = WorkItem::parse_csv(&std::fs::read_to_string(&processing_path)?)?;
        Ok((processing_path, item))
    }

    /// Terminal completion: move the item file into `completed`, where it
    /// stays as an audit trail.
    pub fn complete(&self, processing_path: &Path) -> Result<()> {
        let file_name = processing_path
            .file_name()
            .context("complete: path has no file name")?;
        std::fs::rename(processing_path, self.completed_dir().join(file_name))?;
        Ok(())
    }

    /// Retryable failure: rewrite the item into `pending` with its attempt
    /// counter bumped.
    pub fn requeue(&self, processing_path: &Path, item: &WorkItem) -> Result<PathBuf> {
        let file_name = processing_path
            .file_name()
            .context("requeue: path has no file name")?;
        let mut bumped = item.clone();
        bumped.attempts += 1;
        let pending_path = self.pending_dir().join(file_name);
        std::fs::write(&pending_path, bumped.to_csv())?;
        std::fs::remove_file(processing_path)?;
        Ok(pending_path)
    }

    /// Interruption: put the item back unchanged — not a failure, so the
    /// attempt counter stays.
    pub fn release(&self, processing_path: &Path) -> Result<PathBuf> {
        let file_name = processing_path
            .file_name()
            .context("release: path has no file name")?;
        let pending_path = self.pending_dir().join(file_name);
        std::fs::rename(processing_path, &pending_path)?;
        Ok(pending_path)
    }

    /// Startup recovery: anything left in `processing` was interrupted and
    /// goes back to `pending`.
    pub fn recover(&self) -> Result<usize> {
        self.ensure_dirs()?;
        let mut moved = 0;
        for entry in std::fs::read_dir(self.processing_dir())? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name() {
                std::fs::rename(&path, self.pending_dir().join(name))?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    pub fn counts(&self) -> Result<QueueCounts> {
        let count = |dir: PathBuf| -> Result<usize> {
            if !dir.is_dir() {
                return Ok(0);
            }
            Ok(std::fs::read_dir(dir)?
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_file())
                .count())
        };
        Ok(QueueCounts {
            pending: count(self.pending_dir())?,
            processing: count(self.processing_dir())?,
            completed: count(self.completed_dir())?,
        })
    }
}

// ============ Rolling rate-limit window ============

/// Trailing-window admission counter.
#[derive(Debug)]
pub struct RollingWindow {
    window: Duration,
    max: usize,
    stamps: VecDeque<Instant>,
}

impl RollingWindow {
    pub fn new(window: Duration, max: usize) -> Self {
        Self {
            window,
            max,
            stamps: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        // A stamp stays counted until its age strictly exceeds the window;
        // at age == window it still occupies its slot.
        while let Some(&front) = self.stamps.front() {
            if now.duration_since(front) > self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admit a request at `now`, recording it if the window has room.
    pub fn admit_at(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.stamps.len() >= self.max {
            return false;
        }
        self.stamps.push_back(now);
        true
    }

    pub fn admit(&mut self) -> bool {
        self.admit_at(Instant::now())
    }

    /// How long until the window admits the next request; `None` if it
    /// would admit one now.
    pub fn wait_at(&mut self, now: Instant) -> Option<Duration> {
        self.prune(now);
        if self.stamps.len() < self.max {
            return None;
        }
        self.stamps
            .front()
            .map(|&front| self.window.saturating_sub(now.duration_since(front)))
    }

    pub fn wait(&mut self) -> Option<Duration> {
        self.wait_at(Instant::now())
    }

    /// Requests currently counted in the window.
    pub fn occupancy_at(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.stamps.len()
    }

    pub fn occupancy(&mut self) -> usize {
        self.occupancy_at(Instant::now())
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// Per-source rate limiter: one window per request class, bypassed entirely
/// when a rotating proxy is configured.
#[derive(Debug)]
pub struct RateLimiter {
    unlimited: bool,
    manual: RollingWindow,
    scheduled: RollingWindow,
}

impl RateLimiter {
    pub fn new(config: &WindowConfig, unlimited: bool) -> Self {
        let window = Duration::from_secs(config.window_seconds);
        Self {
            unlimited,
            manual: RollingWindow::new(window, config.max_manual),
            scheduled: RollingWindow::new(window, config.max_scheduled),
        }
    }

    pub fn admit(&mut self, class: ItemClass) -> bool {
        if self.unlimited {
            return true;
        }
        match class {
            ItemClass::Manual => self.manual.admit(),
            ItemClass::Scheduled => self.scheduled.admit(),
        }
    }

    pub fn wait(&mut self, class: ItemClass) -> Option<Duration> {
        if self.unlimited {
            return None;
        }
        match class {
            ItemClass::Manual => self.manual.wait(),
            ItemClass::Scheduled => self.scheduled.wait(),
        }
    }

    /// `(occupancy, max)` per class, for the status view.
    pub fn occupancy(&mut self) -> [(ItemClass, usize, usize); 2] {
        [
            (ItemClass::Manual, self.manual.occupancy(), self.manual.max()),
            (
                ItemClass::Scheduled,
                self.scheduled.occupancy(),
                self.scheduled.max(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn item(url: &str) -> WorkItem {
        WorkItem {
            url: url.into(),
            title: Some("A title, with comma".into()),
            rating: Some(4.5),
            importance: Some("high".into()),
            projects: vec!["workshop".into(), "reading-list".into()],
            class: ItemClass::Scheduled,
            attempts: 2,
        }
    }

    #[test]
    fn test_csv_roundtrip() {
        let original = item("https://www.youtube.com/watch?v=ABC123XYZ01");
        let parsed = WorkItem::parse_csv(&original.to_csv()).unwrap();
        assert_eq!(parsed.url, original.url);
        // Commas in free-text fields are sanitized to spaces.
        assert_eq!(parsed.title.as_deref(), Some("A title  with comma"));
        assert_eq!(parsed.rating, Some(4.5));
        assert_eq!(parsed.projects, vec!["workshop", "reading-list"]);
        assert_eq!(parsed.class, ItemClass::Scheduled);
        assert_eq!(parsed.attempts, 2);
    }

    #[test]
    fn test_parse_minimal_csv() {
        let parsed = WorkItem::parse_csv("url\nhttps://example.com/post\n").unwrap();
        assert_eq!(parsed.url, "https://example.com/post");
        assert_eq!(parsed.class, ItemClass::Manual);
        assert_eq!(parsed.attempts, 0);
        assert!(parsed.projects.is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(WorkItem::parse_csv("").is_err());
        assert!(WorkItem::parse_csv("url\n").is_err());
        assert!(WorkItem::parse_csv("url\nftp://nope\n").is_err());
    }

    #[test]
    fn test_queue_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let queue = Queue::new(tmp.path());
        queue.ensure_dirs().unwrap();

        let path = queue.enqueue(&WorkItem::new("https://example.com/a")).unwrap();
        assert_eq!(queue.counts().unwrap().pending, 1);

        let (processing_path, parsed) = queue.claim(&path).unwrap();
        assert_eq!(parsed.url, "https://example.com/a");
        assert!(!path.exists());
        let counts = queue.counts().unwrap();
        assert_eq!((counts.pending, counts.processing), (0, 1));

        queue.complete(&processing_path).unwrap();
        let counts = queue.counts().unwrap();
        assert_eq!(
            (counts.pending, counts.processing, counts.completed),
            (0, 0, 1)
        );
    }

    #[test]
    fn test_requeue_bumps_attempts() {
        let tmp = TempDir::new().unwrap();
        let queue = Queue::new(tmp.path());
        queue.ensure_dirs().unwrap();

        let path = queue.enqueue(&WorkItem::new("https://example.com/a")).unwrap();
        let (processing_path, parsed) = queue.claim(&path).unwrap();
        let pending_path = queue.requeue(&processing_path, &parsed).unwrap();

        let requeued = WorkItem::parse_csv(&std::fs::read_to_string(pending_path).unwrap()).unwrap();
        assert_eq!(requeued.attempts, 1);
        assert!(!processing_path.exists());
    }

    #[test]
    fn test_recover_moves_processing_back() {
        let tmp = TempDir::new().unwrap();
        let queue = Queue::new(tmp.path());
        queue.ensure_dirs().unwrap();

        // Simulate a crash: an item file stranded in processing.
        std::fs::write(
            queue.processing_dir().join("stranded.csv"),
            WorkItem::new("https://example.com/a").to_csv(),
        )
        .unwrap();

        let moved = queue.recover().unwrap();
        assert_eq!(moved, 1);
        let counts = queue.counts().unwrap();
        assert_eq!((counts.pending, counts.processing), (1, 0));
    }

    #[test]
    fn test_list_pending_fifo() {
        let tmp = TempDir::new().unwrap();
        let queue = Queue::new(tmp.path());
        queue.ensure_dirs().unwrap();

        let first = queue.enqueue(&WorkItem::new("https://example.com/1")).unwrap();
        // mtime resolution can be coarse; nudge the clock.
        std::thread::sleep(Duration::from_millis(20));
        let second = queue.enqueue(&WorkItem::new("https://example.com/2")).unwrap();

        let listed = queue.list_pending().unwrap();
        assert_eq!(listed, vec![first, second]);
    }

    #[test]
    fn test_rolling_window_admission() {
        let mut window = RollingWindow::new(Duration::from_secs(900), 2);
        let t0 = Instant::now();

        assert!(window.admit_at(t0));
        assert!(window.admit_at(t0 + Duration::from_secs(1)));
        // Window full.
        assert!(!window.admit_at(t0 + Duration::from_secs(2)));
        let wait = window.wait_at(t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(wait, Duration::from_secs(898));

        // After the first stamp expires, one slot frees up.
        assert!(window.admit_at(t0 + Duration::from_secs(901)));
        assert_eq!(window.occupancy_at(t0 + Duration::from_secs(901)), 2);
    }

    #[test]
    fn test_rate_limiter_classes_and_proxy_bypass() {
        let config = WindowConfig {
            window_seconds: 900,
            max_manual: 1,
            max_scheduled: 1,
        };

        let mut limiter = RateLimiter::new(&config, false);
        assert!(limiter.admit(ItemClass::Manual));
        assert!(!limiter.admit(ItemClass::Manual));
        // Scheduled budget is independent.
        assert!(limiter.admit(ItemClass::Scheduled));

        let mut unlimited = RateLimiter::new(&config, true);
        for _ in 0..10 {
            assert!(unlimited.admit(ItemClass::Manual));
        }
        assert!(unlimited.wait(ItemClass::Manual).is_none());
    }
}
