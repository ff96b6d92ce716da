//! Bookkeeping for one monitored process: raw samples waiting to be
//! averaged, rows waiting to be shown, rows already shown, and the
//! rotation policy that carves a long run into save windows.

use std::mem;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

use super::sampler::Sample;
use crate::persist::{self, OutputFormat, PersistError};

/// Wait this long before retrying after a failed save.
pub const ROTATION_RETRY_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    /// Seconds since monitoring began, including time spent in
    /// earlier save windows.
    pub elapsed_seconds: f64,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub source: String,
}

pub struct Session {
    started_at: Instant,
    carried: Duration,
    source: String,
    pending: Vec<Sample>,
    display_buffer: Vec<AggregateRow>,
    committed: Vec<AggregateRow>,
}

impl Session {
    pub fn begin(source: String, now: Instant) -> Self {
        Session {
            started_at: now,
            carried: Duration::ZERO,
            source,
            pending: Vec::new(),
            display_buffer: Vec::new(),
            committed: Vec::new(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Seconds since the current save window opened.
    pub fn local_elapsed(&self, now: Instant) -> f64 {
        now.duration_since(self.started_at).as_secs_f64()
    }

    pub fn push_sample(&mut self, sample: Sample) {
        self.pending.push(sample);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Averages the pending samples into one row, stamped with the
    /// time of the newest sample in the group.
    pub fn aggregate_pending(&mut self) {
        let row = aggregate(&self.pending, self.started_at, self.carried, &self.source);
        self.pending.clear();
        if let Some(row) = row {
            self.display_buffer.push(row);
        }
    }

    pub fn has_buffered(&self) -> bool {
        !self.display_buffer.is_empty()
    }

    /// Moves buffered rows into the committed set and hands them back
    /// for display.
    pub fn commit_display_buffer(&mut self) -> Vec<AggregateRow> {
        let rows = mem::take(&mut self.display_buffer);
        self.committed.extend(rows.iter().cloned());
        rows
    }

    pub fn committed_rows(&self) -> &[AggregateRow] {
        &self.committed
    }

    pub fn has_rows(&self) -> bool {
        !self.committed.is_empty() || !self.display_buffer.is_empty() || !self.pending.is_empty()
    }

    /// Everything known right now, in display order: committed rows,
    /// buffered rows, then a row for any unfinished sample group.
    /// Consumes nothing.
    pub fn snapshot_rows(&self) -> Vec<AggregateRow> {
        let mut rows = self.committed.clone();
        rows.extend(self.display_buffer.iter().cloned());
        rows.extend(self.partial_row());
        rows
    }

    /// The rows a snapshot holds that have never reached the display.
    pub fn undisplayed_rows(&self) -> Vec<AggregateRow> {
        let mut rows = self.display_buffer.clone();
        rows.extend(self.partial_row());
        rows
    }

    fn partial_row(&self) -> Option<AggregateRow> {
        aggregate(&self.pending, self.started_at, self.carried, &self.source)
    }

    /// Opens the next save window. Time spent so far keeps counting
    /// in the elapsed column of future rows.
    pub fn reset_after_rotation(&mut self, now: Instant) {
        self.carried += now.duration_since(self.started_at);
        self.started_at = now;
        self.pending.clear();
        self.display_buffer.clear();
        self.committed.clear();
    }
}

fn aggregate(
    samples: &[Sample],
    started_at: Instant,
    carried: Duration,
    source: &str,
) -> Option<AggregateRow> {
    let last = samples.last()?;
    let n = samples.len() as f64;
    Some(AggregateRow {
        elapsed_seconds: carried.as_secs_f64()
            + last.at.duration_since(started_at).as_secs_f64(),
        cpu_percent: samples.iter().map(|s| s.cpu_percent).sum::<f64>() / n,
        memory_mb: samples.iter().map(|s| s.memory_mb).sum::<f64>() / n,
        source: source.to_string(),
    })
}

/// Where and how often a session's rows become durable. One policy
/// lives for one monitoring window.
pub struct RotationPolicy {
    target: Option<PathBuf>,
    format: OutputFormat,
    threshold: Duration,
    header_written: bool,
    retry_after: Option<Instant>,
}

impl RotationPolicy {
    pub fn new(target: Option<PathBuf>, format: OutputFormat, threshold: Duration) -> Self {
        RotationPolicy {
            target,
            format,
            threshold,
            header_written: false,
            retry_after: None,
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn target(&self) -> Option<&Path> {
        self.target.as_deref()
    }

    /// Whether the window has aged past the threshold with data on
    /// hand, honoring the cooldown after a failed save.
    fn due(&self, local_elapsed: f64, has_rows: bool, now: Instant) -> bool {
        if !has_rows || local_elapsed < self.threshold.as_secs_f64() {
            return false;
        }
        match self.retry_after {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// The output path, synthesized on first use and stable after
    /// that so every save in the window lands in one file.
    pub fn materialize(&mut self) -> PathBuf {
        match &self.target {
            Some(path) => path.clone(),
            None => {
                let path = persist::default_output_path(self.format);
                self.target = Some(path.clone());
                path
            }
        }
    }

    fn mark_written(&mut self) {
        self.header_written = true;
        self.retry_after = None;
    }

    fn mark_failed(&mut self, now: Instant) {
        self.retry_after = Some(now + ROTATION_RETRY_COOLDOWN);
    }

    fn write_all(&self, path: &Path, rows: &[AggregateRow]) -> Result<usize, PersistError> {
        if !self.header_written {
            persist::ensure_header(path, self.format)?;
        }
        persist::append_rows(path, self.format, rows)
    }
}

pub struct RotationOutcome {
    pub path: PathBuf,
    pub rows_written: usize,
    /// Rows that went to disk without ever reaching the display; the
    /// caller surfaces them so nothing saved goes unseen.
    pub batch: Vec<AggregateRow>,
}

/// Saves and resets the session if its window is over. On failure the
/// session keeps every row and the policy backs off before retrying.
pub fn maybe_rotate(
    session: &mut Session,
    policy: &mut RotationPolicy,
    now: Instant,
) -> Result<Option<RotationOutcome>, PersistError> {
    if !policy.due(session.local_elapsed(now), session.has_rows(), now) {
        return Ok(None);
    }
    let path = policy.materialize();
    let rows = session.snapshot_rows();
    let batch = session.undisplayed_rows();
    match policy.write_all(&path, &rows) {
        Ok(rows_written) => {
            policy.mark_written();
            session.reset_after_rotation(now);
            Ok(Some(RotationOutcome {
                path,
                rows_written,
                batch,
            }))
        }
        Err(err) => {
            policy.mark_failed(now);
            Err(err)
        }
    }
}

/// Final flush for a finished window: committed rows plus the closing
/// source block. A window that never showed a row writes nothing.
pub fn write_terminal(
    session: &Session,
    policy: &mut RotationPolicy,
) -> Result<Option<(PathBuf, usize)>, PersistError> {
    if session.committed_rows().is_empty() {
        return Ok(None);
    }
    let path = policy.materialize();
    if !policy.header_written {
        persist::ensure_header(&path, policy.format)?;
    }
    let written = persist::append_terminal(
        &path,
        policy.format,
        session.committed_rows(),
        session.source(),
    )?;
    policy.mark_written();
    Ok(Some((path, written)))
}
