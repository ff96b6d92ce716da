//! Pulls one reading per tick from the metrics source and watches for
//! the ways a target can stop being worth sampling.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::{self, Instant};

use super::locate::{ProcessKind, TargetProcess};
use super::probe::MetricsSource;
use crate::config::MonitorConfig;

/// One probe reading, CPU already normalized across cores and RSS
/// converted to MB.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub at: Instant,
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    ProcessTerminated,
    SentinelRemoved,
    ProbeStalled,
    Idle,
    Stopped,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            EndReason::ProcessTerminated => "process terminated",
            EndReason::SentinelRemoved => "sentinel file removed",
            EndReason::ProbeStalled => "metrics probe stalled",
            EndReason::Idle => "process idle too long",
            EndReason::Stopped => "stopped by user",
        };
        write!(f, "{text}")
    }
}

struct IdleTracker {
    cpu_floor: f64,
    grace: Duration,
    quiet_since: Option<Instant>,
}

impl IdleTracker {
    /// True once readings have stayed under the floor for the whole
    /// grace period.
    fn observe(&mut self, cpu_percent: f64, now: Instant) -> bool {
        if cpu_percent < self.cpu_floor {
            let since = *self.quiet_since.get_or_insert(now);
            now.duration_since(since) >= self.grace
        } else {
            self.quiet_since = None;
            false
        }
    }
}

pub struct Sampler {
    pid: u32,
    interval: Duration,
    cores: f64,
    watch_sentinel: Option<PathBuf>,
    probe_timeout: Duration,
    idle: Option<IdleTracker>,
    next_tick: Instant,
}

impl Sampler {
    /// Primes the target's CPU counter and schedules the first tick.
    pub fn attach(
        source: &mut dyn MetricsSource,
        target: &TargetProcess,
        config: &MonitorConfig,
        started: Instant,
    ) -> Self {
        // The first reading after attach measures from zero; take it
        // now and throw it away.
        let _ = source.probe(target.pid);
        let interval = Duration::from_secs_f64(config.sampler_interval);
        let watch_sentinel =
            (target.kind == ProcessKind::Matlab).then(|| config.sentinel_path.clone());
        let idle = config.idle.enabled.then(|| IdleTracker {
            cpu_floor: config.idle.cpu_percent,
            grace: Duration::from_secs_f64(config.idle.grace_seconds),
            quiet_since: None,
        });
        Sampler {
            pid: target.pid,
            interval,
            cores: source.logical_cores().max(1) as f64,
            watch_sentinel,
            probe_timeout: Duration::from_secs_f64(config.probe_timeout),
            idle,
            next_tick: started + interval,
        }
    }

    /// Waits for the next tick and takes a reading. `Err` means the
    /// window is over and carries the reason.
    pub async fn next(&mut self, source: &mut dyn MetricsSource) -> Result<Sample, EndReason> {
        time::sleep_until(self.next_tick).await;
        let tick_start = Instant::now();

        if let Some(path) = &self.watch_sentinel {
            if !path.exists() {
                return Err(EndReason::SentinelRemoved);
            }
        }
        if !source.is_alive(self.pid) {
            return Err(EndReason::ProcessTerminated);
        }

        // The probe blocks, so its duration is measured on the wall
        // clock rather than the tokio one.
        let probe_started = std::time::Instant::now();
        let reading = source.probe(self.pid);
        let probe_took = probe_started.elapsed();
        let Some(reading) = reading else {
            return Err(EndReason::ProcessTerminated);
        };
        if probe_took > self.probe_timeout {
            return Err(EndReason::ProbeStalled);
        }

        let cpu_percent = reading.cpu_percent as f64 / self.cores;
        let memory_mb = reading.rss_bytes as f64 / (1024.0 * 1024.0);
        if let Some(idle) = &mut self.idle {
            if idle.observe(cpu_percent, tick_start) {
                return Err(EndReason::Idle);
            }
        }

        // A late tick shifts the schedule instead of letting a backlog
        // of instant ticks build up.
        self.next_tick = Instant::now().max(tick_start + self.interval);
        Ok(Sample {
            at: tick_start,
            cpu_percent,
            memory_mb,
        })
    }
}
