//! The monitoring engine: one task that hunts for a target process,
//! samples it on a fixed grid, and turns samples into displayed and
//! saved rows. The application talks to it only through events and a
//! closer.

pub mod flush;
pub mod locate;
pub mod probe;
pub mod sampler;
pub mod session;

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::*;
use tokio::{
    select,
    sync::{mpsc::Sender, oneshot, watch},
    task::JoinHandle,
    time::{self, Instant},
};
use uuid::Uuid;

use crate::{
    config::MonitorConfig,
    event::{EngineEvent, Event},
    monitor::{
        flush::FlushController,
        locate::{Locator, TargetProcess},
        probe::{MetricsSource, SysinfoSource},
        sampler::{EndReason, Sampler},
        session::{RotationPolicy, Session, maybe_rotate, write_terminal},
    },
};

/// Pause between target searches that come up empty.
const SEARCH_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum EngineState {
    Idle,
    /// Holds the config snapshot the coming window will run under;
    /// reloads apply from the next pass through Idle.
    Searching(MonitorConfig),
    Monitoring(MonitorConfig, TargetProcess),
    Finished { stop: bool },
}

#[derive(Debug)]
pub struct MonitorHandle {
    closer: Option<oneshot::Receiver<()>>,
    pub task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Asks the engine to wind down. It flushes, saves and reports
    /// [`EngineEvent::Stopped`] before its task returns.
    pub fn stop(&mut self) {
        drop(self.closer.take());
    }
}

pub fn spawn(config: watch::Receiver<MonitorConfig>, sender: Sender<Event>) -> MonitorHandle {
    let (closed, closer) = oneshot::channel();
    let task = tokio::spawn(engine_loop(SysinfoSource::new(), config, sender, closed));
    MonitorHandle {
        closer: Some(closer),
        task,
    }
}

async fn engine_loop<S: MetricsSource>(
    mut source: S,
    mut config_rx: watch::Receiver<MonitorConfig>,
    sender: Sender<Event>,
    mut closed: oneshot::Sender<()>,
) {
    let mut state = EngineState::Idle;
    // A synthesized output path outlives its window so every window of
    // this run appends to the same file.
    let mut output_path: Option<PathBuf> = None;
    loop {
        state = match state {
            EngineState::Idle => EngineState::Searching(config_rx.borrow_and_update().clone()),
            EngineState::Searching(config) => {
                let _ = sender.send(Event::Engine(EngineEvent::Searching)).await;
                match search(&mut source, &config, &mut closed).await {
                    Some(target) => EngineState::Monitoring(config, target),
                    None => EngineState::Finished { stop: true },
                }
            }
            EngineState::Monitoring(config, target) => {
                let reason = run_window(
                    &mut source,
                    &config,
                    target,
                    &sender,
                    &mut closed,
                    &mut output_path,
                )
                .await;
                EngineState::Finished {
                    stop: reason == EndReason::Stopped || config.once,
                }
            }
            EngineState::Finished { stop } => {
                if stop {
                    break;
                }
                debug!(target: "Monitor", "Window closed, going back to the hunt");
                EngineState::Idle
            }
        };
    }
    let _ = sender.send(Event::Engine(EngineEvent::Stopped)).await;
}

async fn search<S: MetricsSource>(
    source: &mut S,
    config: &MonitorConfig,
    closed: &mut oneshot::Sender<()>,
) -> Option<TargetProcess> {
    let locator = Locator::from_config(config);
    info!(target: "Monitor", "Looking for a process to watch...");
    loop {
        if let Some(target) = locator.locate(source) {
            return Some(target);
        }
        select! {
            _ = time::sleep(SEARCH_RETRY) => {}
            _ = closed.closed() => return None,
        }
    }
}

async fn run_window<S: MetricsSource>(
    source: &mut S,
    config: &MonitorConfig,
    target: TargetProcess,
    sender: &Sender<Event>,
    closed: &mut oneshot::Sender<()>,
    output_path: &mut Option<PathBuf>,
) -> EndReason {
    let window = Uuid::new_v4();
    let started = Instant::now();
    let mut session = Session::begin(target.descriptor.clone(), started);
    let mut policy = RotationPolicy::new(
        config.autosave_path.clone().or_else(|| output_path.clone()),
        config.output_format(),
        Duration::from_secs_f64(config.autosave_threshold),
    );
    let mut flush = FlushController::new(
        config.display,
        config.sampling_rate,
        config.sampler_interval,
    );
    let mut sampler = Sampler::attach(source, &target, config, started);
    info!(target: "Monitor", "Window {} watching {}", window, target.descriptor);
    let _ = sender
        .send(Event::Engine(EngineEvent::WindowStarted {
            window,
            descriptor: target.descriptor.clone(),
        }))
        .await;

    let reason = loop {
        let step = select! {
            step = sampler.next(source) => step,
            _ = closed.closed() => Err(EndReason::Stopped),
        };
        match step {
            Ok(sample) => {
                session.push_sample(sample);
                if flush.should_aggregate(session.pending_len()) {
                    session.aggregate_pending();
                }
                let now = Instant::now();
                match maybe_rotate(&mut session, &mut policy, now) {
                    Ok(Some(outcome)) => {
                        flush.reset_after_rotation();
                        info!(
                            target: "Monitor",
                            "Auto-saved {} rows to {:?}",
                            outcome.rows_written,
                            outcome.path
                        );
                        let _ = sender
                            .send(Event::Engine(EngineEvent::RotationOccurred {
                                path: outcome.path,
                                rows_written: outcome.rows_written,
                                batch: outcome.batch,
                            }))
                            .await;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(target: "Monitor", "Auto-save failed, keeping rows: {err}");
                        let _ = sender
                            .send(Event::Engine(EngineEvent::PersistenceFailed {
                                path: materialized(&policy),
                                message: err.to_string(),
                            }))
                            .await;
                    }
                }
                if session.has_buffered() && flush.should_flush(session.local_elapsed(now)) {
                    let batch = session.commit_display_buffer();
                    let _ = sender
                        .send(Event::Engine(EngineEvent::SampleBatch(batch)))
                        .await;
                }
            }
            Err(reason) => break reason,
        }
    };

    info!(target: "Monitor", "Window {} over: {}", window, reason);
    session.aggregate_pending();
    if session.has_buffered() {
        let batch = session.commit_display_buffer();
        let _ = sender
            .send(Event::Engine(EngineEvent::SampleBatch(batch)))
            .await;
    }
    let _ = sender
        .send(Event::Engine(EngineEvent::ProcessEnded { reason }))
        .await;
    match write_terminal(&session, &mut policy) {
        Ok(Some((path, rows_written))) => {
            info!(target: "Monitor", "Saved {} rows to {:?}", rows_written, path);
            let _ = sender
                .send(Event::Engine(EngineEvent::TerminalSaved { path, rows_written }))
                .await;
        }
        Ok(None) => debug!(target: "Monitor", "Window {} had nothing to save", window),
        Err(err) => {
            warn!(target: "Monitor", "Final save failed: {err}");
            let _ = sender
                .send(Event::Engine(EngineEvent::PersistenceFailed {
                    path: materialized(&policy),
                    message: err.to_string(),
                }))
                .await;
        }
    }
    let _ = sender
        .send(Event::Engine(EngineEvent::WindowFinished { window }))
        .await;
    if let Some(path) = policy.target() {
        *output_path = Some(path.to_path_buf());
    }
    reason
}

fn materialized(policy: &RotationPolicy) -> PathBuf {
    policy.target().map(Path::to_path_buf).unwrap_or_default()
}
