//! Event plumbing between the engine task and the application loop.

use std::path::PathBuf;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::monitor::sampler::EndReason;
use crate::monitor::session::AggregateRow;

/// Bound on in-flight events. The engine produces rows at a human
/// pace, so backpressure beats an unbounded queue.
pub const EVENT_CAPACITY: usize = 64;

#[derive(Debug)]
pub enum Event {
    Engine(EngineEvent),
    App(AppEvent),
}

#[derive(Debug)]
pub enum AppEvent {
    Reload,
    Quit,
}

/// What the engine reports as it hunts, samples and saves.
#[derive(Debug)]
pub enum EngineEvent {
    Searching,
    WindowStarted {
        window: Uuid,
        descriptor: String,
    },
    /// Aggregated rows ready for display, oldest first.
    SampleBatch(Vec<AggregateRow>),
    RotationOccurred {
        path: PathBuf,
        rows_written: usize,
        /// Saved rows the display had not shown yet.
        batch: Vec<AggregateRow>,
    },
    PersistenceFailed {
        path: PathBuf,
        message: String,
    },
    ProcessEnded {
        reason: EndReason,
    },
    TerminalSaved {
        path: PathBuf,
        rows_written: usize,
    },
    WindowFinished {
        window: Uuid,
    },
    /// Last event the engine sends before its task returns.
    Stopped,
}

#[derive(Debug)]
pub struct EventHandler {
    sender: mpsc::Sender<Event>,
    receiver: mpsc::Receiver<Event>,
}

impl EventHandler {
    /// Constructs the channel and starts the Ctrl-C listener.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel(EVENT_CAPACITY);
        let captured = sender.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    break;
                }
                if captured.send(Event::App(AppEvent::Quit)).await.is_err() {
                    break;
                }
            }
        });
        EventHandler { sender, receiver }
    }

    pub fn clone_sender(&self) -> mpsc::Sender<Event> {
        self.sender.clone()
    }

    pub fn send(&mut self, app_event: AppEvent) {
        let _ = self.sender.try_send(Event::App(app_event));
    }

    /// Receives the next event from the queue.
    pub async fn next(&mut self) -> Result<Event> {
        self.receiver
            .recv()
            .await
            .ok_or_else(|| eyre!("event channel closed unexpectedly"))
    }
}
