use std::path::PathBuf;

use crate::{
    config::{ConfigManager, MonitorConfig, Overrides},
    event::{AppEvent, EngineEvent, Event, EventHandler},
    monitor::{self, MonitorHandle, session::AggregateRow},
    persist::{self, OutputFormat, timefmt},
};
use color_eyre::eyre::Result;
use log::*;
use tokio::sync::watch;

pub struct App {
    pub running: bool,
    pub events: EventHandler,
    pub config: ConfigManager,
    overrides: Overrides,
    config_tx: watch::Sender<MonitorConfig>,
    monitor: MonitorHandle,
    /// Everything printed for the current window, kept around so
    /// --export can write it out at the end.
    shown: Vec<AggregateRow>,
    window_source: Option<String>,
    export_path: Option<PathBuf>,
    banner_printed: bool,
}

impl App {
    pub fn new(
        config_path: PathBuf,
        overrides: Overrides,
        export_path: Option<PathBuf>,
    ) -> Result<Self> {
        let events = EventHandler::new();
        let config = ConfigManager::new(config_path, events.clone_sender())?;
        let mut monitor_config = config.current();
        overrides.apply(&mut monitor_config);
        monitor_config.validate()?;
        let (config_tx, config_rx) = watch::channel(monitor_config);
        let monitor = monitor::spawn(config_rx, events.clone_sender());
        Ok(Self {
            running: true,
            events,
            config,
            overrides,
            config_tx,
            monitor,
            shown: Vec::new(),
            window_source: None,
            export_path,
            banner_printed: false,
        })
    }

    /// Run the application's main loop.
    pub async fn run(&mut self) -> Result<()> {
        while self.running {
            match self.events.next().await? {
                Event::Engine(event) => self.handle_engine_event(event),
                Event::App(app_event) => match app_event {
                    AppEvent::Reload => self.reload_config(),
                    AppEvent::Quit => self.quit(),
                },
            }
        }
        Ok(())
    }

    fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Searching => {
                info!(target: "App", "Searching for a training process...");
            }
            EngineEvent::WindowStarted { descriptor, .. } => {
                self.shown.clear();
                self.banner_printed = false;
                info!(target: "App", "Monitoring {}", descriptor);
                self.window_source = Some(descriptor);
            }
            EngineEvent::SampleBatch(rows) => self.show_rows(rows),
            EngineEvent::RotationOccurred {
                path,
                rows_written,
                batch,
            } => {
                self.show_rows(batch);
                info!(target: "App", "Auto-saved {} rows to {:?}", rows_written, path);
            }
            EngineEvent::PersistenceFailed { path, message } => {
                warn!(target: "App", "Save to {:?} failed: {}", path, message);
            }
            EngineEvent::ProcessEnded { reason } => {
                info!(target: "App", "Monitoring ended: {}", reason);
            }
            EngineEvent::TerminalSaved { path, rows_written } => {
                info!(target: "App", "Saved {} rows to {:?}", rows_written, path);
            }
            EngineEvent::WindowFinished { .. } => self.export_window(),
            EngineEvent::Stopped => self.running = false,
        }
    }

    fn show_rows(&mut self, rows: Vec<AggregateRow>) {
        if rows.is_empty() {
            return;
        }
        if !self.banner_printed {
            println!("{}", banner());
            self.banner_printed = true;
        }
        for row in &rows {
            println!("{}", render_row(row));
        }
        self.shown.extend(rows);
    }

    fn export_window(&mut self) {
        let Some(path) = &self.export_path else {
            return;
        };
        if self.shown.is_empty() {
            debug!(target: "App", "Nothing was displayed, skipping export");
            return;
        }
        let source = self.window_source.clone().unwrap_or_default();
        match persist::write_snapshot(path, OutputFormat::from_path(path), &self.shown, &source) {
            Ok(rows) => info!(target: "App", "Exported {} rows to {:?}", rows, path),
            Err(e) => error!(target: "App", "Export failed: {}", e),
        }
    }

    /// Asks the engine to wind down; the loop ends when it reports
    /// [`EngineEvent::Stopped`].
    fn quit(&mut self) {
        info!(target: "App", "Shutting down...");
        self.monitor.stop();
    }

    fn reload_config(&mut self) {
        debug!(target: "App", "Reload!");
        match self.config.reload() {
            Ok(mut config) => {
                self.overrides.apply(&mut config);
                if let Some(e) = config.validate().err() {
                    error!(target: "App", "Keeping the old config: {}", e);
                    return;
                }
                let _ = self.config_tx.send(config);
                info!(target: "App", "Config reloaded, applies from the next window");
            }
            Err(e) => error!(target: "App", "{}", e),
        }
    }
}

fn banner() -> String {
    format!(
        "{:<15} {:<10} {:<12} {}",
        "Elapsed Time", "CPU (%)", "RAM (MB)", "Source"
    )
}

fn render_row(row: &AggregateRow) -> String {
    format!(
        "{:<15} {:<10.2} {:<12.2} {}",
        timefmt::format_elapsed(row.elapsed_seconds),
        row.cpu_percent,
        row.memory_mb,
        row.source
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(elapsed: f64, cpu: f64, mem: f64) -> AggregateRow {
        AggregateRow {
            elapsed_seconds: elapsed,
            cpu_percent: cpu,
            memory_mb: mem,
            source: "Python: python train.py".to_string(),
        }
    }

    #[test]
    fn rendered_rows_line_up_under_the_banner() {
        let banner = banner();
        let line = render_row(&row(3661.5, 12.3456, 255.999));
        assert_eq!(
            banner.find("CPU").expect("banner"),
            line.find("12.35").expect("cpu cell")
        );
        assert_eq!(
            banner.find("RAM").expect("banner"),
            line.find("256.00").expect("ram cell")
        );
        assert_eq!(
            banner.find("Source").expect("banner"),
            line.find("Python:").expect("source cell")
        );
    }

    #[test]
    fn row_cells_use_clock_time_and_two_decimals() {
        let line = render_row(&row(61.0, 9.5, 128.4));
        assert_eq!(line, "0:01:01.000     9.50       128.40       Python: python train.py");
    }
}
