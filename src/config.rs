//! Provides a ConfigManager to read, validate and refresh config from
//! files, plus the command line overrides folded in on top.
//!

use color_eyre::Result;
use log::*;
use notify::{RecommendedWatcher, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc::Sender;

use crate::event::{AppEvent, Event};
use crate::persist::{self, OutputFormat};

pub const DEFAULT_FILE: &str = "trainwatch.toml";

pub const MIN_SAMPLING_RATE: f64 = 0.1;
pub const MAX_SAMPLING_RATE: f64 = 10.0;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    /// Every aggregated row prints as soon as it exists.
    Realtime,
    /// Rows are held back and printed in batches on a growing cadence.
    #[default]
    Buffered,
}

/// Optional cutoff for targets that have gone quiet. Stays off unless
/// switched on in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdlePolicy {
    pub enabled: bool,
    pub cpu_percent: f64,
    pub grace_seconds: f64,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        IdlePolicy {
            enabled: false,
            cpu_percent: 1.0,
            grace_seconds: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds of samples averaged into each displayed row.
    pub sampling_rate: f64,
    /// Seconds between probes of the target process.
    pub sampler_interval: f64,
    pub display: DisplayMode,
    pub format: OutputFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autosave_path: Option<PathBuf>,
    /// Seconds a save window may grow before its rows rotate to disk.
    pub autosave_threshold: f64,
    /// File MATLAB jobs drop their pid into.
    pub sentinel_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Seconds a single probe may take before the target counts as
    /// unresponsive.
    pub probe_timeout: f64,
    /// Exit after the first window instead of searching again.
    pub once: bool,
    pub idle: IdlePolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            sampling_rate: 1.0,
            sampler_interval: 0.1,
            display: DisplayMode::default(),
            format: OutputFormat::default(),
            autosave_path: None,
            autosave_threshold: 3600.0,
            sentinel_path: default_sentinel_path(),
            pid: None,
            probe_timeout: 10.0,
            once: false,
            idle: IdlePolicy::default(),
        }
    }
}

fn default_sentinel_path() -> PathBuf {
    std::env::temp_dir().join("training_pid.txt")
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_SAMPLING_RATE..=MAX_SAMPLING_RATE).contains(&self.sampling_rate) {
            return Err(ConfigError::SamplingRate(self.sampling_rate));
        }
        if self.sampler_interval <= 0.0 || self.sampler_interval > self.sampling_rate {
            return Err(ConfigError::SamplerInterval {
                interval: self.sampler_interval,
                rate: self.sampling_rate,
            });
        }
        if self.autosave_threshold <= 0.0 {
            return Err(ConfigError::AutosaveThreshold(self.autosave_threshold));
        }
        if self.probe_timeout <= 0.0 {
            return Err(ConfigError::ProbeTimeout(self.probe_timeout));
        }
        if self.idle.enabled && (self.idle.cpu_percent <= 0.0 || self.idle.grace_seconds <= 0.0) {
            return Err(ConfigError::IdlePolicy {
                cpu: self.idle.cpu_percent,
                grace: self.idle.grace_seconds,
            });
        }
        Ok(())
    }

    /// An explicit autosave path decides the format; otherwise the
    /// format field does.
    pub fn output_format(&self) -> OutputFormat {
        match &self.autosave_path {
            Some(path) => OutputFormat::from_path(path),
            None => self.format,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("sampling rate {0}s is outside the {min}..={max} second range", min = MIN_SAMPLING_RATE, max = MAX_SAMPLING_RATE)]
    SamplingRate(f64),
    #[error("sampler interval {interval}s must be positive and no longer than the {rate}s sampling rate")]
    SamplerInterval { interval: f64, rate: f64 },
    #[error("autosave threshold {0}s must be positive")]
    AutosaveThreshold(f64),
    #[error("probe timeout {0}s must be positive")]
    ProbeTimeout(f64),
    #[error("idle policy needs a positive cpu floor and grace period, got {cpu}% and {grace}s")]
    IdlePolicy { cpu: f64, grace: f64 },
}

/// Command line switches, applied on top of the file on every load
/// and reload.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub sampling_rate: Option<f64>,
    pub display: Option<DisplayMode>,
    pub format: Option<OutputFormat>,
    pub name: Option<String>,
    pub autosave_path: Option<PathBuf>,
    pub pid: Option<u32>,
    pub once: bool,
}

impl Overrides {
    pub fn apply(&self, config: &mut MonitorConfig) {
        if let Some(rate) = self.sampling_rate {
            config.sampling_rate = rate;
        }
        if let Some(display) = self.display {
            config.display = display;
        }
        if let Some(format) = self.format {
            config.format = format;
        }
        if let Some(pid) = self.pid {
            config.pid = Some(pid);
        }
        if self.once {
            config.once = true;
        }
        if let Some(path) = &self.autosave_path {
            config.autosave_path = Some(path.clone());
        } else if let Some(name) = &self.name {
            // --name picks the file; an explicit --autosave wins.
            let format = self
                .format
                .unwrap_or_else(|| name_format(name).unwrap_or(config.format));
            config.autosave_path = Some(persist::named_output_path(name, format));
        }
    }
}

fn name_format(name: &str) -> Option<OutputFormat> {
    let ext = Path::new(name).extension()?.to_str()?;
    if ext.eq_ignore_ascii_case("xlsx") {
        Some(OutputFormat::Xlsx)
    } else if ext.eq_ignore_ascii_case("csv") {
        Some(OutputFormat::Csv)
    } else {
        None
    }
}

/// Reads the file, which may be absent, then folds in any
/// TRAINWATCH_* environment variables.
pub fn load(file_path: PathBuf) -> Result<MonitorConfig> {
    let raw = config::Config::builder()
        .add_source(config::File::from(file_path).required(false))
        .add_source(config::Environment::with_prefix("TRAINWATCH"))
        .build()?;
    Ok(raw.try_deserialize()?)
}

#[derive(Debug)]
pub struct ConfigManager {
    pub file_path: PathBuf,
    config: MonitorConfig,
    _watcher: Option<RecommendedWatcher>,
}

impl ConfigManager {
    pub fn new(file_path: PathBuf, sender: Sender<Event>) -> Result<ConfigManager> {
        let watcher = if file_path.exists() {
            let captured = sender.clone();
            let mut watcher = notify::recommended_watcher(move |_| {
                let _ = captured.try_send(Event::App(AppEvent::Reload));
            })?;
            info!(target: "Config", "Watching file {:?}", file_path);
            watcher.watch(&file_path, notify::RecursiveMode::NonRecursive)?;
            Some(watcher)
        } else {
            debug!(target: "Config", "No config file at {:?}", file_path);
            None
        };
        Ok(ConfigManager {
            file_path: file_path.clone(),
            config: load(file_path)?,
            _watcher: watcher,
        })
    }

    pub fn current(&self) -> MonitorConfig {
        self.config.clone()
    }

    pub fn reload(&mut self) -> Result<MonitorConfig> {
        self.config = load(self.file_path.clone())?;
        Ok(self.current())
    }
}
