//! Finds the process worth watching. Rules run in a fixed order so an
//! explicit `--pid` always beats the sentinel file, which beats
//! scanning for an interpreter running a script.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use log::*;

use super::probe::MetricsSource;
use crate::config::MonitorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Matlab,
    PythonScript,
    Unclassified,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessKind::Matlab => write!(f, "MATLAB"),
            ProcessKind::PythonScript => write!(f, "Python script"),
            ProcessKind::Unclassified => write!(f, "unclassified"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProcess {
    pub pid: u32,
    pub kind: ProcessKind,
    /// Human readable label, written into the Source column.
    pub descriptor: String,
}

pub trait ClassificationRule: Send {
    fn name(&self) -> &'static str;
    fn classify(&self, source: &mut dyn MetricsSource) -> Option<TargetProcess>;
}

/// Watches whatever pid the user asked for, no questions about what
/// it is.
pub struct PinnedPidRule {
    pid: u32,
}

impl PinnedPidRule {
    pub fn new(pid: u32) -> Self {
        PinnedPidRule { pid }
    }
}

impl ClassificationRule for PinnedPidRule {
    fn name(&self) -> &'static str {
        "pinned pid"
    }

    fn classify(&self, source: &mut dyn MetricsSource) -> Option<TargetProcess> {
        let info = source.info(self.pid)?;
        let command = if info.cmdline.is_empty() {
            info.name.clone()
        } else {
            join_cmdline(&info.cmdline)
        };
        Some(TargetProcess {
            pid: self.pid,
            kind: ProcessKind::Unclassified,
            descriptor: format!("PID {}: {command}", self.pid),
        })
    }
}

/// MATLAB jobs announce themselves by dropping their pid into a well
/// known file. The file may outlive the job, so the pid is verified
/// before use.
pub struct SentinelRule {
    path: PathBuf,
}

impl SentinelRule {
    pub fn new(path: PathBuf) -> Self {
        SentinelRule { path }
    }
}

impl ClassificationRule for SentinelRule {
    fn name(&self) -> &'static str {
        "sentinel file"
    }

    fn classify(&self, source: &mut dyn MetricsSource) -> Option<TargetProcess> {
        let text = fs::read_to_string(&self.path).ok()?;
        let pid: u32 = text.trim().parse().ok()?;
        let Some(info) = source.info(pid) else {
            debug!(target: "Locator", "sentinel names pid {pid} but nothing is running there");
            return None;
        };
        if !info.name.to_lowercase().contains("matlab") {
            debug!(target: "Locator", "sentinel pid {pid} is {:?}, not MATLAB", info.name);
            return None;
        }
        let command = join_cmdline(&info.cmdline);
        Some(TargetProcess {
            pid,
            kind: ProcessKind::Matlab,
            descriptor: format!("MATLAB (PID: {pid}) CMD: {command}"),
        })
    }
}

/// First python process running a .py script, skipping this monitor
/// itself.
pub struct InterpreterScriptRule;

impl ClassificationRule for InterpreterScriptRule {
    fn name(&self) -> &'static str {
        "python script"
    }

    fn classify(&self, source: &mut dyn MetricsSource) -> Option<TargetProcess> {
        let own = source.own_pid();
        for info in source.enumerate() {
            if info.pid == own {
                continue;
            }
            if !info.name.to_lowercase().contains("python") {
                continue;
            }
            if !info
                .cmdline
                .iter()
                .any(|arg| arg.to_lowercase().ends_with(".py"))
            {
                continue;
            }
            let command = join_cmdline(&info.cmdline);
            return Some(TargetProcess {
                pid: info.pid,
                kind: ProcessKind::PythonScript,
                descriptor: format!("Python: {command}"),
            });
        }
        None
    }
}

fn join_cmdline(args: &[String]) -> String {
    shlex::try_join(args.iter().map(String::as_str)).unwrap_or_else(|_| args.join(" "))
}

pub struct Locator {
    rules: Vec<Box<dyn ClassificationRule>>,
}

impl Locator {
    pub fn from_config(config: &MonitorConfig) -> Self {
        let mut rules: Vec<Box<dyn ClassificationRule>> = Vec::new();
        if let Some(pid) = config.pid {
            rules.push(Box::new(PinnedPidRule::new(pid)));
        }
        rules.push(Box::new(SentinelRule::new(config.sentinel_path.clone())));
        rules.push(Box::new(InterpreterScriptRule));
        Locator { rules }
    }

    #[cfg(test)]
    pub fn with_rules(rules: Vec<Box<dyn ClassificationRule>>) -> Self {
        Locator { rules }
    }

    pub fn locate(&self, source: &mut dyn MetricsSource) -> Option<TargetProcess> {
        for rule in &self.rules {
            if let Some(target) = rule.classify(source) {
                info!(
                    target: "Locator",
                    "{} rule matched pid {}: {}",
                    rule.name(),
                    target.pid,
                    target.descriptor
                );
                return Some(target);
            }
        }
        None
    }
}
