//! Thin seam over sysinfo so the engine can be driven by a scripted
//! process table in tests.

use sysinfo::{
    CpuRefreshKind, Pid, Process, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cmdline: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeReading {
    /// Percent summed across cores, as sysinfo reports it.
    pub cpu_percent: f32,
    pub rss_bytes: u64,
}

pub trait MetricsSource: Send {
    fn own_pid(&self) -> u32;
    fn logical_cores(&self) -> usize;
    /// Snapshot of every running process with its command line.
    fn enumerate(&mut self) -> Vec<ProcessInfo>;
    fn info(&mut self, pid: u32) -> Option<ProcessInfo>;
    fn is_alive(&mut self, pid: u32) -> bool;
    /// One CPU/RSS reading, `None` once the process is gone.
    fn probe(&mut self, pid: u32) -> Option<ProbeReading>;
}

pub struct SysinfoSource {
    sys: System,
    cores: usize,
}

impl SysinfoSource {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_list(CpuRefreshKind::nothing());
        let cores = sys.cpus().len().max(1);
        SysinfoSource { sys, cores }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoSource {
    fn own_pid(&self) -> u32 {
        std::process::id()
    }

    fn logical_cores(&self) -> usize {
        self.cores
    }

    fn enumerate(&mut self) -> Vec<ProcessInfo> {
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        self.sys
            .processes()
            .iter()
            .map(|(pid, process)| describe(*pid, process))
            .collect()
    }

    fn info(&mut self, pid: u32) -> Option<ProcessInfo> {
        let target = Pid::from_u32(pid);
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        self.sys.process(target).map(|p| describe(target, p))
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        let target = Pid::from_u32(pid);
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::nothing(),
        );
        self.sys.process(target).is_some()
    }

    fn probe(&mut self, pid: u32) -> Option<ProbeReading> {
        let target = Pid::from_u32(pid);
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
        self.sys.process(target).map(|p| ProbeReading {
            cpu_percent: p.cpu_usage(),
            rss_bytes: p.memory(),
        })
    }
}

fn describe(pid: Pid, process: &Process) -> ProcessInfo {
    ProcessInfo {
        pid: pid.as_u32(),
        name: process.name().to_string_lossy().into_owned(),
        cmdline: process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect(),
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::{MetricsSource, ProbeReading, ProcessInfo};

    /// Scripted process table. A process stays alive for a fixed
    /// number of probes and serves canned CPU/RSS series, repeating
    /// the last value once a series runs out.
    pub(crate) struct FakeSource {
        own: u32,
        cores: usize,
        table: Vec<FakeProcess>,
    }

    pub(crate) struct FakeProcess {
        info: ProcessInfo,
        lifetime_probes: Option<usize>,
        probes_taken: usize,
        cpu_series: Vec<f32>,
        rss_series: Vec<u64>,
    }

    impl FakeProcess {
        fn alive(&self) -> bool {
            self.lifetime_probes.is_none_or(|n| self.probes_taken < n)
        }
    }

    impl FakeSource {
        pub fn new(own: u32, cores: usize) -> Self {
            FakeSource {
                own,
                cores,
                table: Vec::new(),
            }
        }

        pub fn with_process(
            mut self,
            pid: u32,
            name: &str,
            args: &[&str],
            lifetime_probes: Option<usize>,
            cpu_series: &[f32],
            rss_series: &[u64],
        ) -> Self {
            self.table.push(FakeProcess {
                info: ProcessInfo {
                    pid,
                    name: name.to_string(),
                    cmdline: args.iter().map(|a| a.to_string()).collect(),
                },
                lifetime_probes,
                probes_taken: 0,
                cpu_series: cpu_series.to_vec(),
                rss_series: rss_series.to_vec(),
            });
            self
        }

        pub fn probes_taken(&self, pid: u32) -> usize {
            self.table
                .iter()
                .find(|p| p.info.pid == pid)
                .map_or(0, |p| p.probes_taken)
        }
    }

    fn series_at<T: Copy + Default>(series: &[T], idx: usize) -> T {
        series
            .get(idx)
            .or_else(|| series.last())
            .copied()
            .unwrap_or_default()
    }

    impl MetricsSource for FakeSource {
        fn own_pid(&self) -> u32 {
            self.own
        }

        fn logical_cores(&self) -> usize {
            self.cores
        }

        fn enumerate(&mut self) -> Vec<ProcessInfo> {
            self.table
                .iter()
                .filter(|p| p.alive())
                .map(|p| p.info.clone())
                .collect()
        }

        fn info(&mut self, pid: u32) -> Option<ProcessInfo> {
            self.table
                .iter()
                .find(|p| p.info.pid == pid && p.alive())
                .map(|p| p.info.clone())
        }

        fn is_alive(&mut self, pid: u32) -> bool {
            self.table.iter().any(|p| p.info.pid == pid && p.alive())
        }

        fn probe(&mut self, pid: u32) -> Option<ProbeReading> {
            let process = self.table.iter_mut().find(|p| p.info.pid == pid)?;
            if !process.alive() {
                return None;
            }
            let idx = process.probes_taken;
            process.probes_taken += 1;
            Some(ProbeReading {
                cpu_percent: series_at(&process.cpu_series, idx),
                rss_bytes: series_at(&process.rss_series, idx),
            })
        }
    }
}
