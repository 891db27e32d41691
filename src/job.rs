//! Foreground job name and working directory
//!
//! Answers "what is running in this terminal and where" for display. The
//! answer is advisory: any lookup failure falls back to the last value that
//! was measured, and results are cached until a caller forces a refresh.

use std::fs;
use std::path::PathBuf;

use ptytask_pty::Pid;

/// Read access to the OS process table
pub trait ProcessInspector: Send {
    /// The process that represents foreground process group `pgid`
    fn group_representative(&self, pgid: Pid) -> Option<Pid>;

    /// Short command name of `pid`
    fn name(&self, pid: Pid) -> Option<String>;

    /// Current working directory of `pid`
    fn working_directory(&self, pid: Pid) -> Option<String>;
}

/// Inspector backed by `/proc`; reports nothing on systems without it
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcFs;

impl ProcFs {
    fn proc_path(pid: Pid, entry: &str) -> PathBuf {
        PathBuf::from(format!("/proc/{}/{}", pid.as_raw(), entry))
    }

    /// Process group from the contents of `/proc/<pid>/stat`
    fn parse_stat_pgrp(stat: &str) -> Option<i32> {
        // The command name may itself contain ") ", so split after the last one.
        let end = stat.rfind(')')?;
        let mut fields = stat.get(end + 2..)?.split_whitespace();
        // state, ppid, pgrp
        fields.nth(2)?.parse().ok()
    }
}

impl ProcessInspector for ProcFs {
    fn group_representative(&self, pgid: Pid) -> Option<Pid> {
        if !cfg!(target_os = "linux") {
            return None;
        }
        if Self::proc_path(pgid, "stat").exists() {
            return Some(pgid);
        }

        // The leader is gone; take the newest remaining member.
        fs::read_dir("/proc")
            .ok()?
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<i32>().ok())
            .filter(|&pid| {
                fs::read_to_string(format!("/proc/{pid}/stat"))
                    .ok()
                    .and_then(|stat| Self::parse_stat_pgrp(&stat))
                    == Some(pgid.as_raw())
            })
            .max()
            .map(Pid::from_raw)
    }

    fn name(&self, pid: Pid) -> Option<String> {
        let comm = fs::read_to_string(Self::proc_path(pid, "comm")).ok()?;
        let name = comm.trim_end_matches('\n');
        (!name.is_empty()).then(|| name.to_string())
    }

    fn working_directory(&self, pid: Pid) -> Option<String> {
        fs::read_link(Self::proc_path(pid, "cwd"))
            .ok()
            .map(|path| path.to_string_lossy().into_owned())
    }
}

/// One measurement of the foreground job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub name: String,
    pub working_directory: Option<String>,
    /// Incremented by every measurement
    pub token: u64,
}

/// Cached foreground job lookups for one session
pub struct JobResolver {
    inspector: Box<dyn ProcessInspector>,
    cached: Option<JobInfo>,
    next_token: u64,
}

impl std::fmt::Debug for JobResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobResolver")
            .field("cached", &self.cached)
            .finish_non_exhaustive()
    }
}

impl Default for JobResolver {
    fn default() -> Self {
        Self::new(Box::new(ProcFs))
    }
}

impl JobResolver {
    pub fn new(inspector: Box<dyn ProcessInspector>) -> Self {
        Self {
            inspector,
            cached: None,
            next_token: 1,
        }
    }

    /// Name of the foreground job in group `pgid`
    ///
    /// Measures only when forced or when nothing was measured yet.
    pub fn resolve_job(&mut self, pgid: Option<Pid>, force_refresh: bool) -> String {
        self.resolve(pgid, force_refresh).name.clone()
    }

    /// Working directory of the foreground job, same caching as [`Self::resolve_job`]
    pub fn resolve_working_directory(
        &mut self,
        pgid: Option<Pid>,
        force_refresh: bool,
    ) -> Option<String> {
        self.resolve(pgid, force_refresh).working_directory.clone()
    }

    pub fn cached(&self) -> Option<&JobInfo> {
        self.cached.as_ref()
    }

    fn resolve(&mut self, pgid: Option<Pid>, force_refresh: bool) -> &JobInfo {
        let info = match self.cached.take() {
            Some(info) if !force_refresh => info,
            last => self.measure(pgid, last),
        };
        self.cached.insert(info)
    }

    fn measure(&mut self, pgid: Option<Pid>, last: Option<JobInfo>) -> JobInfo {
        let pid = pgid.and_then(|pgid| self.inspector.group_representative(pgid));
        let name = pid.and_then(|pid| self.inspector.name(pid));
        let cwd = pid.and_then(|pid| self.inspector.working_directory(pid));

        let token = self.next_token;
        self.next_token += 1;

        if name.is_none() {
            tracing::trace!(?pgid, "foreground job lookup failed, keeping last value");
        }
        JobInfo {
            name: name
                .or_else(|| last.as_ref().map(|info| info.name.clone()))
                .unwrap_or_default(),
            working_directory: cwd.or_else(|| last.and_then(|info| info.working_directory)),
            token,
        }
    }
}
