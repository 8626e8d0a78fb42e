use std::path::{Path, PathBuf};
use std::sync::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};

/// A process the session can supervise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub exe: Option<PathBuf>,
}

impl ProcessInfo {
    /// Compares `wanted` against the process name and, when known, the file
    /// name of its executable. Linux truncates the former to 15 bytes.
    pub fn matches_name(&self, wanted: &str) -> bool {
        let wanted = normalize_process_name(wanted);
        let by_exe = self
            .exe
            .as_deref()
            .and_then(Path::file_name)
            .map(|file| normalize_process_name(&file.to_string_lossy()));
        std::iter::once(normalize_process_name(&self.name))
            .chain(by_exe)
            .any(|name| name.eq_ignore_ascii_case(&wanted))
    }
}

/// The slice of the OS process table the orchestrator needs.
pub trait ProcessTable: Send + Sync {
    /// Looks up a live process by id.
    fn find_by_pid(&self, pid: u32) -> Option<ProcessInfo>;

    /// All live processes whose normalized name equals `name`, ordered by pid.
    fn find_by_name(&self, name: &str) -> Vec<ProcessInfo>;

    fn is_alive(&self, pid: u32) -> bool {
        self.find_by_pid(pid).is_some()
    }
}

/// Strips directories and a trailing `.exe` (any case) so that `Game.exe`,
/// `C:\Games\Game.exe` and `Game` all compare equal.
pub fn normalize_process_name(name: &str) -> String {
    let file_name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match file_name.len().checked_sub(4) {
        Some(stem) if file_name.is_char_boundary(stem)
            && file_name[stem..].eq_ignore_ascii_case(".exe") =>
        {
            file_name[..stem].to_string()
        }
        _ => file_name.to_string(),
    }
}

/// `ProcessTable` backed by `sysinfo`.
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::nothing().with_exe(UpdateKind::OnlyIfNotSet)
    }

    fn info(pid: Pid, process: &sysinfo::Process) -> ProcessInfo {
        ProcessInfo {
            pid: pid.as_u32(),
            name: process.name().to_string_lossy().into_owned(),
            exe: process.exe().map(Path::to_path_buf),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SystemProcessTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProcessTable").finish_non_exhaustive()
    }
}

impl ProcessTable for SystemProcessTable {
    fn find_by_pid(&self, pid: u32) -> Option<ProcessInfo> {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        let pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            Self::refresh_kind(),
        );
        system
            .process(pid)
            // An exited child that nobody reaped yet is not a live target.
            .filter(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .map(|p| Self::info(pid, p))
    }

    fn find_by_name(&self, name: &str) -> Vec<ProcessInfo> {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, Self::refresh_kind());

        let mut found: Vec<ProcessInfo> = system
            .processes()
            .iter()
            .map(|(pid, p)| Self::info(*pid, p))
            .filter(|info| info.matches_name(name))
            .collect();
        found.sort_by_key(|p| p.pid);
        found
    }
}
