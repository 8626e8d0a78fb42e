use crate::binary::patch_large_address_aware;
use crate::cancel::CancelToken;
use crate::config::{HostConfig, ERROR_LOG, MODS_MANIFEST, OUTPUT_LOG};
use crate::error::{HostError, Result};
use crate::injection::{CreateRequest, InjectionLibraries, InjectionService};
use crate::process::{normalize_process_name, ProcessInfo, ProcessTable, SystemProcessTable};
use crate::staging::{redirect_source, ConfigStager, FolderManifestBuilder, FsConfigStager, ManifestBuilder};
use crate::watcher::{LogLine, LogStream, LogWatch};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Launch,
    Monitor,
    Attach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    PreLaunchReady,
    TargetAcquired,
    Supervising,
    Terminated,
}

/// Where the mod list comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModsSource {
    /// An existing `mods.json`; its directory is the profile folder.
    Manifest(PathBuf),
    /// A folder whose sub-directories are all enabled. A manifest is generated
    /// in the folder's parent, which becomes the profile folder.
    Folder(PathBuf),
}

/// How the target process is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    NewProcess {
        application: PathBuf,
        command_line: String,
        large_address_aware: bool,
    },
    DiscoverByName(String),
    ExistingPid(u32),
}

impl Target {
    pub fn mode(&self) -> Mode {
        match self {
            Target::NewProcess { .. } => Mode::Launch,
            Target::DiscoverByName(_) => Mode::Monitor,
            Target::ExistingPid(_) => Mode::Attach,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub target: Target,
    /// Framework library, resolved against the base directory unless absolute.
    pub framework: PathBuf,
    pub mods: ModsSource,
    pub interactive: bool,
}

/// One supervised run of a target process.
#[derive(Debug, Clone)]
pub struct Session {
    pub mode: Mode,
    pub process: Option<ProcessInfo>,
    pub profile_folder: PathBuf,
    pub framework_library: PathBuf,
    pub interactive: bool,
    state: SessionState,
}

impl Session {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }

    fn advance(&mut self, state: SessionState) {
        log::debug!("Session {:?}: {:?} -> {:?}", self.mode, self.state, state);
        self.state = state;
    }
}

/// How supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Non-interactive hand-off; the caller manages the process from here.
    Detached(Option<u32>),
    /// Interactive run where no process was obtained.
    LaunchFailed,
    /// Interactive run that waited for the process to exit.
    Exited(u32),
}

impl Outcome {
    /// The pid doubles as the exit code for non-interactive runs so callers
    /// can read it without parsing output.
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Detached(Some(pid)) => i32::try_from(*pid).unwrap_or(-1),
            Outcome::Detached(None) => -1,
            Outcome::LaunchFailed => 1,
            Outcome::Exited(_) => 0,
        }
    }

    /// Writes the machine-readable line of a non-interactive run.
    pub fn report<W: Write>(&self, out: &mut W) -> io::Result<()> {
        if let Outcome::Detached(pid) = self {
            match pid {
                Some(pid) => writeln!(out, "{pid}")?,
                None => writeln!(out, "-1")?,
            }
        }
        Ok(())
    }
}

/// Drives a session from mod setup through injection to supervision.
pub struct Orchestrator {
    config: HostConfig,
    injector: Box<dyn InjectionService>,
    processes: Box<dyn ProcessTable>,
    stager: Box<dyn ConfigStager>,
    manifests: Box<dyn ManifestBuilder>,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(config: HostConfig, injector: Box<dyn InjectionService>) -> Self {
        Self {
            config,
            injector,
            processes: Box::new(SystemProcessTable::new()),
            stager: Box::new(FsConfigStager),
            manifests: Box::new(FolderManifestBuilder),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_process_table(mut self, processes: Box<dyn ProcessTable>) -> Self {
        self.processes = processes;
        self
    }

    pub fn with_config_stager(mut self, stager: Box<dyn ConfigStager>) -> Self {
        self.stager = stager;
        self
    }

    pub fn with_manifest_builder(mut self, manifests: Box<dyn ManifestBuilder>) -> Self {
        self.manifests = manifests;
        self
    }

    /// Token observed by process discovery and the exit wait.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Resolves the profile folder, generating `mods.json` when only a mods
    /// folder was given.
    pub fn pre_launch(&self, mods: &ModsSource) -> Result<PathBuf> {
        match mods {
            ModsSource::Manifest(manifest) => Ok(parent_dir(&std::path::absolute(manifest)?)),
            ModsSource::Folder(folder) => {
                if !folder.is_dir() {
                    log::info!("Creating mods folder {}", folder.display());
                    fs::create_dir_all(folder)?;
                }

                let folder = std::path::absolute(folder)?;
                let profile = parent_dir(&folder);
                let manifest = self.manifests.build_manifest(&folder)?;
                let manifest_path = profile.join(MODS_MANIFEST);
                fs::write(&manifest_path, manifest)?;
                log::info!("Wrote {}", manifest_path.display());
                Ok(profile)
            }
        }
    }

    pub fn launch(
        &self,
        application: impl Into<PathBuf>,
        framework: impl Into<PathBuf>,
        command_line: impl Into<String>,
        large_address_aware: bool,
        mods: ModsSource,
        interactive: bool,
    ) -> Result<Session> {
        self.run(SessionRequest {
            target: Target::NewProcess {
                application: application.into(),
                command_line: command_line.into(),
                large_address_aware,
            },
            framework: framework.into(),
            mods,
            interactive,
        })
    }

    pub fn monitor(
        &self,
        process_name: impl Into<String>,
        framework: impl Into<PathBuf>,
        mods: ModsSource,
        interactive: bool,
    ) -> Result<Session> {
        self.run(SessionRequest {
            target: Target::DiscoverByName(process_name.into()),
            framework: framework.into(),
            mods,
            interactive,
        })
    }

    pub fn attach(
        &self,
        pid: u32,
        framework: impl Into<PathBuf>,
        mods: ModsSource,
        interactive: bool,
    ) -> Result<Session> {
        self.run(SessionRequest {
            target: Target::ExistingPid(pid),
            framework: framework.into(),
            mods,
            interactive,
        })
    }

    /// Acquires the target and injects the framework library.
    ///
    /// Injection failures leave `session.process` empty rather than erroring,
    /// so supervision can report them the same way for every mode.
    pub fn run(&self, request: SessionRequest) -> Result<Session> {
        let mut session = Session {
            mode: request.target.mode(),
            process: None,
            profile_folder: PathBuf::new(),
            framework_library: self.config.framework_path(&request.framework),
            interactive: request.interactive,
            state: SessionState::Created,
        };

        let acquired = match request.target {
            Target::NewProcess {
                application,
                command_line,
                large_address_aware,
            } => {
                session.profile_folder = self.pre_launch(&request.mods)?;
                session.advance(SessionState::PreLaunchReady);
                self.start_process(&session, &application, command_line, large_address_aware)
            }
            Target::DiscoverByName(name) => {
                session.profile_folder = self.pre_launch(&request.mods)?;
                session.advance(SessionState::PreLaunchReady);
                let process = self.discover(&name)?;
                self.inject_running(&session, process)
            }
            Target::ExistingPid(pid) => {
                // Resolve before touching the disk so a stale pid changes nothing.
                let process = self
                    .processes
                    .find_by_pid(pid)
                    .ok_or(HostError::ProcessNotFound(pid))?;
                session.profile_folder = self.pre_launch(&request.mods)?;
                session.advance(SessionState::PreLaunchReady);
                self.inject_running(&session, process)
            }
        };

        session.process = match acquired {
            Ok(process) => process,
            Err(HostError::InjectionFailed(reason)) => {
                log::error!("Injection failed: {reason}");
                None
            }
            Err(e) => return Err(e),
        };
        session.advance(SessionState::TargetAcquired);
        Ok(session)
    }

    fn start_process(
        &self,
        session: &Session,
        application: &Path,
        command_line: String,
        large_address_aware: bool,
    ) -> Result<Option<ProcessInfo>> {
        self.stage_configs(&session.framework_library, application)?;

        if large_address_aware {
            if let Err(e) = patch_large_address_aware(application, true) {
                log::warn!(
                    "Could not make {} large address aware, launching unpatched: {e}",
                    application.display()
                );
            }
        }

        let request = CreateRequest {
            application: application.to_path_buf(),
            command_line,
            creation_flags: 0,
            libraries: InjectionLibraries::same(&session.framework_library),
            extra_args: vec![session.profile_folder.display().to_string()],
        };
        let pid = self.injector.create_and_inject(&request)?;
        log::info!("Started {} as PID {pid}", application.display());

        let process = self.processes.find_by_pid(pid);
        if process.is_none() {
            log::error!("Process {pid} is gone right after creation");
        }
        Ok(process)
    }

    fn inject_running(&self, session: &Session, process: ProcessInfo) -> Result<Option<ProcessInfo>> {
        match &process.exe {
            Some(exe) => self.stage_configs(&session.framework_library, exe)?,
            None => log::warn!(
                "Executable path of PID {} is unknown, skipping binding redirects",
                process.pid
            ),
        }

        self.injector.inject_into_running(
            process.pid,
            &InjectionLibraries::same(&session.framework_library),
            &[session.profile_folder.display().to_string()],
        )?;
        log::info!("Injected into PID {}", process.pid);
        Ok(Some(process))
    }

    /// Copies the framework's binding redirects next to the framework library
    /// and next to the application, both named after the application.
    fn stage_configs(&self, framework_library: &Path, application: &Path) -> Result<()> {
        let default_framework = self.config.framework_path(&self.config.default_framework);
        let Some(source) = redirect_source(framework_library, &default_framework) else {
            return Ok(());
        };
        let Some(app_name) = application.file_name() else {
            log::warn!("{} has no file name, skipping binding redirects", application.display());
            return Ok(());
        };
        let app_name = app_name.to_string_lossy();

        let mut targets = vec![parent_dir(framework_library), parent_dir(application)];
        targets.dedup();
        for dir in targets {
            self.stager.copy_config(&source, &dir, &app_name)?;
        }
        Ok(())
    }

    /// Polls the process table until a process called `name` shows up.
    fn discover(&self, name: &str) -> Result<ProcessInfo> {
        let wanted = normalize_process_name(name);
        log::info!("Waiting for {wanted} to start");

        loop {
            let found = self.processes.find_by_name(&wanted);
            if let Some(first) = found.first() {
                if found.len() > 1 {
                    log::warn!(
                        "{} processes named {wanted} are running, attaching to PID {}",
                        found.len(),
                        first.pid
                    );
                }
                return Ok(first.clone());
            }

            if !self.cancel.sleep(self.config.discovery_interval) {
                return Err(HostError::Cancelled);
            }
        }
    }

    /// Hands the process off (non-interactive) or relays its logs until it exits.
    pub fn post_launch<F>(&self, session: &mut Session, mut sink: F) -> Result<Outcome>
    where
        F: FnMut(LogLine),
    {
        session.advance(SessionState::Supervising);

        if !session.interactive {
            session.advance(SessionState::Terminated);
            return Ok(Outcome::Detached(session.process_id()));
        }

        let Some(pid) = session.process_id() else {
            log::error!("Failed to launch the application!");
            session.advance(SessionState::Terminated);
            return Ok(Outcome::LaunchFailed);
        };

        log::info!("Attached to PID {pid}");
        let (tx, rx) = mpsc::channel();
        let mut output = self.log_watch(&session.profile_folder, OUTPUT_LOG, LogStream::Output);
        let mut error = self.log_watch(&session.profile_folder, ERROR_LOG, LogStream::Error);
        output.start_with(tx.clone());
        error.start_with(tx.clone());

        let mut last_check = Instant::now();
        loop {
            if let Ok(line) = rx.recv_timeout(self.config.exit_poll_interval) {
                sink(line);
            }

            if last_check.elapsed() >= self.config.exit_poll_interval {
                last_check = Instant::now();
                if self.cancel.is_cancelled() || !self.processes.is_alive(pid) {
                    break;
                }
            }
        }

        // The writer is gone; pick up what it wrote since the last poll.
        output.stop_and_flush(&tx);
        error.stop_and_flush(&tx);
        drop(tx);
        rx.try_iter().for_each(&mut sink);

        log::info!("Process exited");
        session.advance(SessionState::Terminated);
        Ok(Outcome::Exited(pid))
    }

    /// `run` followed by `post_launch`.
    pub fn supervise<F>(&self, request: SessionRequest, sink: F) -> Result<Outcome>
    where
        F: FnMut(LogLine),
    {
        let mut session = self.run(request)?;
        self.post_launch(&mut session, sink)
    }

    fn log_watch(&self, profile: &Path, file: &str, stream: LogStream) -> LogWatch {
        LogWatch::new(profile.join(file), stream)
            .with_poll_interval(self.config.log_poll_interval)
            .with_create_backoff(self.config.log_create_backoff)
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_exit_codes() {
        assert_eq!(Outcome::Detached(Some(4321)).exit_code(), 4321);
        assert_eq!(Outcome::Detached(None).exit_code(), -1);
        assert_eq!(Outcome::LaunchFailed.exit_code(), 1);
        assert_eq!(Outcome::Exited(9).exit_code(), 0);
        assert_eq!(Outcome::Detached(Some(i32::MAX as u32)).exit_code(), i32::MAX);
        assert_eq!(Outcome::Detached(Some(u32::MAX)).exit_code(), -1);
    }

    #[test]
    fn outcome_report_only_for_detached() {
        let mut out = Vec::new();
        Outcome::Detached(Some(4321)).report(&mut out).unwrap();
        Outcome::Detached(None).report(&mut out).unwrap();
        Outcome::Exited(1).report(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "4321\n-1\n");
    }

    #[test]
    fn target_modes() {
        assert_eq!(Target::ExistingPid(1).mode(), Mode::Attach);
        assert_eq!(Target::DiscoverByName("Game".into()).mode(), Mode::Monitor);
        let launch = Target::NewProcess {
            application: "Game.exe".into(),
            command_line: String::new(),
            large_address_aware: false,
        };
        assert_eq!(launch.mode(), Mode::Launch);
    }

    #[test]
    fn parent_of_bare_file_is_cwd() {
        assert_eq!(parent_dir(Path::new("mods.json")), PathBuf::from("."));
        assert_eq!(parent_dir(Path::new("/a/b")), PathBuf::from("/a"));
    }
}
