use crate::error::{HostError, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Payload paths per target bitness. The service picks the one matching the
/// target; the launcher passes the same framework library for both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionLibraries {
    pub library32: PathBuf,
    pub library64: PathBuf,
}

impl InjectionLibraries {
    pub fn same(library: impl Into<PathBuf>) -> Self {
        let library = library.into();
        Self {
            library32: library.clone(),
            library64: library,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub application: PathBuf,
    pub command_line: String,
    /// Extra process creation flags, passed through untouched.
    pub creation_flags: u32,
    pub libraries: InjectionLibraries,
    /// Handed to the payload's entry point; the launcher sends the profile folder.
    pub extra_args: Vec<String>,
}

/// Creates or attaches to a process and loads a library into it.
pub trait InjectionService: Send + Sync {
    /// Starts `request.application` suspended, injects, resumes, and returns its pid.
    fn create_and_inject(&self, request: &CreateRequest) -> Result<u32>;

    fn inject_into_running(
        &self,
        pid: u32,
        libraries: &InjectionLibraries,
        extra_args: &[String],
    ) -> Result<()>;
}

/// Delegates injection to an external helper program.
///
/// `create` prints the new pid as its last stdout line; both commands signal
/// failure with a non-zero exit status.
#[derive(Debug, Clone)]
pub struct CommandInjector {
    program: PathBuf,
    leading_args: Vec<OsString>,
}

impl CommandInjector {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Arguments placed before the subcommand, e.g. a script for an interpreter.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn library_args(libraries: &InjectionLibraries) -> Vec<OsString> {
        vec![
            "--library32".into(),
            libraries.library32.clone().into(),
            "--library64".into(),
            libraries.library64.clone().into(),
        ]
    }

    fn run(&self, args: Vec<OsString>) -> Result<String> {
        log::debug!("Running injector {} {:?}", self.program.display(), args);
        let output = Command::new(&self.program)
            .args(&self.leading_args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| {
                HostError::InjectionFailed(format!(
                    "could not run {}: {e}",
                    self.program.display()
                ))
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(HostError::InjectionFailed(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }
        if !stderr.trim().is_empty() {
            log::debug!("injector: {}", stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Extracts the pid from the helper's output: the last non-empty line.
pub fn parse_pid(stdout: &str) -> Result<u32> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .ok_or_else(|| HostError::InjectionFailed("injector printed no pid".to_string()))?;
    line.parse()
        .map_err(|_| HostError::InjectionFailed(format!("injector printed {line:?} instead of a pid")))
}

impl InjectionService for CommandInjector {
    fn create_and_inject(&self, request: &CreateRequest) -> Result<u32> {
        let mut args: Vec<OsString> = vec!["create".into()];
        args.extend(Self::library_args(&request.libraries));
        args.push("--flags".into());
        args.push(request.creation_flags.to_string().into());
        args.push("--exe".into());
        args.push(request.application.clone().into());
        if !request.command_line.is_empty() {
            args.push("--command-line".into());
            args.push(request.command_line.clone().into());
        }
        args.push("--".into());
        args.extend(request.extra_args.iter().map(OsString::from));

        parse_pid(&self.run(args)?)
    }

    fn inject_into_running(
        &self,
        pid: u32,
        libraries: &InjectionLibraries,
        extra_args: &[String],
    ) -> Result<()> {
        let mut args: Vec<OsString> = vec!["inject".into(), "--pid".into(), pid.to_string().into()];
        args.extend(Self::library_args(libraries));
        args.push("--".into());
        args.extend(extra_args.iter().map(OsString::from));

        self.run(args).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_last_line_as_pid() {
        assert_eq!(parse_pid("4321\n").unwrap(), 4321);
        assert_eq!(parse_pid("injecting...\n  77 \n\n").unwrap(), 77);
        assert!(matches!(parse_pid(""), Err(HostError::InjectionFailed(_))));
        assert!(matches!(parse_pid("done\n"), Err(HostError::InjectionFailed(_))));
    }

    #[test]
    fn missing_helper_is_injection_failure() {
        let injector = CommandInjector::new("/nonexistent/andraste-injector");
        let request = CreateRequest {
            application: PathBuf::from("Game.exe"),
            command_line: String::new(),
            creation_flags: 0,
            libraries: InjectionLibraries::same("payload.dll"),
            extra_args: vec![],
        };
        assert!(matches!(
            injector.create_and_inject(&request),
            Err(HostError::InjectionFailed(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn runs_helper_and_reads_pid() {
        let dir = tempfile::tempdir().unwrap();
        let helper = dir.path().join("injector.sh");
        std::fs::write(&helper, "echo \"$1\" >&2\necho 4321\n").unwrap();

        let injector = CommandInjector::new("/bin/sh").with_leading_args([&helper]);
        let request = CreateRequest {
            application: PathBuf::from("Game.exe"),
            command_line: "-windowed".to_string(),
            creation_flags: 0,
            libraries: InjectionLibraries::same("payload.dll"),
            extra_args: vec!["/profiles/default".to_string()],
        };
        assert_eq!(injector.create_and_inject(&request).unwrap(), 4321);
        injector
            .inject_into_running(4321, &request.libraries, &request.extra_args)
            .unwrap();
    }
}
