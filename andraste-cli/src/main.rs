mod console;

use andraste_core::config::DEFAULT_FRAMEWORK_DLL;
use andraste_core::{
    Binary, CommandInjector, HostConfig, ModsSource, Orchestrator, Outcome, SessionRequest, Target,
};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

/// The Andraste game launcher
#[derive(Parser)]
#[command(
    name = "andraste",
    about = "Launch, monitor or attach to a game and load the Andraste mod framework into it",
    version,
    author
)]
struct Cli {
    /// Do not relay logs; print the PID and use it as the exit code
    #[arg(long, global = true, alias = "nonInteractive")]
    non_interactive: bool,

    /// Helper program that performs the injection
    #[arg(
        long,
        global = true,
        env = "ANDRASTE_INJECTOR",
        default_value = "andraste-injector"
    )]
    injector: PathBuf,

    /// Directory containing the framework libraries [default: the launcher's directory]
    #[arg(long, global = true, env = "ANDRASTE_BASE_DIR")]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Framework {
    /// Name of the framework dll, located in the base directory
    #[arg(long = "framework-dll", alias = "frameworkDll", default_value = DEFAULT_FRAMEWORK_DLL)]
    framework_dll: String,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct Mods {
    /// Path to a mods.json describing the enabled mods
    #[arg(long = "mods-json", alias = "modsJsonPath")]
    mods_json: Option<PathBuf>,

    /// Path to a mods folder; every mod in it is enabled
    #[arg(long = "mods-path", alias = "modsPath")]
    mods_path: Option<PathBuf>,
}

impl Mods {
    fn source(self) -> Result<ModsSource> {
        match (self.mods_json, self.mods_path) {
            (Some(json), None) => {
                if !json.is_file() {
                    bail!("File {} does not exist!", json.display());
                }
                Ok(ModsSource::Manifest(json))
            }
            (None, Some(folder)) => Ok(ModsSource::Folder(folder)),
            _ => bail!("Either --mods-json or --mods-path have to be specified"),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Launch an executable by path
    Launch {
        /// Path to the application's executable
        #[arg(long)]
        file: PathBuf,

        #[command(flatten)]
        framework: Framework,

        #[command(flatten)]
        mods: Mods,

        /// Command line passed to the application
        #[arg(long = "command-line", alias = "commandLine", default_value = "")]
        command_line: String,

        /// Patch 32-bit executables to use more than 2GB of memory
        #[arg(long)]
        large_address_aware: bool,
    },
    /// Wait for a process to start and attach to it
    Monitor {
        /// Process name or path of the executable to wait for
        #[arg(long)]
        file: String,

        #[command(flatten)]
        framework: Framework,

        #[command(flatten)]
        mods: Mods,
    },
    /// Attach to a running process
    Attach {
        /// The process id to attach to
        #[arg(long)]
        pid: u32,

        #[command(flatten)]
        framework: Framework,

        #[command(flatten)]
        mods: Mods,
    },
    /// Show the header of an executable
    Inspect {
        path: PathBuf,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let non_interactive = cli.non_interactive;

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            if non_interactive {
                let _ = Outcome::Detached(None).report(&mut std::io::stdout());
                Outcome::Detached(None).exit_code()
            } else {
                1
            }
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let config = match cli.base_dir {
        Some(dir) => HostConfig::new(dir),
        None => HostConfig::default(),
    };
    let interactive = !cli.non_interactive;
    log::debug!("Base directory: {}", config.base_dir.display());

    let (target, framework, mods) = match cli.command {
        Command::Inspect { path, json } => {
            let binary = Binary::inspect(&path)
                .with_context(|| format!("Could not inspect {}", path.display()))?;
            console::print_binary(&binary, json)?;
            return Ok(0);
        }
        Command::Launch {
            file,
            framework,
            mods,
            command_line,
            large_address_aware,
        } => {
            if !file.is_file() {
                bail!("File {} does not exist!", file.display());
            }
            let target = Target::NewProcess {
                application: file,
                command_line,
                large_address_aware,
            };
            (target, framework, mods)
        }
        Command::Monitor {
            file,
            framework,
            mods,
        } => (Target::DiscoverByName(file), framework, mods),
        Command::Attach {
            pid,
            framework,
            mods,
        } => (Target::ExistingPid(pid), framework, mods),
    };

    let framework_path = config.framework_path(&framework.framework_dll);
    if !framework_path.is_file() {
        bail!("File {} does not exist!", framework_path.display());
    }

    let orchestrator = Orchestrator::new(config, Box::new(CommandInjector::new(cli.injector)));
    let request = SessionRequest {
        target,
        framework: framework.framework_dll.into(),
        mods: mods.source()?,
        interactive,
    };

    let mut session = orchestrator.run(request)?;
    if let (true, Some(pid)) = (interactive, session.process_id()) {
        console::set_title(&console::attached_title(pid));
    }
    let outcome = orchestrator.post_launch(&mut session, console::relay)?;
    outcome.report(&mut std::io::stdout())?;
    if outcome == Outcome::LaunchFailed {
        eprintln!("{}", "Failed to launch the application!".red());
    }
    Ok(outcome.exit_code())
}
