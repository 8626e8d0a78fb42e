pub mod binary;
pub mod cancel;
pub mod config;
pub mod error;
pub mod header;
pub mod injection;
pub mod process;
pub mod session;
pub mod staging;
pub mod watcher;

pub use binary::*;
pub use cancel::CancelToken;
pub use config::HostConfig;
pub use error::{HostError, Result};
pub use injection::{CommandInjector, CreateRequest, InjectionLibraries, InjectionService};
pub use process::{ProcessInfo, ProcessTable, SystemProcessTable};
pub use session::*;
pub use watcher::{LogLine, LogStream, LogWatch};
