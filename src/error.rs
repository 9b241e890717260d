//! Crate-wide error type.
//!
//! Every failure the update engine can surface maps onto one of these
//! variants. Variants carry enough context to print a single user-facing
//! failure line; the CLI wraps them in `anyhow` for context chains and maps
//! [`Error::ExitCode`] onto the process exit status.

use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Whether an import cycle was detected through local files or through
/// remote import repositories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    Local,
    Remote,
}

#[derive(Debug)]
pub enum Error {
    /// A project declared a protocol other than "git".
    UnsupportedProtocol { protocol: String, name: String },
    /// A file or directory the engine relies on does not exist.
    NotFound(PathBuf),
    /// The manifest import graph loops back on itself.
    CycleDetected {
        kind: CycleKind,
        /// The frame already on the stack and the frame that re-entered it.
        have: String,
        entered: String,
    },
    /// Two manifests declare the same project key with differing values.
    DuplicateProject { key: String, file: PathBuf },
    /// Two manifests declare the same tool name with differing values.
    DuplicateTool { name: String, file: PathBuf },
    /// A hook names a project that no manifest declares.
    DanglingHook { hook: String, project: String },
    /// A change-set reference or multi-part tag failed to parse.
    InvalidReference(String),
    /// A command outlived its configured deadline and was killed.
    CommandTimedOut { command: String, after: Duration },
    /// The VCS adapter failed; the message is the adapter's own output.
    Vcs(String),
    /// Filesystem failure outside the VCS adapter.
    Io(std::io::Error),
    /// Manifest or metadata bytes did not parse.
    Parse(String),
    /// A gc delete was refused because the project holds local work.
    ProjectNotClean { name: String, reason: String },
    /// A post-update hook exited unsuccessfully.
    HookFailed { name: String, detail: String },
    /// Sub-failure batch; the CLI exits with exactly this code.
    ExitCode(i32),
    /// Anything without a more specific shape.
    Message(String),
}

impl Error {
    pub fn message(msg: impl Into<String>) -> Self {
        Error::Message(msg.into())
    }

    /// The process exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ExitCode(code) => *code,
            _ => 1,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnsupportedProtocol { protocol, name } => {
                write!(f, "project {name:?} uses unsupported protocol {protocol:?} (only \"git\" is supported)")
            }
            Error::NotFound(path) => write!(f, "{} does not exist", path.display()),
            Error::CycleDetected {
                kind,
                have,
                entered,
            } => {
                let what = match kind {
                    CycleKind::Local => "local import",
                    CycleKind::Remote => "remote import",
                };
                write!(f, "{what} cycle: {have} is imported again via {entered}")
            }
            Error::DuplicateProject { key, file } => {
                write!(
                    f,
                    "duplicate project {key:?} with conflicting definition in {}",
                    file.display()
                )
            }
            Error::DuplicateTool { name, file } => {
                write!(
                    f,
                    "duplicate tool {name:?} with conflicting definition in {}",
                    file.display()
                )
            }
            Error::DanglingHook { hook, project } => {
                write!(f, "hook {hook:?} references unknown project {project:?}")
            }
            Error::InvalidReference(reference) => {
                write!(f, "invalid change reference {reference:?}")
            }
            Error::CommandTimedOut { command, after } => {
                write!(f, "command `{command}` timed out after {after:?}")
            }
            Error::Vcs(msg) => write!(f, "{}", msg.trim_end()),
            Error::Io(err) => write!(f, "{err}"),
            Error::Parse(msg) => write!(f, "{msg}"),
            Error::ProjectNotClean { name, reason } => {
                write!(f, "project {name:?} is not clean: {reason}")
            }
            Error::HookFailed { name, detail } => {
                write!(f, "hook {name:?} failed: {detail}")
            }
            Error::ExitCode(code) => write!(f, "exiting with code {code}"),
            Error::Message(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::Parse(format!("malformed manifest: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_defaults_to_one() {
        assert_eq!(Error::message("boom").exit_code(), 1);
        assert_eq!(Error::ExitCode(2).exit_code(), 2);
    }

    #[test]
    fn cycle_display_names_both_frames() {
        let err = Error::CycleDetected {
            kind: CycleKind::Local,
            have: "/ws/a.xml".to_string(),
            entered: "/ws/b.xml".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("/ws/a.xml"));
        assert!(text.contains("/ws/b.xml"));
    }
}
