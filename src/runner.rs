//! External command execution.
//!
//! Every child process the pipeline starts (git, the backends' Python entry
//! points, ffmpeg) is described by a [`CommandSpec`] and executed through a
//! [`CommandRunner`], so tests can record invocations instead of spawning.

use duct::cmd;
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};

/// A fully described child process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    /// Variables set only when the parent environment does not define them.
    pub env_defaults: Vec<(OsString, OsString)>,
    /// Discard stdout/stderr instead of inheriting them.
    pub quiet: bool,
}

impl CommandSpec {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            cwd: None,
            env_defaults: Vec::new(),
            quiet: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env_default(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env_defaults
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn program_lossy(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Position of `flag` in the argument list.
    #[cfg(test)]
    pub fn flag_position(&self, flag: &str) -> Option<usize> {
        self.args.iter().position(|a| a == flag)
    }

    /// Shell-quoted command line, for logs and error messages.
    pub fn display(&self) -> String {
        let mut words = vec![self.program_lossy()];
        words.extend(self.args_lossy());
        shell_words::join(words)
    }

    /// The `env_defaults` that are not already set in this process.
    pub fn resolved_env(&self) -> Vec<(OsString, OsString)> {
        self.env_defaults
            .iter()
            .filter(|(key, _)| std::env::var_os(key).is_none())
            .cloned()
            .collect()
    }
}

/// Exit status of a finished child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

pub trait CommandRunner {
    /// Run the command to completion. Spawn failures are `Err`, a non-zero
    /// exit is an `Ok` outcome for the caller to interpret.
    fn run(&self, command: &CommandSpec) -> io::Result<CommandOutcome>;
}

/// Runs commands on the host with inherited stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, command: &CommandSpec) -> io::Result<CommandOutcome> {
        let mut expression = cmd(command.program.clone(), &command.args).unchecked();
        if let Some(dir) = &command.cwd {
            expression = expression.dir(dir);
        }
        for (key, value) in command.resolved_env() {
            expression = expression.env(key, value);
        }
        if command.quiet {
            expression = expression.stdout_null().stderr_null();
        }
        let output = expression.run()?;
        Ok(CommandOutcome {
            code: output.status.code(),
        })
    }
}
