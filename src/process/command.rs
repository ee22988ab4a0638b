// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::{MutexRunError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// The command to run while the lock is held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// A single command line interpreted by the platform shell.
    Shell(String),
    /// A program followed by its arguments.
    Argv(Vec<String>),
}

impl CommandLine {
    pub fn is_empty(&self) -> bool {
        match self {
            CommandLine::Shell(line) => line.trim().is_empty(),
            CommandLine::Argv(args) => args
                .first()
                .is_none_or(|program| program.trim().is_empty()),
        }
    }

    /// Shell indirection applies by default to string commands, and to every
    /// command on Windows.
    pub fn default_shell(&self) -> bool {
        cfg!(windows) || matches!(self, CommandLine::Shell(_))
    }

    /// The first word of the command, used for diagnostics and `PATH` lookups.
    pub fn program(&self) -> Option<String> {
        match self {
            CommandLine::Shell(line) => shell_words::split(line)
                .ok()
                .and_then(|words| words.into_iter().next())
                .or_else(|| line.split_whitespace().next().map(str::to_string)),
            CommandLine::Argv(args) => args.first().cloned(),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandLine::Shell(line) => f.write_str(line),
            CommandLine::Argv(args) => f.write_str(&shell_words::join(args)),
        }
    }
}

impl From<&str> for CommandLine {
    fn from(line: &str) -> Self {
        CommandLine::Shell(line.to_string())
    }
}

impl From<String> for CommandLine {
    fn from(line: String) -> Self {
        CommandLine::Shell(line)
    }
}

impl From<Vec<String>> for CommandLine {
    fn from(args: Vec<String>) -> Self {
        CommandLine::Argv(args)
    }
}

impl From<Vec<&str>> for CommandLine {
    fn from(args: Vec<&str>) -> Self {
        CommandLine::Argv(args.into_iter().map(str::to_string).collect())
    }
}

impl From<&[String]> for CommandLine {
    fn from(args: &[String]) -> Self {
        CommandLine::Argv(args.to_vec())
    }
}

impl From<&[&str]> for CommandLine {
    fn from(args: &[&str]) -> Self {
        CommandLine::Argv(args.iter().map(|arg| arg.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for CommandLine {
    fn from(args: [&str; N]) -> Self {
        CommandLine::Argv(args.iter().map(|arg| arg.to_string()).collect())
    }
}

/// How the child's standard streams are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    /// The child shares the caller's terminal.
    #[default]
    Inherit,
    /// stdout and stderr are captured; stdin is closed.
    Pipe,
}

/// Everything needed to launch the supervised child.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    command: CommandLine,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    stdio: StdioMode,
    shell: bool,
}

impl ChildSpec {
    pub fn new(command: CommandLine) -> Result<Self> {
        if command.is_empty() {
            return Err(MutexRunError::NoCommandSpecified);
        }

        let shell = command.default_shell();
        Ok(Self {
            command,
            cwd: None,
            env: BTreeMap::new(),
            stdio: StdioMode::default(),
            shell,
        })
    }

    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(key, value)| (key.clone(), value.clone())));
        self
    }

    pub fn with_stdio(mut self, stdio: StdioMode) -> Self {
        self.stdio = stdio;
        self
    }

    /// Overrides shell indirection; `None` keeps the default for the command form.
    pub fn with_shell(mut self, shell: Option<bool>) -> Self {
        if let Some(shell) = shell {
            self.shell = shell;
        }
        self
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn stdio(&self) -> StdioMode {
        self.stdio
    }

    pub fn uses_shell(&self) -> bool {
        self.shell
    }

    pub fn program_label(&self) -> String {
        self.command
            .program()
            .unwrap_or_else(|| self.command.to_string())
    }

    /// Argument vector used when the shell is bypassed.
    pub fn argv(&self) -> Result<Vec<String>> {
        let args = match &self.command {
            CommandLine::Argv(args) => args.clone(),
            CommandLine::Shell(line) => {
                shell_words::split(line).map_err(|err| MutexRunError::ChildLaunchFailed {
                    program: self.program_label(),
                    details: format!("cannot split command line: {err}"),
                })?
            }
        };

        if args.first().is_none_or(|program| program.is_empty()) {
            return Err(MutexRunError::NoCommandSpecified);
        }
        Ok(args)
    }

    /// The single line handed to the shell when indirection is on.
    pub fn shell_line(&self) -> String {
        match &self.command {
            CommandLine::Shell(line) => line.clone(),
            CommandLine::Argv(args) => join_for_shell(args),
        }
    }

    pub fn to_command(&self) -> Result<Command> {
        let mut command = if self.shell {
            shell_command(&self.shell_line())
        } else {
            let args = self.argv()?;
            let mut command = Command::new(&args[0]);
            command.args(&args[1..]);
            command
        };

        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command.envs(&self.env);

        match self.stdio {
            StdioMode::Inherit => {
                command
                    .stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
            StdioMode::Pipe => {
                command
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
        }

        Ok(command)
    }
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(line);
    command
}

#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    use std::os::windows::process::CommandExt;

    let shell = std::env::var_os("ComSpec").unwrap_or_else(|| "cmd.exe".into());
    let mut command = Command::new(shell);
    command.args(["/d", "/s", "/c"]).raw_arg(format!("\"{line}\""));
    command
}

#[cfg(not(windows))]
fn join_for_shell(args: &[String]) -> String {
    shell_words::join(args)
}

#[cfg(windows)]
fn join_for_shell(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains([' ', '\t', '"']) {
                format!("\"{}\"", arg.replace('"', "\\\""))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
