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

use clap::Parser;
use mutex_run::config::MutexRunConfig;
use mutex_run::diagnostics::ConsoleSink;
use mutex_run::error::{MutexRunError, Result, format_error_with_color, get_exit_code};
use mutex_run::locking::{
    CancellationToken, LockTimeoutValue, parse_stale_timeout, parse_timeout_override,
};
use mutex_run::logging;
use mutex_run::process::CommandLine;
use mutex_run::runner::{RunOptions, Runner};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "mutex-run")]
#[command(
    author,
    version,
    about = "Run a command while holding a cross-process file lock",
    long_about = None
)]
#[command(after_help = "Examples:
  mutex-run -- npm install
  mutex-run --lock /tmp/build.lock --timeout 30s -- make all
  mutex-run --no-wait --shell -- \"cargo build && cargo test\"")]
struct Cli {
    /// Lock file path [default: .mutex-run.lock]
    #[arg(short, long, value_name = "PATH")]
    lock: Option<PathBuf>,

    /// Wait for the lock when it is held (default)
    #[arg(long, overrides_with = "no_wait")]
    wait: bool,

    /// Fail immediately when the lock is held
    #[arg(long, overrides_with = "wait")]
    no_wait: bool,

    /// Give up waiting after this long (e.g. 500, 30s, 5m; 0 or "infinite" for no limit)
    #[arg(long, value_name = "DURATION", value_parser = parse_timeout_override)]
    timeout: Option<LockTimeoutValue>,

    /// Treat a lock file untouched for this long as abandoned (minimum 200ms)
    #[arg(long, value_name = "DURATION", value_parser = parse_stale_timeout)]
    stale_timeout: Option<Duration>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Run the command through the platform shell
    #[arg(long, overrides_with = "no_shell")]
    shell: bool,

    /// Run the command directly, without a shell
    #[arg(long, overrides_with = "shell")]
    no_shell: bool,

    /// Command to run while the lock is held
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,
}

impl Cli {
    fn wait_override(&self) -> Option<bool> {
        flag_pair(self.wait, self.no_wait)
    }

    fn shell_override(&self) -> Option<bool> {
        flag_pair(self.shell, self.no_shell)
    }

    /// The positional arguments form an argument vector and run without a
    /// shell. Only with shell indirection explicitly on is a lone argument
    /// handed to the shell verbatim as a command line.
    fn command_line(&self, explicit_shell: bool) -> Result<CommandLine> {
        let command = match self.command.as_slice() {
            [line] if explicit_shell => CommandLine::Shell(line.clone()),
            args => CommandLine::Argv(args.to_vec()),
        };
        if command.is_empty() {
            return Err(MutexRunError::NoCommandSpecified);
        }
        Ok(command)
    }

    fn run_options(&self, config: &MutexRunConfig) -> RunOptions {
        let mut options = RunOptions::from_config(config);

        if let Some(lock) = &self.lock {
            options = options.with_lock_file(lock);
        }
        if let Some(wait) = self.wait_override() {
            options = options.with_wait(wait);
        }
        if let Some(timeout) = self.timeout {
            options = options.with_timeout(timeout);
        }
        if let Some(stale_timeout) = self.stale_timeout {
            options = options.with_stale_timeout(stale_timeout);
        }
        if let Some(shell) = self.shell_override() {
            options = options.with_shell(Some(shell));
        }

        options.with_sink(Arc::new(ConsoleSink::new(self.verbose > 0)))
    }
}

fn flag_pair(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn use_color(cli: &Cli) -> bool {
    !cli.no_color
        && colored::control::SHOULD_COLORIZE.should_colorize()
        && std::io::stderr().is_terminal()
}

fn execute(cli: &Cli) -> Result<i32> {
    let project_dir = std::env::current_dir()?;
    let config = MutexRunConfig::load(&project_dir)?;

    let explicit_shell = cli.shell_override().or(config.process.shell) == Some(true);
    let command = cli.command_line(explicit_shell)?;
    let options = cli.run_options(&config);
    log::debug!("Run options: {options:?}");

    let cancellation = CancellationToken::new();
    let _signals = cancellation.register_process_signals()?;

    let runner = Runner::new(options).with_cancellation(cancellation);
    let result = runner.run(command)?;
    Ok(result.exit_code)
}

fn main() {
    let cli = Cli::parse();

    // Initialize logger based on CLI flags and environment
    logging::setup_logger(cli.verbose);

    if cli.no_color {
        colored::control::set_override(false);
    }

    match execute(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{}", format_error_with_color(&e, use_color(&cli)));
            std::process::exit(get_exit_code(&e));
        }
    }
}
