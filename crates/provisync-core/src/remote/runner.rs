//! ---
//! ps_section: "05-networking-external-interfaces"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Collaborator interfaces for fetch, remote exec, and transfer."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
//! Program runner abstraction.
//!
//! `ProcessRunner` spawns the program directly with an argument vector, no
//! shell in between. `MockRunner` records invocations and replays scripted
//! responses.

use std::collections::VecDeque;
use std::process::Command;

use parking_lot::Mutex;
use tracing::debug;

/// Executes external programs.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`; `Ok` carries stdout, `Err` carries stderr or
    /// the spawn failure.
    fn run(&self, program: &str, args: &[String]) -> Result<String, String>;
}

/// Spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String, String> {
        debug!(program, args = ?args, "spawning");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| format!("failed to execute {program}: {err}"))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("{program} exited with {}: {}", output.status, stderr.trim()))
        }
    }
}

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// Program and arguments joined by spaces.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Test double returning preset responses in order, then empty success.
#[derive(Debug, Default)]
pub struct MockRunner {
    responses: Mutex<VecDeque<Result<String, String>>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<Result<String, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String, String> {
        self.invocations.lock().push(Invocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses.lock().pop_front().unwrap_or(Ok(String::new()))
    }
}
