//! Platform command lines for each script kind.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::rules::ScriptKind;

/// Program and argument vector used to launch a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    /// `arguments` is split on whitespace; no shell expansion happens.
    pub fn resolve(kind: ScriptKind, script_path: &str, arguments: Option<&str>) -> Self {
        let (program, mut args) = match kind {
            ScriptKind::Bash => ("bash".to_string(), vec![script_path.to_string()]),
            ScriptKind::PowerShell => (
                powershell_program().to_string(),
                vec![
                    "-ExecutionPolicy".to_string(),
                    "Bypass".to_string(),
                    "-File".to_string(),
                    script_path.to_string(),
                ],
            ),
            ScriptKind::Python => (python_program().to_string(), vec![script_path.to_string()]),
        };
        args.extend(arguments.unwrap_or_default().split_whitespace().map(str::to_string));
        Self { program, args }
    }

    /// Build a child process rooted at `working_dir` with captured stdio.
    pub fn command(&self, working_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

fn powershell_program() -> &'static str {
    if cfg!(windows) {
        "powershell.exe"
    } else {
        "pwsh"
    }
}

fn python_program() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}
