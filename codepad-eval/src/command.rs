//! Toolchain backed by external compiler and runtime processes.
//!
//! Each compile gets a fresh work directory:
//!
//! ```text
//! /tmp/codepad-XXXX/
//!   ├── Classes.cs    ← classes, verbatim
//!   ├── Command.cs    ← command spliced into `command_template`
//!   └── program.exe   ← whatever the compile argv produces
//! ```
//!
//! Arguments may reference `$CODEPAD_WORKDIR`, `$CODEPAD_CLASSES`,
//! `$CODEPAD_COMMAND` and `$CODEPAD_ARTIFACT`; the same names are exported
//! into the (otherwise cleared) environment of both steps.
//!
//! The run step goes through `wrapper` (a `bwrap` jail with no network and a
//! read-only view of the system by default) and both steps get the
//! [`ResourceLimits`] of [`crate::sandbox`]. A toolchain without a wrapper is
//! refused unless `allow_unsandboxed` says otherwise.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use codepad_core::{Diagnostic, SandboxViolation};

use crate::sandbox::{self, ProcessGroup, ResourceLimits};
use crate::toolchain::{Artifact, Compilation, Limits, RunOutput, Source, Toolchain, ToolchainError};

/// Placeholder in `command_template` replaced by the submitted command.
const COMMAND_PLACEHOLDER: &str = "{command}";

/// Compiler chatter beyond this is treated as a runaway compiler.
const COMPILER_OUTPUT_LIMIT: usize = 1024 * 1024;

/// Lines of raw compiler output kept when nothing parses as a diagnostic.
const FALLBACK_LINES: usize = 20;

/// `File.cs(3,12): error CS1002: ; expected`
static MSBUILD_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<file>[^(]+?)\((?P<line>\d+),(?P<col>\d+)\): (?:fatal )?error (?P<code>[A-Za-z]+\d+): (?P<msg>.*)$",
    )
    .expect("static regex")
});

/// `file.c:3:12: error: expected ';'` and `file.rs:3:12: error[E0425]: ...`
static GCC_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<file>[^:\s][^:]*):(?P<line>\d+):(?P<col>\d+): (?:fatal )?error(?:\[(?P<code>[A-Za-z0-9]+)\])?: (?P<msg>.*)$",
    )
    .expect("static regex")
});

/// External toolchain configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolchainConfig {
    /// Compile argv; empty means the command file itself is the artifact
    pub compile: Vec<String>,
    /// Run argv
    pub run: Vec<String>,
    /// Sandbox launcher prepended to the run argv
    pub wrapper: Vec<String>,
    /// Permit an empty `wrapper`; the run then sees the host filesystem and network
    pub allow_unsandboxed: bool,
    /// Kernel limits for compiler and program processes
    pub limits: ResourceLimits,
    pub classes_file: String,
    pub command_file: String,
    pub artifact: String,
    /// Source the command is spliced into at `{command}`
    pub command_template: String,
    /// `PATH` visible to compiler and program
    pub path: String,
    /// Parent of per-compile work directories (default: system temp dir)
    pub work_root: Option<PathBuf>,
}

impl Default for ToolchainConfig {
    /// C# through Mono: `mcs` to compile, `mono` to run.
    fn default() -> Self {
        Self {
            compile: args(&[
                "mcs",
                "-nologo",
                "-target:exe",
                "-out:$CODEPAD_ARTIFACT",
                "$CODEPAD_CLASSES",
                "$CODEPAD_COMMAND",
            ]),
            run: args(&["mono", "$CODEPAD_ARTIFACT"]),
            wrapper: args(&[
                "bwrap",
                "--unshare-all",
                "--die-with-parent",
                "--ro-bind",
                "/usr",
                "/usr",
                "--ro-bind-try",
                "/bin",
                "/bin",
                "--ro-bind-try",
                "/lib",
                "/lib",
                "--ro-bind-try",
                "/lib64",
                "/lib64",
                "--ro-bind-try",
                "/etc/mono",
                "/etc/mono",
                "--proc",
                "/proc",
                "--dev",
                "/dev",
                "--tmpfs",
                "/tmp",
                "--bind",
                "$CODEPAD_WORKDIR",
                "$CODEPAD_WORKDIR",
                "--chdir",
                "$CODEPAD_WORKDIR",
                "--",
            ]),
            allow_unsandboxed: false,
            limits: ResourceLimits::default(),
            classes_file: "Classes.cs".into(),
            command_file: "Command.cs".into(),
            artifact: "program.exe".into(),
            command_template: concat!(
                "public static class CodepadEntry\n",
                "{\n",
                "    private static object Run()\n",
                "    {\n",
                "{command}\n",
                "    }\n",
                "\n",
                "    public static void Main()\n",
                "    {\n",
                "        System.Console.Write(Run());\n",
                "    }\n",
                "}\n",
            )
            .into(),
            path: "/usr/local/bin:/usr/bin:/bin".into(),
            work_root: None,
        }
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Toolchain that shells out to configured compiler/runtime commands.
pub struct CommandToolchain {
    config: ToolchainConfig,
    /// Template lines before the command; subtracted from command locations
    command_line_offset: u32,
}

impl CommandToolchain {
    pub fn new(config: ToolchainConfig) -> Result<Self, ToolchainError> {
        if config.wrapper.is_empty() {
            if !config.allow_unsandboxed {
                return Err(ToolchainError::Unsandboxed);
            }
            log::warn!("Running snippets without a sandbox wrapper");
        }
        let command_line_offset = config
            .command_template
            .find(COMMAND_PLACEHOLDER)
            .map(|idx| config.command_template[..idx].matches('\n').count() as u32)
            .unwrap_or(0);
        Ok(Self {
            config,
            command_line_offset,
        })
    }

    fn render_command(&self, command: &str) -> String {
        if self.config.command_template.contains(COMMAND_PLACEHOLDER) {
            self.config.command_template.replace(COMMAND_PLACEHOLDER, command)
        } else {
            command.to_string()
        }
    }

    fn workdir(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("codepad-");
        match &self.config.work_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
    }

    /// `$CODEPAD_*` variables plus the sandbox's base environment.
    fn vars(&self, workdir: &Path) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        let dir = workdir.display().to_string();
        vars.insert(
            "CODEPAD_CLASSES".into(),
            workdir.join(&self.config.classes_file).display().to_string(),
        );
        vars.insert(
            "CODEPAD_COMMAND".into(),
            workdir.join(&self.config.command_file).display().to_string(),
        );
        vars.insert(
            "CODEPAD_ARTIFACT".into(),
            workdir.join(&self.config.artifact).display().to_string(),
        );
        vars.insert("CODEPAD_WORKDIR".into(), dir.clone());
        vars.insert("PATH".into(), self.config.path.clone());
        vars.insert("HOME".into(), dir.clone());
        vars.insert("TMPDIR".into(), dir);
        vars
    }

    /// Turn a failed compiler's output into diagnostics; never empty.
    fn diagnose(&self, output: &str, exit_code: Option<i32>) -> Vec<Diagnostic> {
        let diagnostics =
            parse_diagnostics(output, &self.config.command_file, self.command_line_offset);
        if !diagnostics.is_empty() {
            return diagnostics;
        }

        let excerpt: Vec<&str> = output
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .take(FALLBACK_LINES)
            .collect();
        if !excerpt.is_empty() {
            return vec![Diagnostic::new(excerpt.join("\n"))];
        }
        match exit_code {
            Some(code) => vec![Diagnostic::new(format!("compiler exited with status {code}"))],
            None => vec![Diagnostic::new("compiler was terminated by a signal")],
        }
    }
}

#[async_trait]
impl Toolchain for CommandToolchain {
    async fn compile(&self, source: &Source) -> Result<Compilation, ToolchainError> {
        let workdir = self.workdir()?;
        let vars = self.vars(workdir.path());

        let command_path = workdir.path().join(&self.config.command_file);
        tokio::fs::write(workdir.path().join(&self.config.classes_file), &source.classes).await?;
        tokio::fs::write(&command_path, self.render_command(&source.command)).await?;

        if self.config.compile.is_empty() {
            return Ok(Compilation::success(Artifact::in_workdir(workdir, source.clone())));
        }

        let argv = resolve_args(&self.config.compile, &vars);
        let limits = self.config.limits.for_compile();
        let captured =
            run_captured(&argv, workdir.path(), &vars, COMPILER_OUTPUT_LIMIT, limits).await?;

        if captured.exit_code == Some(0) {
            return Ok(Compilation::success(Artifact::in_workdir(workdir, source.clone())));
        }

        // Work paths differ per call; strip them so diagnostics are stable.
        let dir = workdir.path().display().to_string();
        let output = format!("{}\n{}", captured.stdout, captured.stderr).replace(&dir, ".");
        log::debug!("compiler exited with {:?}", captured.exit_code);
        Ok(Compilation::failure(self.diagnose(&output, captured.exit_code)))
    }

    async fn run(&self, artifact: Artifact, limits: Limits) -> Result<RunOutput, ToolchainError> {
        let workdir = artifact.workdir().map(Path::to_path_buf).ok_or_else(|| {
            ToolchainError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "artifact has no work directory",
            ))
        })?;
        if self.config.run.is_empty() {
            return Err(ToolchainError::EmptyCommand);
        }

        let vars = self.vars(&workdir);
        let mut argv = resolve_args(&self.config.wrapper, &vars);
        argv.extend(resolve_args(&self.config.run, &vars));

        let rlimits = self.config.limits.for_run(limits.timeout);
        let captured = tokio::time::timeout(
            limits.timeout,
            run_captured(&argv, &workdir, &vars, limits.max_output_bytes, rlimits),
        )
        .await
        .map_err(|_| {
            ToolchainError::Violation(SandboxViolation::Timeout {
                limit_ms: limits.timeout.as_millis() as u64,
            })
        })??;

        // Keep the work directory until the process is gone.
        drop(artifact);
        if let Some(violation) = captured.violation {
            return Err(ToolchainError::Violation(violation));
        }
        Ok(RunOutput {
            stdout: captured.stdout,
            stderr: captured.stderr,
            exit_code: captured.exit_code,
        })
    }
}

/// Replace `$NAME` occurrences with values from `vars`.
pub(crate) fn resolve_args(args: &[String], vars: &BTreeMap<String, String>) -> Vec<String> {
    args.iter()
        .map(|arg| {
            let mut result = arg.clone();
            for (key, value) in vars {
                result = result.replace(&format!("${key}"), value);
            }
            result
        })
        .collect()
}

/// Extract error diagnostics from compiler output.
///
/// Locations inside `command_file` are shifted up by `command_line_offset`
/// so they point into the snippet rather than the template around it.
pub fn parse_diagnostics(output: &str, command_file: &str, command_line_offset: u32) -> Vec<Diagnostic> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_end();
            let caps = MSBUILD_STYLE
                .captures(line)
                .or_else(|| GCC_STYLE.captures(line))?;

            let mut row: u32 = caps["line"].parse().ok()?;
            let col: u32 = caps["col"].parse().ok()?;
            if caps["file"].trim().ends_with(command_file) {
                row = row.saturating_sub(command_line_offset).max(1);
            }

            let mut diagnostic = Diagnostic::new(caps["msg"].trim()).at(row, col);
            if let Some(code) = caps.name("code") {
                diagnostic = diagnostic.with_code(code.as_str());
            }
            Some(diagnostic)
        })
        .collect()
}

struct Captured {
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    /// Set when a resource limit killed the process
    violation: Option<SandboxViolation>,
}

enum CaptureError {
    Overflow,
    Io(std::io::Error),
}

/// Read at most `limit` bytes; more than that is an overflow.
async fn capture<R: AsyncRead + Unpin>(reader: R, limit: usize) -> Result<Vec<u8>, CaptureError> {
    let mut buf = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut buf)
        .await
        .map_err(CaptureError::Io)?;
    if buf.len() > limit {
        return Err(CaptureError::Overflow);
    }
    Ok(buf)
}

/// Spawn `argv` in `cwd` with only `env`, capturing bounded output.
///
/// The child runs in its own process group under `rlimits`. The group is
/// killed when this future completes or is dropped, so nothing the child
/// started outlives it.
async fn run_captured(
    argv: &[String],
    cwd: &Path,
    env: &BTreeMap<String, String>,
    limit: usize,
    rlimits: ResourceLimits,
) -> Result<Captured, ToolchainError> {
    let (program, rest) = argv.split_first().ok_or(ToolchainError::EmptyCommand)?;

    let mut command = std::process::Command::new(program);
    command
        .args(rest)
        .current_dir(cwd)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    sandbox::configure(&mut command, rlimits);

    let mut child = Command::from(command)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| {
            log::error!("Failed to start {program}: {source}");
            ToolchainError::Spawn {
                program: program.clone(),
                source,
            }
        })?;

    let _group = ProcessGroup::led_by(child.id());

    let missing = || ToolchainError::Io(std::io::Error::other("child pipe missing"));
    let stdout = child.stdout.take().ok_or_else(missing)?;
    let stderr = child.stderr.take().ok_or_else(missing)?;

    match tokio::try_join!(capture(stdout, limit), capture(stderr, limit)) {
        Ok((out, err)) => {
            let status = child.wait().await?;
            Ok(Captured {
                stdout: String::from_utf8_lossy(&out).into_owned(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
                exit_code: status.code(),
                violation: sandbox::violation_for(&status),
            })
        }
        Err(CaptureError::Overflow) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(ToolchainError::Violation(SandboxViolation::OutputLimit {
                limit_bytes: limit,
            }))
        }
        Err(CaptureError::Io(e)) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(ToolchainError::Io(e))
        }
    }
}
