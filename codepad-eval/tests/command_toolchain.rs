//! End-to-end engine tests over a POSIX shell "toolchain".
//!
//! Classes are shell functions, the command is a shell script, and the
//! compile step rejects `= ;` the way a real compiler would.
#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use codepad_core::{ExecutionResult, Fault, SandboxViolation};
use codepad_eval::{
    CommandToolchain, EngineConfig, EvaluationEngine, ResourceLimits, ToolchainConfig,
};

const COMPILE: &str = r#"
if grep -q '= ;' "$CODEPAD_COMMAND"; then
  echo "$CODEPAD_COMMAND:1:9: error: expected expression" >&2
  exit 1
fi
{ cat "$CODEPAD_CLASSES"; echo; cat "$CODEPAD_COMMAND"; } > "$CODEPAD_ARTIFACT"
"#;

fn shell_toolchain(work_root: &Path) -> ToolchainConfig {
    ToolchainConfig {
        compile: vec!["sh".into(), "-c".into(), COMPILE.into()],
        run: vec!["sh".into(), "$CODEPAD_ARTIFACT".into()],
        wrapper: Vec::new(),
        allow_unsandboxed: true,
        // every process of the test user counts against NPROC
        limits: ResourceLimits {
            processes: None,
            ..ResourceLimits::default()
        },
        classes_file: "classes.sh".into(),
        command_file: "command.sh".into(),
        artifact: "program.sh".into(),
        command_template: "{command}\n".into(),
        work_root: Some(work_root.to_path_buf()),
        ..ToolchainConfig::default()
    }
}

fn engine(work_root: &Path) -> EvaluationEngine {
    let config = EngineConfig {
        run_timeout_ms: 300,
        ..EngineConfig::for_testing()
    };
    let toolchain = CommandToolchain::new(shell_toolchain(work_root)).unwrap();
    EvaluationEngine::new(Arc::new(toolchain), &config)
}

fn leftover_workdirs(work_root: &Path) -> usize {
    std::fs::read_dir(work_root).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn test_runs_command_against_classes() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());

    let result = engine
        .execute("greet world", "greet() { printf 'Hello, %s!' \"$1\"; }")
        .await;
    assert_eq!(
        result,
        ExecutionResult::Ok {
            output: "Hello, world!".into()
        }
    );
    assert_eq!(leftover_workdirs(root.path()), 0);
}

#[tokio::test]
async fn test_compile_error_is_stable_and_path_free() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());

    let first = engine.validate("x = ;", "").await;
    let second = engine.validate("x = ;", "").await;
    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].message, "expected expression");
    assert_eq!(first[0].location.map(|l| (l.line, l.column)), Some((1, 9)));

    let result = engine.execute("x = ;", "").await;
    assert_eq!(result.fault().and_then(Fault::diagnostics), Some(first.as_slice()));
    assert!(engine.validate("echo fine", "").await.is_empty());
    assert_eq!(leftover_workdirs(root.path()), 0);
}

#[tokio::test]
async fn test_nonzero_exit_is_runtime_fault() {
    let root = tempfile::tempdir().unwrap();
    let result = engine(root.path())
        .execute("echo oops >&2; exit 3", "")
        .await;
    assert_eq!(
        result.fault(),
        Some(&Fault::RuntimeFault {
            message: "oops".into(),
            exit_code: Some(3),
        })
    );
}

#[tokio::test]
async fn test_infinite_loop_is_killed() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());

    let started = Instant::now();
    let result = engine.execute("while :; do :; done", "").await;
    assert!(matches!(
        result.fault(),
        Some(Fault::SandboxViolation {
            violation: SandboxViolation::Timeout { .. }
        })
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(leftover_workdirs(root.path()), 0);

    let started = Instant::now();
    assert!(engine.execute("echo next", "").await.is_ok());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_output_flood_is_cut_off() {
    let root = tempfile::tempdir().unwrap();
    let result = engine(root.path()).execute("yes", "").await;
    assert!(matches!(
        result.fault(),
        Some(Fault::SandboxViolation {
            violation: SandboxViolation::OutputLimit { .. }
        })
    ));
    assert_eq!(leftover_workdirs(root.path()), 0);
}

#[tokio::test]
async fn test_environment_is_cleared() {
    let root = tempfile::tempdir().unwrap();
    std::env::set_var("CODEPAD_TEST_SECRET", "hunter2");
    let result = engine(root.path())
        .execute("printf '%s' \"${CODEPAD_TEST_SECRET:-unset}\"", "")
        .await;
    assert_eq!(
        result,
        ExecutionResult::Ok {
            output: "unset".into()
        }
    );
}

#[tokio::test]
async fn test_missing_compiler_is_a_diagnostic() {
    let root = tempfile::tempdir().unwrap();
    let config = ToolchainConfig {
        compile: vec!["codepad-no-such-compiler".into()],
        ..shell_toolchain(root.path())
    };
    let engine = EvaluationEngine::new(
        Arc::new(CommandToolchain::new(config).unwrap()),
        &EngineConfig::for_testing(),
    );
    let diags = engine.validate("echo hi", "").await;
    assert_eq!(diags.len(), 1);
    assert!(diags[0].message.contains("codepad-no-such-compiler"));
}

/// Processes whose command line contains `marker`.
#[cfg(target_os = "linux")]
fn processes_matching(marker: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().chars().all(|c| c.is_ascii_digit()))
        .filter_map(|e| std::fs::read(e.path().join("cmdline")).ok())
        .map(|raw| String::from_utf8_lossy(&raw).replace('\0', " "))
        .filter(|cmdline| cmdline.contains(marker))
        .collect()
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_timeout_kills_every_process_the_run_started() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());

    let result = engine
        .execute("sleep 61.234 & sleep 61.234 & wait", "")
        .await;
    assert!(matches!(
        result.fault(),
        Some(Fault::SandboxViolation {
            violation: SandboxViolation::Timeout { .. }
        })
    ));

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut surviving = processes_matching("sleep 61.234");
    while !surviving.is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
        surviving = processes_matching("sleep 61.234");
    }
    assert!(surviving.is_empty(), "surviving: {surviving:?}");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_output_flood_kills_background_writers() {
    let root = tempfile::tempdir().unwrap();
    let result = engine(root.path())
        .execute("sleep 62.345 & yes", "")
        .await;
    assert!(matches!(
        result.fault(),
        Some(Fault::SandboxViolation {
            violation: SandboxViolation::OutputLimit { .. }
        })
    ));

    let deadline = Instant::now() + Duration::from_secs(2);
    while !processes_matching("sleep 62.345").is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(processes_matching("sleep 62.345").is_empty());
}

#[tokio::test]
async fn test_file_size_limit_is_a_resource_violation() {
    let root = tempfile::tempdir().unwrap();
    let mut config = shell_toolchain(root.path());
    config.limits.file_size_bytes = Some(64 * 1024);
    let engine = EvaluationEngine::new(
        Arc::new(CommandToolchain::new(config).unwrap()),
        &EngineConfig {
            run_timeout_ms: 2_000,
            ..EngineConfig::for_testing()
        },
    );

    let result = engine
        .execute("exec head -c 1048576 /dev/zero > big.bin", "")
        .await;
    assert_eq!(
        result.fault(),
        Some(&Fault::SandboxViolation {
            violation: SandboxViolation::ResourceLimit {
                detail: "file size".into()
            }
        })
    );
    assert_eq!(leftover_workdirs(root.path()), 0);
}

#[tokio::test]
async fn test_cpu_limit_is_a_resource_violation() {
    let root = tempfile::tempdir().unwrap();
    let mut config = shell_toolchain(root.path());
    config.limits.cpu_seconds = Some(1);
    let engine = EvaluationEngine::new(
        Arc::new(CommandToolchain::new(config).unwrap()),
        &EngineConfig {
            run_timeout_ms: 5_000,
            ..EngineConfig::for_testing()
        },
    );

    let started = Instant::now();
    let result = engine.execute("exec sh -c 'while :; do :; done'", "").await;
    assert!(matches!(
        result.fault(),
        Some(Fault::SandboxViolation {
            violation: SandboxViolation::ResourceLimit { .. }
        })
    ));
    assert!(started.elapsed() < Duration::from_secs(4));
}
