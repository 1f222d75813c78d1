//! Spawns the analyzer (Valgrind by default) wrapping the test command,
//! captures its combined stdout/stderr, and classifies the iteration
//! outcome.

use std::io::Read;
use std::process::{Command, ExitStatus};

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

use thiserror::Error;

/// Read-buffer growth unit, matching `examples/original_source/larmier.c`'s
/// `readall` (`READBUF_SIZE`).
pub const READ_CHUNK: usize = 4096;

/// Exit code the analyzer uses to signal it found memory errors, passed to
/// it via `--error-exitcode` (spec.md's analyzer-leak sentinel, matching
/// `examples/original_source/larmier.c`'s `EXIT_ERR_VALGRIND`).
pub const ANALYZER_LEAK_EXIT_CODE: i32 = 0xFE;

const FD_LEAK_MARKER: &str = " Open file descriptor ";
const FD_LEAK_BENIGN: &str = "Testing/Temporary/LastTest.log.tmp";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to create capture pipe: {0}")]
    Pipe(#[source] std::io::Error),
    #[error("failed to spawn analyzer: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to wait for analyzer: {0}")]
    Wait(#[source] std::io::Error),
}

/// One iteration's spawn instructions: a fully-built argv (analyzer plus
/// its flags plus the test command and arguments, in that order) and the
/// environment the test process needs to find the BCA and stub library.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub argv: Vec<String>,
    pub bca_name: String,
    pub ld_preload: Option<String>,
    pub ld_library_path: Option<String>,
}

impl RunRequest {
    pub fn new(argv: Vec<String>, bca_name: impl Into<String>) -> Self {
        Self {
            argv,
            bca_name: bca_name.into(),
            ld_preload: None,
            ld_library_path: None,
        }
    }

    /// Sets both `LD_PRELOAD` and `LD_LIBRARY_PATH` for the child, matching
    /// `examples/original_source/larmier.c`'s `exec_test`, which injects the
    /// stub library's path and its containing directory together.
    pub fn with_ld_preload(mut self, path: impl Into<String>, dir: impl Into<String>) -> Self {
        self.ld_preload = Some(path.into());
        self.ld_library_path = Some(dir.into());
        self
    }
}

/// How one iteration's child process finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The analyzer ran to completion and the test command exited with
    /// `exit_code`, with no leaks detected.
    Normal { exit_code: i32 },
    /// The analyzer reported a real file-descriptor leak.
    FdLeakDetected,
    /// The child did not exit normally (killed by a signal).
    AbnormalTermination { signal: i32 },
    /// The analyzer itself reported memory errors via `--error-exitcode`.
    AnalyzerLeakError,
    /// The driver's own plumbing (pipe, spawn, wait) failed before the
    /// iteration could run to completion. Distinct from a Rust-level `Err`:
    /// this is a classified iteration outcome like the other four, so the
    /// explorer can report it through the same masked-exit-code path.
    DriverError,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub outcome: Outcome,
    pub captured_output: Vec<u8>,
}

/// Run one iteration: spawn `req.argv[0]` with the rest of `req.argv` as
/// arguments, `COVEX_BCA=req.bca_name` (and `LD_PRELOAD`/`LD_LIBRARY_PATH`
/// if set) in its environment, capture combined stdout+stderr through a
/// single pipe, and classify the result.
///
/// Infallible: a plumbing failure (pipe creation, spawn, wait) is itself a
/// classified outcome (`Outcome::DriverError`), not a propagated `Err` —
/// only setup that happens once per driver invocation, before any iteration
/// starts (creating the BCA itself), surfaces as a generic failure.
pub fn run_iteration(req: &RunRequest) -> RunOutcome {
    match try_run_iteration(req) {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(error = %err, "driver plumbing failure during iteration");
            RunOutcome {
                outcome: Outcome::DriverError,
                captured_output: Vec::new(),
            }
        }
    }
}

fn try_run_iteration(req: &RunRequest) -> Result<RunOutcome, RunnerError> {
    let (reader, writer) = os_pipe::pipe().map_err(RunnerError::Pipe)?;
    let writer_clone = writer.try_clone().map_err(RunnerError::Pipe)?;

    let program = req.argv.first().expect("argv must be non-empty");
    let mut command = Command::new(program);
    command.args(&req.argv[1..]);
    command.env(covex_bca::BCA_ENV_VAR, &req.bca_name);
    if let Some(preload) = &req.ld_preload {
        command.env("LD_PRELOAD", preload);
    }
    if let Some(dir) = &req.ld_library_path {
        command.env("LD_LIBRARY_PATH", dir);
    }
    command.stdout(writer_clone);
    command.stderr(writer);

    let mut child = command.spawn().map_err(RunnerError::Spawn)?;

    let mut captured = Vec::new();
    read_all(reader, &mut captured);

    let status = child.wait().map_err(RunnerError::Wait)?;

    Ok(RunOutcome {
        outcome: classify(status, &captured),
        captured_output: captured,
    })
}

fn read_all(mut reader: impl Read, out: &mut Vec<u8>) {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

fn classify(status: ExitStatus, captured: &[u8]) -> Outcome {
    #[cfg(unix)]
    {
        if let Some(signal) = status.signal() {
            return Outcome::AbnormalTermination { signal };
        }
    }

    let exit_code = status.code().unwrap_or(-1);
    if exit_code == ANALYZER_LEAK_EXIT_CODE {
        return Outcome::AnalyzerLeakError;
    }
    if has_fd_leaks(captured) {
        return Outcome::FdLeakDetected;
    }
    Outcome::Normal { exit_code }
}

/// Scan the analyzer's captured output for a real file-descriptor leak,
/// ignoring the known ctest-internal `LastTest.log.tmp` false positive
/// (`examples/original_source/larmier.c`'s `has_fd_leaks`).
pub fn has_fd_leaks(captured: &[u8]) -> bool {
    let text = String::from_utf8_lossy(captured);
    text.lines()
        .any(|line| line.contains(FD_LEAK_MARKER) && !line.contains(FD_LEAK_BENIGN))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_fd_leaks_detects_marker_line() {
        let buf = b"==123== 42 bytes in 1 blocks are definitely lost\n\
                    ==123== Open file descriptor 5: /tmp/foo\n";
        assert!(has_fd_leaks(buf));
    }

    #[test]
    fn has_fd_leaks_ignores_ctest_log_tmp() {
        let buf = b"==123== Open file descriptor 5: Testing/Temporary/LastTest.log.tmp\n";
        assert!(!has_fd_leaks(buf));
    }

    #[test]
    fn has_fd_leaks_finds_real_leak_after_benign_one() {
        let buf = b"==123== Open file descriptor 5: Testing/Temporary/LastTest.log.tmp\n\
                    ==123== Open file descriptor 6: /tmp/real-leak\n";
        assert!(has_fd_leaks(buf));
    }

    #[test]
    fn has_fd_leaks_false_on_clean_output() {
        let buf = b"==123== All heap blocks were freed -- no leaks are possible\n";
        assert!(!has_fd_leaks(buf));
    }

    #[test]
    fn run_iteration_reports_normal_exit_code() {
        let req = RunRequest::new(
            vec!["/bin/sh".to_string(), "-c".to_string(), "exit 7".to_string()],
            "covex_test_nonexistent".to_string(),
        );
        let outcome = run_iteration(&req);
        assert_eq!(outcome.outcome, Outcome::Normal { exit_code: 7 });
    }

    #[test]
    fn run_iteration_captures_combined_output() {
        let req = RunRequest::new(
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "echo out; echo err 1>&2".to_string(),
            ],
            "covex_test_nonexistent".to_string(),
        );
        let outcome = run_iteration(&req);
        let text = String::from_utf8_lossy(&outcome.captured_output);
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }

    #[cfg(unix)]
    #[test]
    fn run_iteration_detects_abnormal_termination() {
        let req = RunRequest::new(
            vec!["/bin/sh".to_string(), "-c".to_string(), "kill -KILL $$".to_string()],
            "covex_test_nonexistent".to_string(),
        );
        let outcome = run_iteration(&req);
        assert!(matches!(
            outcome.outcome,
            Outcome::AbnormalTermination { signal } if signal == libc_sigkill()
        ));
    }

    #[cfg(unix)]
    fn libc_sigkill() -> i32 {
        9
    }

    #[test]
    fn run_iteration_sets_ld_preload_and_ld_library_path() {
        let req = RunRequest::new(
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "echo \"$LD_PRELOAD|$LD_LIBRARY_PATH\"".to_string(),
            ],
            "covex_test_nonexistent".to_string(),
        )
        .with_ld_preload("/tmp/libstub.so", "/tmp");
        let outcome = run_iteration(&req);
        let text = String::from_utf8_lossy(&outcome.captured_output);
        assert!(text.contains("/tmp/libstub.so|/tmp"));
    }

    #[test]
    fn run_iteration_detects_fd_leak_reported_against_a_real_temp_file() {
        let tmp = tempfile::NamedTempFile::new().expect("create scratch file");
        let path = tmp.path().display().to_string();
        let req = RunRequest::new(
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!("echo '==1== Open file descriptor 7: {path}'"),
            ],
            "covex_test_nonexistent".to_string(),
        );
        let outcome = run_iteration(&req);
        assert_eq!(outcome.outcome, Outcome::FdLeakDetected);
    }

    #[test]
    fn run_iteration_ignores_fd_leak_reported_against_ctest_log_tmp() {
        let req = RunRequest::new(
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "echo '==1== Open file descriptor 7: Testing/Temporary/LastTest.log.tmp'"
                    .to_string(),
            ],
            "covex_test_nonexistent".to_string(),
        );
        let outcome = run_iteration(&req);
        assert_eq!(outcome.outcome, Outcome::Normal { exit_code: 0 });
    }

    #[test]
    fn run_iteration_reports_driver_error_on_spawn_failure() {
        let req = RunRequest::new(
            vec!["/covex/nonexistent/program".to_string()],
            "covex_test_nonexistent".to_string(),
        );
        let outcome = run_iteration(&req);
        assert_eq!(outcome.outcome, Outcome::DriverError);
        assert!(outcome.captured_output.is_empty());
    }
}
