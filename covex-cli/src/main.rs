//! covex: systematic fault-injection test driver.
//!
//! Runs a test command under an analyzer (Valgrind by default), injecting a
//! failure at every interposed call in turn across every explorable prefix,
//! and reports whether any path leaked memory, leaked file descriptors, or
//! terminated abnormally.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use covex_explorer::{run_exploration, ExploreConfig};
use covex_runner::{RunRequest, ANALYZER_LEAK_EXIT_CODE};
use tracing_subscriber::{fmt, EnvFilter};

/// covex: explore every fault-injection path for a test command.
#[derive(Parser)]
#[command(name = "covex")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase progress verbosity; may be repeated (-dd, -ddd, ...).
    #[arg(short = 'd', action = clap::ArgAction::Count)]
    debug: u8,

    /// Path to the valgrind binary. Defaults to the first one found in
    /// $PATH.
    #[arg(short = 'v')]
    valgrind: Option<PathBuf>,

    /// Path to a stub library to preload into the test process via
    /// LD_PRELOAD (and LD_LIBRARY_PATH, for its containing directory) and
    /// register with valgrind's --soname-synonyms.
    #[arg(short = 'l')]
    stubs_lib: Option<PathBuf>,

    /// The test command and its arguments.
    #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
    test_cmd: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = parse_cli();

    if let Some(lib) = &cli.stubs_lib {
        if !lib.is_file() {
            bail!("invalid stubs library at '{}'", lib.display());
        }
    }

    let test_program = &cli.test_cmd[0];
    if !is_executable(test_program) {
        bail!("invalid test program at '{test_program}'");
    }

    let valgrind = match &cli.valgrind {
        Some(path) => path.clone(),
        None => which::which("valgrind").context("unable to locate valgrind in $PATH")?,
    };

    let argv = build_analyzer_argv(&valgrind, cli.stubs_lib.as_deref(), &cli.test_cmd);
    if cli.debug > 0 {
        tracing::debug!(?argv, "analyzer argv");
    }

    let mut config = ExploreConfig::new(covex_bca::default_name(std::process::id()));
    config.debug = cli.debug;
    let stubs_lib = cli.stubs_lib.clone();

    let final_status = run_exploration(config, move |bca_name| {
        let mut request = RunRequest::new(argv.clone(), bca_name.to_string());
        if let Some(lib) = &stubs_lib {
            let dir = lib
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            request = request.with_ld_preload(lib.display().to_string(), dir);
        }
        request
    })?;

    tracing::info!(masked = format!("{:#x}", final_status.masked()), "exploration complete");
    std::process::exit(final_status.shell_exit_code() as i32);
}

/// Like `Cli::parse()`, but exits non-zero on `-h`/`--help` (spec.md §6:
/// "`-h` — emit help and exit non-zero"), instead of clap-derive's default
/// of printing help and exiting 0. Other parse errors keep clap's own exit
/// code via `Error::exit`.
fn parse_cli() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.kind() == clap::error::ErrorKind::DisplayHelp => {
            print!("{err}");
            std::process::exit(1);
        }
        Err(err) => err.exit(),
    }
}

/// Build valgrind's argv, matching `examples/original_source/larmier.c`'s
/// `valgrind_argv_setup` flag set and ordering.
fn build_analyzer_argv(valgrind: &Path, stubs_lib: Option<&Path>, test_cmd: &[String]) -> Vec<String> {
    let mut argv = vec![
        valgrind.display().to_string(),
        "--track-fds=yes".to_string(),
        "--leak-check=full".to_string(),
        "--show-leak-kinds=all".to_string(),
        format!("--error-exitcode={ANALYZER_LEAK_EXIT_CODE}"),
        "--suppressions=dlsym.supp".to_string(),
        "--track-origins=yes".to_string(),
        "--fair-sched=yes".to_string(),
    ];
    if let Some(lib) = stubs_lib {
        argv.push(format!("--soname-synonyms=somalloc={}", lib.display()));
    }
    argv.extend(test_cmd.iter().cloned());
    argv
}

fn is_executable(program: &str) -> bool {
    if which::which(program).is_ok() {
        return true;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(program) {
            return meta.permissions().mode() & 0o111 != 0;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_analyzer_argv_places_test_command_last() {
        let argv = build_analyzer_argv(
            Path::new("/usr/bin/valgrind"),
            None,
            &["./a.out".to_string(), "--flag".to_string()],
        );
        assert_eq!(argv.first().unwrap(), "/usr/bin/valgrind");
        assert_eq!(argv[argv.len() - 2], "./a.out");
        assert_eq!(argv[argv.len() - 1], "--flag");
        assert!(argv.iter().any(|a| a == "--error-exitcode=254"));
    }

    #[test]
    fn build_analyzer_argv_adds_soname_synonyms_when_stubs_lib_given() {
        let argv = build_analyzer_argv(
            Path::new("/usr/bin/valgrind"),
            Some(Path::new("/tmp/libcovex_stub.so")),
            &["./a.out".to_string()],
        );
        assert!(argv
            .iter()
            .any(|a| a == "--soname-synonyms=somalloc=/tmp/libcovex_stub.so"));
    }

    #[test]
    fn is_executable_true_for_shell() {
        assert!(is_executable("/bin/sh"));
    }

    #[test]
    fn is_executable_false_for_missing_path() {
        assert!(!is_executable("/no/such/program/covex-test"));
    }

    #[test]
    fn help_flag_is_reported_as_display_help_error() {
        // parse_cli() itself calls process::exit and can't be unit-tested
        // directly; this pins down the clap error kind it switches on.
        let err = Cli::try_parse_from(["covex", "-h"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
