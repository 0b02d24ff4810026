//! docjobs - Command-line interface for the document operation engine.
//!
//! A simple CLI for testing and manual use of the engine over a local
//! directory tree. Paths are resolved against `--root`; progress is reported
//! to stderr.

use clap::{Parser, Subcommand};
use docjobs::{
    DocumentRef, EngineConfig, FileOperationService, JobProgress, JobState, LocalProvider,
    OperationKind, ProgressListener, ProviderRegistry,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const AUTHORITY: &str = "local";

/// docjobs - Copy, move, delete and archive documents
#[derive(Parser, Debug)]
#[command(name = "docjobs")]
#[command(version = "0.1.0")]
#[command(about = "Copy, move, delete and archive files with progress tracking")]
struct Args {
    /// Directory all paths are resolved against
    #[arg(long, value_name = "PATH", default_value = ".", global = true)]
    root: PathBuf,

    /// Engine configuration file (TOML)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy files and directories into a directory
    Copy {
        #[arg(required = true, value_name = "PATH")]
        sources: Vec<PathBuf>,

        /// Destination directory
        #[arg(long, value_name = "PATH")]
        dst: PathBuf,
    },
    /// Move files and directories into a directory
    Move {
        #[arg(required = true, value_name = "PATH")]
        sources: Vec<PathBuf>,

        /// Destination directory
        #[arg(long, value_name = "PATH")]
        dst: PathBuf,
    },
    /// Delete files and directories
    Delete {
        #[arg(required = true, value_name = "PATH")]
        sources: Vec<PathBuf>,
    },
    /// Pack files and directories into a .tar.gz archive
    Compress {
        #[arg(required = true, value_name = "PATH")]
        sources: Vec<PathBuf>,

        /// Directory the archive is written to
        #[arg(long, value_name = "PATH")]
        dst: PathBuf,
    },
    /// Unpack .tar.gz archives into a directory
    Extract {
        #[arg(required = true, value_name = "ARCHIVE")]
        archives: Vec<PathBuf>,

        /// Destination directory
        #[arg(long, value_name = "PATH")]
        dst: PathBuf,
    },
}

impl Command {
    fn kind(&self) -> OperationKind {
        match self {
            Command::Copy { .. } => OperationKind::Copy,
            Command::Move { .. } => OperationKind::Move,
            Command::Delete { .. } => OperationKind::Delete,
            Command::Compress { .. } => OperationKind::Compress,
            Command::Extract { .. } => OperationKind::Extract,
        }
    }

    fn sources(&self) -> &[PathBuf] {
        match self {
            Command::Copy { sources, .. }
            | Command::Move { sources, .. }
            | Command::Delete { sources }
            | Command::Compress { sources, .. } => sources,
            Command::Extract { archives, .. } => archives,
        }
    }

    fn destination(&self) -> Option<&Path> {
        match self {
            Command::Copy { dst, .. }
            | Command::Move { dst, .. }
            | Command::Compress { dst, .. }
            | Command::Extract { dst, .. } => Some(dst),
            Command::Delete { .. } => None,
        }
    }
}

/// CLI progress listener rendering snapshots to stderr
struct CliProgress {
    verbose: bool,
    start_time: Instant,
    last_update: Mutex<Option<Instant>>,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            start_time: Instant::now(),
            last_update: Mutex::new(None),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn progress_bar(percent: u64) -> String {
        let percent = percent.min(100);
        let filled = (percent / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
    }

    fn percent(progress: &JobProgress) -> u64 {
        if progress.bytes_known() && progress.required_bytes > 0 {
            (progress.current_bytes as u64 * 100) / progress.required_bytes as u64
        } else if progress.total_files > 0 {
            progress.processed_files * 100 / progress.total_files
        } else {
            0
        }
    }

    fn status_line(progress: &JobProgress) -> String {
        let mut line = format!(
            "\r{} {} | {}/{} files",
            progress.msg,
            Self::progress_bar(Self::percent(progress)),
            progress.processed_files,
            progress.total_files
        );
        if progress.bytes_known() {
            line.push_str(&format!(
                " | {}/{}",
                Self::format_bytes(progress.current_bytes as u64),
                Self::format_bytes(progress.required_bytes as u64)
            ));
        }
        if progress.ms_remaining > 0 {
            line.push_str(&format!(
                " | {} left",
                Self::format_duration(Duration::from_millis(progress.ms_remaining as u64))
            ));
        }
        line
    }

    fn print_summary(&self, progress: &JobProgress) {
        eprintln!();
        eprintln!("{}", progress.msg);
        eprintln!(
            "Summary: {} processed, {} failed",
            progress.processed_files, progress.failed_files
        );
        if progress.bytes_known() {
            eprintln!(
                "Bytes written: {}",
                Self::format_bytes(progress.current_bytes as u64)
            );
        }
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));
    }
}

impl ProgressListener for CliProgress {
    fn on_progress(&self, progress: &JobProgress) {
        if progress.state.is_terminal() {
            self.print_summary(progress);
            return;
        }
        if self.verbose {
            debug!(
                processed = progress.processed_files,
                failed = progress.failed_files,
                "{:?}",
                progress.state
            );
        }

        // Throttle redraws (max once per 200ms)
        let mut last = match self.last_update.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if last.map_or(false, |at| at.elapsed() < Duration::from_millis(200)) {
            return;
        }
        *last = Some(Instant::now());

        eprint!("{}", Self::status_line(progress));
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("docjobs=debug,warn")
    } else {
        EnvFilter::new("docjobs=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Parse and validate command-line arguments, then run the job
fn main() {
    let args = Args::parse();
    setup_logging(args.verbose);

    // Exit code tracking
    let exit_code = match run_cli(&args) {
        Ok(()) => 0,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

fn resolve(provider: &LocalProvider, path: &Path, what: &str) -> Result<DocumentRef, String> {
    provider
        .resolve_path(path)
        .map_err(|e| format!("{} not found: {} ({})", what, path.display(), e))
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args) -> Result<(), String> {
    if !args.root.is_dir() {
        return Err(format!("Root is not a directory: {}", args.root.display()));
    }
    let root = args
        .root
        .canonicalize()
        .map_err(|e| format!("Cannot resolve root {}: {}", args.root.display(), e))?;

    let config = match &args.config {
        Some(path) => EngineConfig::load(path).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };

    let provider = Arc::new(LocalProvider::new(AUTHORITY, &root));
    let sources = args
        .command
        .sources()
        .iter()
        .map(|path| resolve(&provider, path, "Source"))
        .collect::<Result<Vec<_>, _>>()?;
    let destination = match args.command.destination() {
        Some(path) => Some(resolve(&provider, path, "Destination")?),
        None => None,
    };

    let mut registry = ProviderRegistry::new();
    registry.register(provider);
    let service =
        FileOperationService::new(registry, config).map_err(|e| format!("Invalid configuration: {}", e))?;

    let id = service
        .submit(args.command.kind(), &sources, destination.as_ref())
        .map_err(|e| format!("Job creation failed: {}", e))?;
    service.subscribe(id, Arc::new(CliProgress::new(args.verbose)));

    let progress = service
        .wait(id)
        .map_err(|e| format!("Job execution failed: {}", e))?;

    match progress.state {
        JobState::Completed if !progress.has_failures => Ok(()),
        JobState::Completed => Err(format!(
            "{} of {} documents failed",
            progress.failed_files, progress.total_files
        )),
        JobState::Canceled => Err("Job was canceled".to_string()),
        state => Err(format!("Job ended in state {:?}", state)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(root: &Path, command: Command) -> Args {
        Args {
            root: root.to_path_buf(),
            config: None,
            verbose: false,
            command,
        }
    }

    #[test]
    fn test_cli_copy_directory() {
        let root = TempDir::new().expect("Failed to create temp dir");
        std::fs::create_dir(root.path().join("src")).expect("Failed to create dir");
        std::fs::create_dir(root.path().join("dst")).expect("Failed to create dir");
        std::fs::write(root.path().join("src/test.txt"), "hello").expect("Failed to write file");

        let result = run_cli(&args(
            root.path(),
            Command::Copy {
                sources: vec![PathBuf::from("src")],
                dst: PathBuf::from("dst"),
            },
        ));
        assert!(result.is_ok(), "CLI should succeed with valid directories");
        let copied =
            std::fs::read_to_string(root.path().join("dst/src/test.txt")).expect("Missing copy");
        assert_eq!(copied, "hello");
    }

    #[test]
    fn test_cli_compress_and_extract() {
        let root = TempDir::new().expect("Failed to create temp dir");
        std::fs::create_dir_all(root.path().join("docs/inner")).expect("Failed to create dir");
        std::fs::create_dir(root.path().join("out")).expect("Failed to create dir");
        std::fs::write(root.path().join("docs/inner/a.txt"), "alpha").expect("Failed to write file");

        run_cli(&args(
            root.path(),
            Command::Compress {
                sources: vec![PathBuf::from("docs")],
                dst: PathBuf::from("."),
            },
        ))
        .expect("Compress failed");
        assert!(root.path().join("docs.tar.gz").is_file());

        run_cli(&args(
            root.path(),
            Command::Extract {
                archives: vec![PathBuf::from("docs.tar.gz")],
                dst: PathBuf::from("out"),
            },
        ))
        .expect("Extract failed");
        let extracted = std::fs::read_to_string(root.path().join("out/docs/inner/a.txt"))
            .expect("Missing extracted file");
        assert_eq!(extracted, "alpha");
    }

    #[test]
    fn test_cli_delete() {
        let root = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(root.path().join("old.txt"), "x").expect("Failed to write file");

        run_cli(&args(
            root.path(),
            Command::Delete {
                sources: vec![PathBuf::from("old.txt")],
            },
        ))
        .expect("Delete failed");
        assert!(!root.path().join("old.txt").exists());
    }

    #[test]
    fn test_cli_rejects_missing_source() {
        let root = TempDir::new().expect("Failed to create temp dir");
        std::fs::create_dir(root.path().join("dst")).expect("Failed to create dir");

        let result = run_cli(&args(
            root.path(),
            Command::Copy {
                sources: vec![PathBuf::from("nonexistent")],
                dst: PathBuf::from("dst"),
            },
        ));
        assert!(result.is_err(), "CLI should fail with a missing source");
    }

    #[test]
    fn test_cli_rejects_copy_into_itself() {
        let root = TempDir::new().expect("Failed to create temp dir");
        std::fs::create_dir_all(root.path().join("src/sub")).expect("Failed to create dir");

        let result = run_cli(&args(
            root.path(),
            Command::Copy {
                sources: vec![PathBuf::from("src")],
                dst: PathBuf::from("src/sub"),
            },
        ));
        let err = result.expect_err("Recursive copy should fail");
        assert!(err.contains("into itself"), "unexpected error: {}", err);
        assert_eq!(
            std::fs::read_dir(root.path().join("src/sub"))
                .expect("Failed to read dir")
                .count(),
            0
        );
    }

    #[test]
    fn test_cli_rejects_bad_config() {
        let root = TempDir::new().expect("Failed to create temp dir");
        let config = root.path().join("engine.toml");
        std::fs::write(&config, "chunk_size = 0\n").expect("Failed to write config");
        std::fs::write(root.path().join("a.txt"), "a").expect("Failed to write file");

        let mut args = args(
            root.path(),
            Command::Delete {
                sources: vec![PathBuf::from("a.txt")],
            },
        );
        args.config = Some(config);
        assert!(run_cli(&args).is_err());
        assert!(root.path().join("a.txt").exists());
    }

    #[test]
    fn test_progress_bar_format() {
        assert_eq!(CliProgress::progress_bar(0), "[                    ] 0%");
        assert_eq!(CliProgress::progress_bar(50), "[==========          ] 50%");
        assert_eq!(CliProgress::progress_bar(150), "[====================] 100%");
    }
}
