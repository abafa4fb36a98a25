//! Log filter selection, the rolling file sink and panic crash artifacts.
//!
//! The CLI builds the subscriber itself; this module only decides what goes
//! where so the decisions can be tested without a global subscriber.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::Write,
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// ONNX Runtime is chatty at info; keep it quiet unless the user asks.
pub const DEFAULT_NOISE_FILTER: &str = "ort=warn";
pub const DEFAULT_FILE_NOISE_FILTER: &str = "ort=info";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "glacier-mapping";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

static PANIC_HOOK_INSTALL_LOCK: Mutex<()> = Mutex::new(());
static PANIC_HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static PANIC_HOOK_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static PANIC_ARTIFACT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub file_noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            file_noise_filter: DEFAULT_FILE_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        retention_files: usize,
        appender: RollingFileAppender,
    },
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Ready { log_dir, .. } => Some(log_dir),
            Self::Fallback {
                attempted_log_dir, ..
            } => attempted_log_dir.as_deref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready { .. } => None,
            Self::Fallback { reason, .. } => Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookInstallPlan {
    Installed {
        crash_dir: PathBuf,
    },
    AlreadyInstalled {
        crash_dir: PathBuf,
    },
    Fallback {
        attempted_crash_dir: Option<PathBuf>,
        reason: String,
    },
}

#[derive(Debug)]
struct PanicArtifactRecord {
    timestamp: chrono::DateTime<chrono::Utc>,
    thread_name: String,
    source_location: String,
    payload: String,
    backtrace_policy: String,
    backtrace_text: String,
}

/// Precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then the default.
/// The noise filter is only prepended when the user did not pick a filter explicitly.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = select_user_filter(options);
    let implicit = options.cli_log_filter.is_none() && options.verbose == 0;

    LoggingFilterPlan {
        console_filter: merge_noise_filter(&options.noise_filter, &user_filter, implicit),
        file_filter: merge_noise_filter(&options.file_noise_filter, &user_filter, implicit),
        user_filter,
    }
}

fn select_user_filter(options: &LoggingInitOptions) -> String {
    if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options
        .rust_log_env
        .as_deref()
        .filter(|f| !f.trim().is_empty())
    {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    }
}

fn merge_noise_filter(noise_filter: &str, user_filter: &str, include: bool) -> String {
    if include && !noise_filter.trim().is_empty() {
        format!("{noise_filter},{user_filter}")
    } else {
        user_filter.to_string()
    }
}

/// Daily-rotated `glacier-mapping.*.log` files under `<data_dir>/logs`.
pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready {
            log_dir,
            retention_files,
            appender,
        },
        Err(error) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Chain a hook that drops a `panic-*.log` artifact under `<data_dir>/logs/crash`
/// before the previous hook runs. Installing twice is a no-op.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookInstallPlan {
    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let Some(data_dir) = data_dir else {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: None,
            reason: "panic hook disabled: data_dir is not configured".to_string(),
        };
    };

    let crash_dir = data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: Some(crash_dir),
            reason: format!("failed to create crash artifact directory: {error}"),
        };
    }

    let _install_guard = PANIC_HOOK_INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let previous_hook = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |panic_info| {
        write_panic_artifact_guarded(&hook_dir, panic_info);
        previous_hook(panic_info);
    }));

    let _ = PANIC_HOOK_CRASH_DIR.set(crash_dir.clone());
    PanicHookInstallPlan::Installed { crash_dir }
}

fn write_panic_artifact_guarded(crash_dir: &Path, panic_info: &PanicHookInfo<'_>) {
    // A panic while writing the artifact must not recurse.
    if PANIC_HOOK_WRITE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        write_panic_artifact_file(crash_dir, &panic_record(panic_info))
    }));

    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write crash artifact under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash artifact under '{}'.",
            crash_dir.display()
        ),
    }

    PANIC_HOOK_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

fn panic_record(panic_info: &PanicHookInfo<'_>) -> PanicArtifactRecord {
    let backtrace = Backtrace::capture();
    let (backtrace_policy, backtrace_text) = match backtrace.status() {
        BacktraceStatus::Captured => ("captured".to_string(), backtrace.to_string()),
        BacktraceStatus::Disabled => (
            "disabled (set RUST_BACKTRACE=1 to enable)".to_string(),
            "<disabled>".to_string(),
        ),
        _ => ("unsupported".to_string(), "<unavailable>".to_string()),
    };

    PanicArtifactRecord {
        timestamp: chrono::Utc::now(),
        thread_name: thread::current().name().unwrap_or("<unnamed>").to_string(),
        source_location: panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "<unknown>".to_string()),
        payload: panic_payload_to_string(panic_info.payload()),
        backtrace_policy,
        backtrace_text,
    }
}

fn write_panic_artifact_file(
    crash_dir: &Path,
    report: &PanicArtifactRecord,
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;

    let sequence = PANIC_ARTIFACT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let artifact_path = crash_dir.join(format!(
        "panic-{}-{sequence:06}.log",
        report.timestamp.format("%Y%m%d-%H%M%S-%f")
    ));

    let mut file = fs::File::create(&artifact_path)?;
    writeln!(file, "timestamp_utc={}", report.timestamp.to_rfc3339())?;
    writeln!(file, "thread={}", report.thread_name)?;
    writeln!(file, "location={}", report.source_location)?;
    writeln!(file, "payload={}", report.payload)?;
    writeln!(file, "backtrace_policy={}", report.backtrace_policy)?;
    writeln!(file, "backtrace:")?;
    writeln!(file, "{}", report.backtrace_text)?;
    file.flush()?;

    Ok(artifact_path)
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(payload) = payload.downcast_ref::<&str>() {
        (*payload).to_string()
    } else if let Some(payload) = payload.downcast_ref::<String>() {
        payload.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    fn record(thread_name: &str) -> PanicArtifactRecord {
        PanicArtifactRecord {
            timestamp: chrono::Utc::now(),
            thread_name: thread_name.to_string(),
            source_location: "src/engine.rs:12:7".to_string(),
            payload: "tile worker exploded".to_string(),
            backtrace_policy: "captured".to_string(),
            backtrace_text: "fake backtrace".to_string(),
        }
    }

    #[test]
    fn cli_log_filter_overrides_everything() {
        let options = LoggingInitOptions {
            verbose: 2,
            cli_log_filter: Some("glacier_core=trace".to_string()),
            rust_log_env: Some("error".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "glacier_core=trace");
        assert_eq!(filters.console_filter, "glacier_core=trace");
        assert_eq!(filters.file_filter, "glacier_core=trace");
    }

    #[test]
    fn verbosity_maps_to_debug_and_trace() {
        let one = LoggingInitOptions {
            verbose: 1,
            rust_log_env: Some("warn".to_string()),
            ..Default::default()
        };
        let two = LoggingInitOptions {
            verbose: 2,
            ..one.clone()
        };

        assert_eq!(compose_logging_filters(&one).console_filter, "debug");
        assert_eq!(compose_logging_filters(&two).console_filter, "trace");
    }

    #[test]
    fn rust_log_env_gets_noise_filters() {
        let options = LoggingInitOptions {
            rust_log_env: Some("warn,glacier_core=debug".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "warn,glacier_core=debug");
        assert_eq!(filters.console_filter, "ort=warn,warn,glacier_core=debug");
        assert_eq!(filters.file_filter, "ort=info,warn,glacier_core=debug");
    }

    #[test]
    fn blank_rust_log_falls_back_to_default() {
        let options = LoggingInitOptions {
            rust_log_env: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(compose_logging_filters(&options).user_filter, "info");
    }

    #[test]
    fn file_sink_uses_log_dir_under_data_dir() {
        let data_dir = tempdir().expect("tempdir");
        let options = LoggingInitOptions {
            data_dir: Some(data_dir.path().to_path_buf()),
            retention_files: 0,
            ..Default::default()
        };

        match build_file_sink_plan(&options) {
            FileSinkPlan::Ready {
                log_dir,
                retention_files,
                ..
            } => {
                assert_eq!(log_dir, data_dir.path().join(DEFAULT_LOG_DIR_NAME));
                assert_eq!(retention_files, DEFAULT_LOG_RETENTION_FILES);
                assert!(log_dir.exists());
            }
            FileSinkPlan::Fallback { reason, .. } => {
                panic!("expected ready file sink, got fallback: {reason}")
            }
        }
    }

    #[test]
    fn file_sink_without_data_dir_falls_back() {
        let plan = build_file_sink_plan(&LoggingInitOptions::default());
        assert!(!plan.is_ready());
        assert!(plan.log_dir().is_none());
        assert!(plan
            .fallback_reason()
            .is_some_and(|r| r.contains("data_dir")));
    }

    #[test]
    fn file_sink_falls_back_when_log_dir_cannot_be_created() {
        let not_a_dir = NamedTempFile::new().expect("named temp file");
        let options = LoggingInitOptions {
            data_dir: Some(not_a_dir.path().to_path_buf()),
            ..Default::default()
        };

        let plan = build_file_sink_plan(&options);
        assert_eq!(
            plan.log_dir(),
            Some(not_a_dir.path().join(DEFAULT_LOG_DIR_NAME).as_path())
        );
        assert!(plan
            .fallback_reason()
            .is_some_and(|r| r.contains("failed to create log directory")));
    }

    #[test]
    fn panic_artifact_file_contains_required_sections() {
        let crash_dir = tempdir().expect("tempdir");
        let path = write_panic_artifact_file(crash_dir.path(), &record("tile-worker-1"))
            .expect("write artifact");
        let contents = fs::read_to_string(&path).expect("read artifact");

        assert!(path.starts_with(crash_dir.path()));
        assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("log"));
        assert!(contents.contains("timestamp_utc="));
        assert!(contents.contains("thread=tile-worker-1"));
        assert!(contents.contains("location=src/engine.rs:12:7"));
        assert!(contents.contains("payload=tile worker exploded"));
        assert!(contents.contains("backtrace:\nfake backtrace"));
    }

    #[test]
    fn panic_artifacts_get_distinct_names() {
        let crash_dir = tempdir().expect("tempdir");
        let report = record("main");
        let first = write_panic_artifact_file(crash_dir.path(), &report).expect("first");
        let second = write_panic_artifact_file(crash_dir.path(), &report).expect("second");
        assert_ne!(first, second);
    }

    #[test]
    fn panic_artifact_errors_when_directory_creation_fails() {
        let not_a_dir = NamedTempFile::new().expect("temp file");
        let crash_dir = not_a_dir.path().join("crash");
        assert!(write_panic_artifact_file(&crash_dir, &record("main")).is_err());
    }

    #[test]
    fn panic_payload_to_string_handles_common_payload_types() {
        let str_payload: &(dyn Any + Send) = &"boom";
        let string_payload: &(dyn Any + Send) = &"kaboom".to_string();
        let int_payload: &(dyn Any + Send) = &123_u32;

        assert_eq!(panic_payload_to_string(str_payload), "boom");
        assert_eq!(panic_payload_to_string(string_payload), "kaboom");
        assert_eq!(
            panic_payload_to_string(int_payload),
            "<non-string panic payload>"
        );
    }
}
