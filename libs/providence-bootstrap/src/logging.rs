use crate::config::{LoggingConfig, Section};
use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// Keeps the non-blocking console worker alive for the life of the process.
static CONSOLE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

const DEFAULT_SECTION: &str = "default";
const DEFAULT_MAX_SIZE_MB: u64 = 100;

fn parse_level(s: &str) -> Option<LevelFilter> {
    let level = match s.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        "off" | "none" => return Some(LevelFilter::OFF),
        "" => return None,
        _ => Level::INFO,
    };
    Some(LevelFilter::from_level(level))
}

// ================= rotating file writer =================

#[derive(Clone)]
struct RotatingFile(Arc<Mutex<FileRotate<AppendTimestamp>>>);

impl RotatingFile {
    fn open(path: &Path, section: &Section) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let limit = match section.max_backups {
            Some(n) => FileLimit::MaxFiles(n),
            None => FileLimit::Age(chrono::Duration::days(
                i64::from(section.max_age_days.unwrap_or(1)),
            )),
        };
        let max_bytes = section.max_size_mb.unwrap_or(DEFAULT_MAX_SIZE_MB) as usize * 1024 * 1024;
        let rotate = FileRotate::new(
            path,
            AppendTimestamp::default(limit),
            ContentLimit::BytesSurpassed(max_bytes),
            Compression::None,
            None,
        );
        Ok(Self(Arc::new(Mutex::new(rotate))))
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.lock() {
            Ok(mut file) => file.write(buf),
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.0.lock() {
            Ok(mut file) => file.flush(),
            Err(_) => Ok(()),
        }
    }
}

/// Picks the file for a record by the longest configured target prefix,
/// falling back to the default section's file. Records with no file are dropped.
#[derive(Clone, Default)]
struct FileRouter {
    default: Option<RotatingFile>,
    by_target: Vec<(String, RotatingFile)>,
}

fn matches_target(target: &str, prefix: &str) -> bool {
    target == prefix
        || target
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with("::"))
}

impl FileRouter {
    fn build(cfg: &LoggingConfig, base_dir: &Path) -> Self {
        let mut router = Self::default();
        for (target, section) in cfg {
            if section.file.trim().is_empty() {
                continue;
            }
            let path = resolve_log_path(&section.file, base_dir);
            let file = match RotatingFile::open(&path, section) {
                Ok(file) => file,
                Err(e) => {
                    eprintln!(
                        "Failed to init log file for '{}': {} ({})",
                        target,
                        path.to_string_lossy(),
                        e
                    );
                    continue;
                }
            };
            if target == DEFAULT_SECTION {
                router.default = Some(file);
            } else {
                router.by_target.push((target.clone(), file));
            }
        }
        router
            .by_target
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
        router
    }

    fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_target.is_empty()
    }

    fn resolve(&self, target: &str) -> Option<RotatingFile> {
        self.by_target
            .iter()
            .find(|(prefix, _)| matches_target(target, prefix))
            .map(|(_, file)| file.clone())
            .or_else(|| self.default.clone())
    }
}

#[derive(Clone)]
struct RoutedWriter(Option<RotatingFile>);

impl Write for RoutedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.0 {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.0 {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> fmt::MakeWriter<'a> for FileRouter {
    type Writer = RoutedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RoutedWriter(self.default.clone())
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        RoutedWriter(self.resolve(meta.target()))
    }
}

fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

// ================= targets =================

/// Per-target level filter for one sink. `level_of` picks the section's level
/// for that sink; sections that disable the sink are skipped.
fn build_targets(
    cfg: &LoggingConfig,
    fallback: LevelFilter,
    level_of: impl Fn(&Section) -> Option<LevelFilter>,
) -> Targets {
    let default_level = cfg.get(DEFAULT_SECTION).and_then(&level_of).unwrap_or(fallback);
    cfg.iter()
        .filter(|(target, _)| target.as_str() != DEFAULT_SECTION)
        .filter_map(|(target, section)| level_of(section).map(|level| (target.clone(), level)))
        .fold(Targets::new().with_default(default_level), |targets, (target, level)| {
            targets.with_target(target, level)
        })
}

fn console_targets(cfg: &LoggingConfig) -> Targets {
    build_targets(cfg, LevelFilter::INFO, |section| {
        parse_level(&section.console_level)
    })
}

fn file_targets(cfg: &LoggingConfig, has_default_file: bool) -> Targets {
    let fallback = if has_default_file {
        LevelFilter::INFO
    } else {
        LevelFilter::OFF
    };
    build_targets(cfg, fallback, |section| {
        if section.file.trim().is_empty() {
            None
        } else {
            parse_level(&section.file_level)
        }
    })
}

// ================= public init =================

/// Installs the global subscriber: human-readable console output on stderr
/// plus JSON lines in rotating files, both filtered per target. `RUST_LOG`,
/// when set, caps both sinks. Relative file paths resolve against `base_dir`.
pub fn init_logging(cfg: &LoggingConfig, base_dir: &Path) {
    // Bridge `log` → `tracing` *before* installing the subscriber
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("LogTracer init skipped: {e}");
    }

    if cfg.is_empty() {
        init_minimal();
        return;
    }

    let router = FileRouter::build(cfg, base_dir);
    let console_filter = console_targets(cfg);
    let file_filter = file_targets(cfg, router.default.is_some());

    let (nb_stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);

    let console_layer = fmt::layer()
        .with_writer(nb_stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_level(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(console_filter);

    let file_layer = (!router.is_empty()).then(|| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(router)
            .with_filter(file_filter)
    });

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().ok())
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

/// Console-only logging at INFO, honoring `RUST_LOG`.
pub fn init_minimal() {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().ok())
        .with(fmt_layer)
        .try_init();
}
