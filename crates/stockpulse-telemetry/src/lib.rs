mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

/// Configuration for logging.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "stockpulse_notify" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines on stdout instead of the human-readable format.
    pub json: bool,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            log_to_sqlite: true,
            log_db_path: data_dir().join("logs.db"),
        }
    }
}

impl TelemetryConfig {
    /// Build the filter directive string, e.g. `info,stockpulse_notify=debug`.
    pub fn filter_directives(&self) -> String {
        join_directives(&self.log_level.to_string().to_lowercase(), &self.module_levels)
    }
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Handle kept alive for the lifetime of the process.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    /// Directives the module overrides are appended to (RUST_LOG or the configured level).
    base_directives: String,
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
    filter: FilterHandle,
}

impl TelemetryGuard {
    /// Change the level of one module at runtime. The active filter is
    /// rebuilt from the base directives plus every override so far.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let directives = {
            let mut levels = self.level_filter.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            join_directives(&self.base_directives, &levels)
        };

        if let Err(e) = self.filter.reload(EnvFilter::new(&directives)) {
            tracing::warn!(error = %e, directives = %directives, "failed to reload log filter");
        }
    }

    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }

    /// Directives currently in force.
    pub fn directives(&self) -> String {
        join_directives(&self.base_directives, &self.level_filter.read())
    }

    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

fn join_directives(base: &str, levels: &[(String, Level)]) -> String {
    let mut filter = base.to_string();
    for (module, level) in levels {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

/// Filter shared by every output layer, swappable through the returned handle.
fn reloadable_filter(directives: &str) -> (reload::Layer<EnvFilter, Registry>, FilterHandle) {
    reload::Layer::new(EnvFilter::new(directives))
}

/// Initialize logging. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let base_directives = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| config.log_level.to_string().to_lowercase());
    let (filter_layer, filter) =
        reloadable_filter(&join_directives(&base_directives, &config.module_levels));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("stockpulse-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(sqlite_layer)
        .init();

    TelemetryGuard {
        log_sink: sqlite_sink,
        base_directives,
        level_filter: Arc::new(RwLock::new(config.module_levels)),
        filter,
    }
}

/// Per-user data directory, `~/.stockpulse`.
pub fn data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".stockpulse")
}
