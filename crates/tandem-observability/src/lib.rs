use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tandem_types::{AuditEvent, AuditEventKind};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// Initializes the process-wide `tracing` subscriber: an `EnvFilter` layer
/// (default `info`, overridable via `RUST_LOG`/`TANDEM_LOG`) plus an
/// optional non-blocking rolling-file layer for long-running processes.
/// Returns the file appender's guard — drop it to flush on shutdown.
pub fn init_logging(logs_dir: &Path, retention_days: u64) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("tandem.runtime")
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true);

    let filter = std::env::var("TANDEM_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        logs_dir: logs_dir.display().to_string(),
        prefix: "tandem.runtime".to_string(),
        retention_days,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

fn cleanup_old_jsonl(logs_dir: &Path, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let prefix = "tandem.runtime.";

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if !name.starts_with(prefix) || !name.ends_with(".jsonl") {
            continue;
        }

        // expected: tandem.runtime.YYYY-MM-DD.jsonl
        let date_part = name.trim_start_matches(prefix).trim_end_matches(".jsonl");

        let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };

        let Some(dt) = date.and_hms_opt(0, 0, 0) else {
            continue;
        };

        if DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc) < cutoff {
            let _ = fs::remove_file(path);
        }
    }

    Ok(())
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

/// Records a scheduling decision as a structured `tracing` event, mirroring
/// whatever was (or will be) delivered through an `AuditSink`. Blocked/error
/// events log at `warn`, circuit-breaker recovery and completions at `info`,
/// so operators watching the console see failures without instrumenting the
/// sink separately.
pub fn emit_audit_event(event: &AuditEvent) {
    let level = match event.event {
        AuditEventKind::RunError
        | AuditEventKind::RunBlockedBudget
        | AuditEventKind::RunBlockedCircuitBreaker
        | AuditEventKind::RunBlockedKillSwitch
        | AuditEventKind::CircuitBreakerOpened
        | AuditEventKind::RunMaxLockHoldReleased => Level::WARN,
        _ => Level::INFO,
    };

    let run_id = event.run_id.as_ref().map(|id| id.as_str()).unwrap_or("");
    let data = event
        .data
        .as_ref()
        .map(|d| serde_json::to_string(d).unwrap_or_default())
        .unwrap_or_default();

    match level {
        Level::WARN => tracing::warn!(
            target: "tandem.audit",
            tenant_id = event.tenant_id.as_str(),
            run_id,
            event = ?event.event,
            data,
            at_ms = event.at_ms,
            "audit_event"
        ),
        _ => tracing::info!(
            target: "tandem.audit",
            tenant_id = event.tenant_id.as_str(),
            run_id,
            event = ?event.event,
            data,
            at_ms = event.at_ms,
            "audit_event"
        ),
    }
}
