use log::{error, info, LevelFilter};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

static CRASH_LOG_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);
static SENTRY_GUARD: Mutex<Option<sentry::ClientInitGuard>> = Mutex::new(None);

/// Initialize Sentry monitoring with optional DSN.
/// If DSN is None or empty, Sentry will be disabled.
pub fn init_sentry(dsn: Option<&str>, environment: Option<&str>) -> bool {
    let dsn_value = match dsn {
        Some(d) if !d.is_empty() => d,
        _ => {
            info!("[SENTRY] No DSN provided - Sentry disabled");
            return false;
        }
    };

    let env_cow = environment.map(|e| std::borrow::Cow::Owned(e.to_string()));

    let guard = sentry::init((
        dsn_value,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: env_cow,
            attach_stacktrace: true,
            send_default_pii: false,
            ..Default::default()
        },
    ));

    if guard.is_enabled() {
        if let Ok(mut guard_lock) = SENTRY_GUARD.lock() {
            *guard_lock = Some(guard);
        }
        info!("[SENTRY] Initialized - Environment: {:?}", environment);
        true
    } else {
        info!("[SENTRY] Failed to initialize");
        false
    }
}

pub fn is_sentry_enabled() -> bool {
    SENTRY_GUARD
        .lock()
        .map(|guard| guard.as_ref().is_some_and(|g| g.is_enabled()))
        .unwrap_or(false)
}

/// Flush pending events and close the Sentry client.
pub fn shutdown_sentry() {
    let guard = SENTRY_GUARD.lock().ok().and_then(|mut lock| lock.take());
    if let Some(guard) = guard {
        info!("[SENTRY] Shutting down - flushing events");
        drop(guard);
    }
}

/// Report an error that keeps the profiler from being used at all.
pub fn capture_critical_error(context: &str, error: &str) {
    if is_sentry_enabled() {
        sentry::with_scope(
            |scope| {
                scope.set_tag("error_type", "critical");
                scope.set_tag("context", context);
                scope.set_level(Some(sentry::Level::Fatal));
            },
            || {
                sentry::capture_message(
                    &format!("[CRITICAL] {}: {}", context, error),
                    sentry::Level::Fatal,
                );
            },
        );
    }

    log_critical_error(context, error);
}

/// Initialize env_logger; defaults to `warn` unless RUST_LOG is set.
pub fn init_logger() {
    let mut builder = env_logger::Builder::from_default_env();

    if std::env::var("RUST_LOG").is_err() {
        builder.filter_level(LevelFilter::Warn);
    }

    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        )
    });

    let _ = builder.try_init();
}

/// Initialize crash logging and panic hook.
pub fn init_crash_logger() {
    let log_dir = crash_log_directory();
    let _ = fs::create_dir_all(&log_dir);

    let log_path = log_dir.join("rust_crash.log");

    if let Ok(mut path_guard) = CRASH_LOG_PATH.lock() {
        *path_guard = Some(log_path.clone());
    }

    std::panic::set_hook(Box::new(move |panic_info| {
        let crash_msg = format_panic_message(panic_info);

        if is_sentry_enabled() {
            sentry::capture_message(&crash_msg, sentry::Level::Fatal);
        }

        if let Err(e) = write_crash_log(&crash_msg) {
            error!("[CRASH LOGGER] Failed to write crash log: {}", e);
        }

        error!("\n{}", crash_msg);
    }));

    info!("[CRASH LOGGER] Initialized - Log: {:?}", log_path);
}

pub fn get_crash_log_path() -> Option<PathBuf> {
    CRASH_LOG_PATH.lock().ok().and_then(|guard| guard.clone())
}

fn crash_log_directory() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("TLBP2Control"))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn format_panic_message(panic_info: &std::panic::PanicHookInfo) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");

    let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic payload".to_string()
    };

    let location = panic_info
        .location()
        .map(|location| {
            format!(
                "{}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            )
        })
        .unwrap_or_else(|| "Unknown location".to_string());

    format!(
        r#"
===== RUST PANIC =====
Timestamp: {}
Location: {}
Message: {}
Thread: {:?}

Backtrace:
{:?}

"#,
        timestamp,
        location,
        payload,
        std::thread::current().name().unwrap_or("unnamed"),
        std::backtrace::Backtrace::capture()
    )
}

fn write_crash_log(message: &str) -> std::io::Result<()> {
    if let Some(log_path) = get_crash_log_path() {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        writeln!(file, "{}", message)?;
    }
    Ok(())
}

/// Log a critical error to the crash log without panicking.
pub fn log_critical_error(context: &str, error: &str) {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let message = format!(
        r#"
===== CRITICAL ERROR =====
Timestamp: {}
Context: {}
Error: {}

"#,
        timestamp, context, error
    );

    if let Err(e) = write_crash_log(&message) {
        error!("[CRASH LOGGER] Failed to write critical error: {}", e);
    }

    error!("{}", message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentry_stays_disabled_without_dsn() {
        assert!(!init_sentry(None, Some("test")));
        assert!(!init_sentry(Some(""), None));
        assert!(!is_sentry_enabled());
    }

    #[test]
    fn crash_log_lives_in_app_directory() {
        if dirs::data_local_dir().is_some() {
            assert!(crash_log_directory().ends_with("TLBP2Control"));
        }
    }
}
