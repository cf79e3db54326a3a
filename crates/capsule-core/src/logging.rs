//! Logging bootstrapper for the capsule binary and its integration tests.

use env_logger::Env;
use serde_json::json;
use std::env;
use std::io::Write;
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "CAPSULE_LOG_FORMAT";
const LEVEL_ENV: &str = "CAPSULE_LOG_LEVEL";

/// Initialize the global logger.
///
/// The first caller wins; subsequent calls are no-ops. If `RUST_LOG` is
/// unset, the `default_level` argument is used, overridable via
/// `CAPSULE_LOG_LEVEL`. `CAPSULE_LOG_FORMAT=json` switches to one JSON object
/// per line. Output always goes to stderr so stdout stays parsable.
pub fn init(default_level: &str) {
    let _ = INIT.get_or_init(|| configure(default_level));
}

fn configure(default_level: &str) {
    let level = env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    let env = Env::default().default_filter_or(level);

    let format = env::var(FORMAT_ENV)
        .unwrap_or_else(|_| String::from("plain"))
        .to_lowercase();

    let mut builder = env_logger::Builder::from_env(env);
    builder.target(env_logger::Target::Stderr);
    if format == "json" {
        builder.format(|buf, record| {
            let ts = buf.timestamp().to_string();
            let payload = json!({
                "timestamp": ts,
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", payload)
        });
    } else {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}",
                record.level().to_string().to_lowercase(),
                record.args()
            )
        });
    }

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialize logger: {}", err);
    }
}
