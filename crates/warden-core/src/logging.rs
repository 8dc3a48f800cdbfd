//! Logger bootstrap shared by the warden daemon and CLI.

use env_logger::Env;
use serde_json::json;
use std::env;
use std::io::Write;
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "WARDEN_LOG_FORMAT";
const LEVEL_ENV: &str = "WARDEN_LOG_LEVEL";

/// Install the process-wide logger. Only the first call has any effect.
///
/// `RUST_LOG` wins when set; otherwise `WARDEN_LOG_LEVEL` or `default_level`
/// is used. Output is JSON lines unless `WARDEN_LOG_FORMAT=plain`.
pub fn init(default_level: &str) {
    let _ = INIT.get_or_init(|| configure(default_level));
}

fn configure(default_level: &str) {
    let level = env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    let env = Env::default().default_filter_or(level);
    let plain = env::var(FORMAT_ENV)
        .map(|value| value.eq_ignore_ascii_case("plain"))
        .unwrap_or(false);

    let mut builder = env_logger::Builder::from_env(env);
    if plain {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {} - {}",
                buf.timestamp(),
                record.level().to_string().to_lowercase(),
                record.target(),
                record.args()
            )
        });
    } else {
        let pid = std::process::id();
        builder.format(move |buf, record| {
            let payload = json!({
                "timestamp": buf.timestamp().to_string(),
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "pid": pid,
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", payload)
        });
    }

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialize logger: {}", err);
    }
}
