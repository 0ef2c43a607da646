//! Process-wide quiet switch for CLI output

use std::sync::OnceLock;

static QUIET: OnceLock<bool> = OnceLock::new();

const QUIET_ENV: &str = "OIDSTORE_QUIET";

/// Force quiet mode on; the environment is ignored once this has run
pub fn set_quiet() {
    let _ = QUIET.set(true);
}

/// True under `--quiet` or `OIDSTORE_QUIET=1|true`
pub fn is_quiet() -> bool {
    *QUIET.get_or_init(|| env_flag(std::env::var(QUIET_ENV).ok().as_deref()))
}

fn env_flag(value: Option<&str>) -> bool {
    matches!(value, Some(v) if v == "1" || v.eq_ignore_ascii_case("true"))
}
