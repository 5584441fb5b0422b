//! Environment variable utilities
//!
//! `env_get<T>` parses a variable with a fallback; booleans use the same
//! spellings the kernel's `kstrtobool` accepts, which is also how the
//! control surface parses writes to `enabled` and `force`.
//!
//! ```ignore
//! use klp_core::env::{env_get, env_get_bool};
//!
//! let interval: u32 = env_get("KLP_SIGNALS_INTERVAL", 15);
//! let request: bool = env_get_bool("KLP_REQUEST_COMPANIONS", true);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Unset or unparsable values return the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

/// Parse a boolean like `kstrtobool`
///
/// Looks at the first character only (`1`, `y`, `Y`, `0`, `n`, `N`) and at
/// the second one for `on`/`off`. Full words `true`/`false` are accepted
/// as well. A trailing newline is ignored.
pub fn parse_bool(s: &str) -> Option<bool> {
    let s = s.strip_suffix('\n').unwrap_or(s);
    let b = s.as_bytes();
    match b.first()? {
        b'1' | b'y' | b'Y' => Some(true),
        b'0' | b'n' | b'N' => Some(false),
        b'o' | b'O' => match b.get(1)? {
            b'n' | b'N' => Some(true),
            b'f' | b'F' => Some(false),
            _ => None,
        },
        b't' | b'T' if s.eq_ignore_ascii_case("true") => Some(true),
        b'f' | b'F' if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}
