//! Terminal color policy for log output.
//!
//! Resolution order:
//! - An explicit `always` / `never` from the command line wins.
//! - `NO_COLOR` (any value) turns colors off.
//! - `EMACS` marks an inferior shell, which gets no escapes either.
//! - Otherwise colors follow whether the stream is a TTY.

use std::env;
use std::str::FromStr;

/// When log output may carry ANSI escapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorWhen {
    /// Decide from the environment and the stream.
    #[default]
    Auto,

    /// Force colors on.
    Always,

    /// Force colors off.
    Never,
}

impl ColorWhen {
    // ---
    /// Resolves the policy against an explicit TTY answer.
    ///
    /// Split out from [`ColorWhen::for_stderr`] so the environment rules can
    /// be checked without a terminal attached.
    pub fn resolve(self, is_tty: bool) -> bool {
        // ---
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => {
                if env::var_os("NO_COLOR").is_some() || env::var_os("EMACS").is_some() {
                    return false;
                }
                is_tty
            }
        }
    }

    /// Whether stderr, where tracing writes, should be colored.
    pub fn for_stderr(self) -> bool {
        // ---
        self.resolve(atty::is(atty::Stream::Stderr))
    }
}

impl FromStr for ColorWhen {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ColorWhen::Auto),
            "always" => Ok(ColorWhen::Always),
            "never" => Ok(ColorWhen::Never),
            other => Err(format!("unknown color mode '{other}' (auto|always|never)")),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn with_env_var<F: FnOnce()>(key: &str, val: &str, f: F) {
        // ---
        let prev = env::var_os(key);
        env::set_var(key, val);
        f();
        match prev {
            Some(v) => env::set_var(key, v),
            None => env::remove_var(key),
        }
    }

    #[test]
    fn explicit_modes_ignore_tty() {
        // ---
        assert!(ColorWhen::Always.resolve(false));
        assert!(!ColorWhen::Never.resolve(true));
    }

    #[test]
    fn auto_respects_no_color() {
        // ---
        with_env_var("NO_COLOR", "1", || {
            assert!(!ColorWhen::Auto.resolve(true));
            assert!(ColorWhen::Always.resolve(true));
        });
    }

    #[test]
    fn parses_cli_values() {
        // ---
        assert_eq!("Always".parse::<ColorWhen>(), Ok(ColorWhen::Always));
        assert_eq!("never".parse::<ColorWhen>(), Ok(ColorWhen::Never));
        assert!("sometimes".parse::<ColorWhen>().is_err());
    }
}
