use std::sync::OnceLock;

/// Process-wide engine settings. Read from the environment on first use
/// unless [`install`] ran before that.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindConfig {
    /// Emit a `trace!` event for every dispatched call.
    pub trace_dispatch: bool,
    /// Default registration policy for type builders that do not pick one.
    pub force_register: bool,
    /// Translate panics from native callables into `RuntimeError`. When off,
    /// a panic at the dispatch boundary aborts the process.
    pub catch_panics: bool,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            trace_dispatch: false,
            force_register: false,
            catch_panics: true,
        }
    }
}

impl BindConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            trace_dispatch: env_flag("MOLT_BIND_TRACE", defaults.trace_dispatch),
            force_register: env_flag("MOLT_BIND_FORCE_REGISTER", defaults.force_register),
            catch_panics: env_flag("MOLT_BIND_CATCH_PANICS", defaults.catch_panics),
        }
    }
}

static CONFIG: OnceLock<BindConfig> = OnceLock::new();

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|val| !val.is_empty() && val != "0")
        .unwrap_or(default)
}

pub fn config() -> &'static BindConfig {
    CONFIG.get_or_init(BindConfig::from_env)
}

/// Overrides the environment-derived settings. Fails with the rejected
/// config once settings have been read or installed.
pub fn install(config: BindConfig) -> Result<(), BindConfig> {
    CONFIG.set(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_catch_panics() {
        let cfg = BindConfig::default();
        assert!(cfg.catch_panics);
        assert!(!cfg.force_register);
        assert!(!cfg.trace_dispatch);
    }

    #[test]
    fn test_unset_flag_uses_default() {
        assert!(env_flag("MOLT_BIND_TEST_UNSET_FLAG", true));
        assert!(!env_flag("MOLT_BIND_TEST_UNSET_FLAG", false));
    }

    #[test]
    fn test_install_after_read_is_rejected() {
        let current = config().clone();
        let rejected = install(BindConfig::default()).unwrap_err();
        assert_eq!(rejected, BindConfig::default());
        assert_eq!(config(), &current);
    }
}
