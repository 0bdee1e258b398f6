use std::env;

/// Engine configuration. Every field has a default; `from_env` overrides
/// from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Abort the propagation cycle on the first node failure and poison the
    /// engine, instead of delivering failures to dependent observers.
    pub fail_strict: bool,
    /// Name of the engine's execution thread.
    pub thread_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fail_strict: false,
            thread_name: "rete-engine".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from `RETE_FAIL_STRICT` and `RETE_THREAD_NAME`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            fail_strict: env::var("RETE_FAIL_STRICT")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.fail_strict),
            thread_name: env::var("RETE_THREAD_NAME").unwrap_or(defaults.thread_name),
        }
    }

    pub fn with_fail_strict(mut self, fail_strict: bool) -> Self {
        self.fail_strict = fail_strict;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
