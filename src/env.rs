//! Runtime environment detection.
//!
//! A single source of truth for test vs. development vs. production,
//! based on the `JARVIST_ENV` environment variable — used to pick test-safe
//! file paths (config dir, spool root) without threading a flag through
//! every constructor.

/// Application name, used for the platform config directory.
pub const APP_NAME: &str = "jarvist-sync-agent";

/// Runtime environment for the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Production environment (default).
    Production,
    /// Development environment.
    Development,
    /// Test environment — uses project-local tmp/ paths instead of
    /// platform config/data directories.
    Test,
}

impl Environment {
    /// Detect current environment from `JARVIST_ENV`. Also returns `Test`
    /// when compiled with `cfg(test)`, so unit tests never touch the
    /// platform config directory regardless of the ambient environment.
    #[must_use]
    pub fn current() -> Self {
        if cfg!(test) {
            return Self::Test;
        }
        match std::env::var("JARVIST_ENV").as_deref() {
            Ok("test") => Self::Test,
            Ok("development") | Ok("dev") => Self::Development,
            _ => Self::Production,
        }
    }

    #[must_use]
    pub fn is_test(self) -> bool {
        self == Self::Test
    }

    #[must_use]
    pub fn is_production(self) -> bool {
        self == Self::Production
    }

    #[must_use]
    pub fn is_development(self) -> bool {
        self == Self::Development
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Development => write!(f, "development"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Returns `true` if running in test mode.
///
/// Use this for timeouts, intervals, and file path fallbacks.
#[must_use]
pub fn is_any_test() -> bool {
    Environment::current().is_test()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_display() {
        assert_eq!(Environment::Production.to_string(), "production");
        assert_eq!(Environment::Development.to_string(), "development");
        assert_eq!(Environment::Test.to_string(), "test");
    }

    #[test]
    fn test_compiled_as_test_is_always_test_environment() {
        assert_eq!(Environment::current(), Environment::Test);
        assert!(is_any_test());
    }
}
