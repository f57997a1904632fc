//! Worker configuration loaded from environment variables.
//!
//! Infrastructure endpoints use the shared variables (`NATS_URL`,
//! `LITELLM_URL`, `DATABASE_URL`); worker-specific settings use the
//! `CODEFORGE_WORKER_` prefix.

use std::env;

/// Runtime settings for the worker process.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub nats_url: String,
    pub litellm_url: String,
    pub litellm_api_key: String,
    pub database_url: String,
    pub log_level: String,
    pub log_service: String,
    pub health_port: u16,
    pub app_env: String,
}

impl WorkerSettings {
    /// Load settings from the environment, applying defaults for anything
    /// unset.
    pub fn from_env() -> Self {
        Self {
            nats_url: env_or("NATS_URL", "nats://localhost:4222"),
            litellm_url: env_or("LITELLM_URL", "http://localhost:4000"),
            litellm_api_key: env_or("LITELLM_MASTER_KEY", "sk-codeforge-dev"),
            database_url: env_or("DATABASE_URL", "codeforge.db"),
            log_level: env_or("CODEFORGE_WORKER_LOG_LEVEL", "info"),
            log_service: env_or("CODEFORGE_WORKER_LOG_SERVICE", "codeforge-worker"),
            health_port: env_or("CODEFORGE_WORKER_HEALTH_PORT", "8081")
                .parse()
                .unwrap_or(8081),
            app_env: env_or("APP_ENV", "production"),
        }
    }

    /// Whether dev-only handlers (benchmark-style requests) are enabled.
    pub fn is_development(&self) -> bool {
        self.app_env == "development"
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        let settings = WorkerSettings {
            nats_url: "nats://localhost:4222".into(),
            litellm_url: "http://localhost:4000".into(),
            litellm_api_key: String::new(),
            database_url: "codeforge.db".into(),
            log_level: "info".into(),
            log_service: "codeforge-worker".into(),
            health_port: 8081,
            app_env: "production".into(),
        };
        assert!(!settings.is_development());
        assert_eq!(settings.health_port, 8081);
    }

    #[test]
    fn development_gate() {
        let mut settings = WorkerSettings::from_env();
        settings.app_env = "development".into();
        assert!(settings.is_development());
    }
}
