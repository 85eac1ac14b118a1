use std::env;

use crate::services::mailer::SmtpSettings;

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub bind_addr: String,
    pub frontend_url: String,
    pub mailer_from: String,
    pub max_emails_per_hour: i32,
    pub delay_between_emails_ms: u64,
    pub worker_concurrency: usize,
    pub smtp: SmtpSettings,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            frontend_url: env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            mailer_from: env::var("MAILER_FROM")
                .unwrap_or_else(|_| "noreply@reachinbox.app".to_string()),
            max_emails_per_hour: parse_env("MAX_EMAILS_PER_HOUR", 200),
            delay_between_emails_ms: parse_env("DELAY_BETWEEN_EMAILS_MS", 2000),
            worker_concurrency: parse_env("WORKER_CONCURRENCY", 5),
            smtp: SmtpSettings {
                host: env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: parse_env("SMTP_PORT", 587),
                username: env::var("SMTP_USERNAME").ok(),
                password: env::var("SMTP_PASSWORD").ok(),
                timeout_ms: parse_env("SMTP_TIMEOUT_MS", 30_000),
            },
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
