use std::{env, fmt::Display, str::FromStr};

use anyhow::Context;

/// Longest accepted session lifetime, about a century.
const MAX_SESSION_DAYS: i64 = 36_500;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub cookie_name: String,
    pub secret: String,
    pub max_age_days: i64,
    pub secure: bool,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub from: String,
    /// Base URL of the web client; reset links point at `<base>/change-password/<token>`.
    pub frontend_url: String,
    pub smtp: Option<SmtpConfig>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub cors_origin: String,
    pub kv_sweep_interval_secs: u64,
    pub session: SessionConfig,
    pub mail: MailConfig,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

fn parsed_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    parse_value(name, env::var(name).ok().as_deref(), default)
}

/// Unset falls back to `default`; set but unparsable is an error.
fn parse_value<T>(name: &str, raw: Option<&str>, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match raw {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{name}={v:?} is invalid: {e}")),
    }
}

fn check_session_days(days: i64) -> anyhow::Result<i64> {
    anyhow::ensure!(
        (1..=MAX_SESSION_DAYS).contains(&days),
        "SESSION_MAX_AGE_DAYS must be between 1 and {MAX_SESSION_DAYS}, got {days}"
    );
    Ok(days)
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
        let is_prod = var_or("APP_ENV", "development") == "production";

        let secret = env::var("SESSION_SECRET").context("SESSION_SECRET is not set")?;
        anyhow::ensure!(
            secret.len() >= 64,
            "SESSION_SECRET must be at least 64 bytes"
        );
        let session = SessionConfig {
            cookie_name: var_or("SESSION_COOKIE_NAME", "qid"),
            secret,
            max_age_days: check_session_days(parsed_or("SESSION_MAX_AGE_DAYS", 365 * 10)?)?,
            secure: is_prod,
        };

        let smtp = match env::var("SMTP_HOST").ok() {
            Some(host) => Some(SmtpConfig {
                host,
                port: parsed_or("SMTP_PORT", 587)?,
                username: env::var("SMTP_USERNAME").ok(),
                password: env::var("SMTP_PASSWORD").ok(),
            }),
            None => None,
        };
        let mail = MailConfig {
            from: var_or("MAIL_FROM", "Linkshare <no-reply@linkshare.local>"),
            frontend_url: var_or("FRONTEND_URL", "http://localhost:3000"),
            smtp,
        };

        let kv_sweep_interval_secs = parsed_or("KV_SWEEP_INTERVAL_SECS", 300)?;
        anyhow::ensure!(
            kv_sweep_interval_secs > 0,
            "KV_SWEEP_INTERVAL_SECS must be positive"
        );

        Ok(Self {
            database_url,
            cors_origin: var_or("CORS_ORIGIN", "http://localhost:3000"),
            kv_sweep_interval_secs,
            session,
            mail,
        })
    }
}
