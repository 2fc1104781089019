use std::{fs, path::Path, str::FromStr, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use shared::domain::NetworkEnv;
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "sync_engine.toml";
const ENV_PREFIX: &str = "APP__";
pub const MIN_RECREATE_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub env: NetworkEnv,
    pub discovery_interval_ms: u64,
    pub readiness_max_retries: u32,
    pub readiness_retry_delay_ms: u64,
    pub init_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_max_attempts: u32,
    pub recovery_cooldown_secs: u64,
    pub recreate_attempts: u32,
    /// Wipe the local identity store without waiting for user consent.
    pub auto_wipe_identity: bool,
    pub page_size: u32,
    pub event_buffer: usize,
    pub cache_database_url: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            env: NetworkEnv::Dev,
            discovery_interval_ms: 5_000,
            readiness_max_retries: 5,
            readiness_retry_delay_ms: 2_000,
            init_timeout_secs: 60,
            backoff_base_ms: 500,
            backoff_cap_ms: 8_000,
            backoff_max_attempts: 5,
            recovery_cooldown_secs: 30,
            recreate_attempts: 2,
            auto_wipe_identity: false,
            page_size: 50,
            event_buffer: 1024,
            cache_database_url: None,
        }
    }
}

impl EngineSettings {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn readiness_policy(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            max_retries: self.readiness_max_retries,
            retry_delay: Duration::from_millis(self.readiness_retry_delay_ms),
            backoff: self.backoff_policy(),
        }
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
            max_attempts: self.backoff_max_attempts.max(1),
        }
    }

    pub fn recovery_cooldown(&self) -> Duration {
        Duration::from_secs(self.recovery_cooldown_secs)
    }

    /// Client recreations per ladder. The identity wipe only follows two
    /// failed recreations, so fewer is raised to two.
    pub fn recreate_attempts(&self) -> u32 {
        self.recreate_attempts.max(MIN_RECREATE_ATTEMPTS)
    }
}

/// Fixed-delay retry budget for group readiness checks, plus the backoff
/// used when a direct check hits a network error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff: BackoffPolicy,
}

/// Capped exponential backoff: `base * 2^n`, never above `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

/// Reads `sync_engine.toml` from the working directory, then applies `APP__*`
/// environment overrides. Missing or unreadable files fall back to defaults.
pub fn load_settings() -> EngineSettings {
    let settings = match load_settings_file(Path::new(DEFAULT_SETTINGS_FILE)) {
        Ok(Some(settings)) => settings,
        Ok(None) => EngineSettings::default(),
        Err(err) => {
            warn!(error = %err, "config: ignoring unreadable settings file");
            EngineSettings::default()
        }
    };
    apply_env_overrides(settings, |key| std::env::var(key).ok())
}

pub fn load_settings_file(path: &Path) -> anyhow::Result<Option<EngineSettings>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()))
        }
    };
    let settings = toml::from_str::<EngineSettings>(&raw)
        .with_context(|| format!("failed to parse '{}'", path.display()))?;
    Ok(Some(settings))
}

pub fn apply_env_overrides(
    mut settings: EngineSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> EngineSettings {
    let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

    if let Some(v) = var("ENV") {
        match NetworkEnv::from_str(&v) {
            Ok(env) => settings.env = env,
            Err(err) => warn!(%err, "config: ignoring APP__ENV"),
        }
    }
    override_parsed(&mut settings.discovery_interval_ms, var("DISCOVERY_INTERVAL_MS"));
    override_parsed(&mut settings.readiness_max_retries, var("READINESS_MAX_RETRIES"));
    override_parsed(
        &mut settings.readiness_retry_delay_ms,
        var("READINESS_RETRY_DELAY_MS"),
    );
    override_parsed(&mut settings.init_timeout_secs, var("INIT_TIMEOUT_SECS"));
    override_parsed(&mut settings.backoff_base_ms, var("BACKOFF_BASE_MS"));
    override_parsed(&mut settings.backoff_cap_ms, var("BACKOFF_CAP_MS"));
    override_parsed(&mut settings.backoff_max_attempts, var("BACKOFF_MAX_ATTEMPTS"));
    override_parsed(
        &mut settings.recovery_cooldown_secs,
        var("RECOVERY_COOLDOWN_SECS"),
    );
    override_parsed(&mut settings.recreate_attempts, var("RECREATE_ATTEMPTS"));
    override_parsed(&mut settings.auto_wipe_identity, var("AUTO_WIPE_IDENTITY"));
    override_parsed(&mut settings.page_size, var("PAGE_SIZE"));
    if let Some(v) = var("CACHE_DATABASE_URL") {
        settings.cache_database_url = (!v.trim().is_empty()).then_some(v);
    }

    settings
}

fn override_parsed<T: FromStr>(slot: &mut T, raw: Option<String>) {
    if let Some(raw) = raw {
        if let Ok(parsed) = raw.trim().parse::<T>() {
            *slot = parsed;
        }
    }
}
