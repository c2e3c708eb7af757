use crate::retry::RetryPolicy;
use chrono::FixedOffset;
use eyre::{Result, WrapErr, eyre};
use serde::Deserialize;
use std::{env, path::Path, time::Duration};
use tracing::{info, warn};

/// One managed seller account. The name doubles as the cache/ledger scope.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AccountConfig {
    #[serde(alias = "instance", alias = "instance_name", alias = "id")]
    pub name: String,
    pub telegram_token: String,
    pub wb_token: String,
    #[serde(default, alias = "adminIds")]
    pub admin_ids: Vec<i64>,
    #[serde(default)]
    pub daily_supply_enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub accounts: Vec<AccountConfig>,
    pub redis_url: Option<String>,
    pub daily_supply_enabled: bool,
    pub daily_hour: u32,
    pub daily_minute: u32,
    pub utc_offset: FixedOffset,
    pub supply_name_prefix: String,
    pub catalog_locale: String,
    pub content_max_parallel: usize,
    pub retry: RetryPolicy,
    pub port: u16,
    pub queue_capacity: usize,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        if let Err(err) = dotenvy::dotenv()
            && !err.not_found()
        {
            warn!(target = "supply.config", error = %err, "ignoring unreadable .env file");
        }

        let accounts = match env::var("ACCOUNTS") {
            Ok(raw) if !raw.trim().is_empty() => {
                load_accounts(&raw).wrap_err("ACCOUNTS must be a JSON/YAML list or a path to one")?
            }
            _ => Vec::new(),
        };
        info!(
            target = "supply.config",
            account_count = accounts.len(),
            "loaded accounts"
        );

        let offset_hours = env::var("DAILY_SUPPLY_UTC_OFFSET_HOURS")
            .ok()
            .and_then(|v| v.trim().parse::<i32>().ok())
            .unwrap_or(3);
        let utc_offset = offset_from_hours(offset_hours)
            .ok_or_else(|| eyre!("DAILY_SUPPLY_UTC_OFFSET_HOURS out of range: {offset_hours}"))?;

        Ok(Self {
            accounts,
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()),
            daily_supply_enabled: env_bool("DAILY_SUPPLY_ENABLED").unwrap_or(true),
            daily_hour: env_u64("DAILY_SUPPLY_HOUR")
                .filter(|v| *v < 24)
                .unwrap_or(10) as u32,
            daily_minute: env_u64("DAILY_SUPPLY_MINUTE")
                .filter(|v| *v < 60)
                .unwrap_or(0) as u32,
            utc_offset,
            supply_name_prefix: env_string("SUPPLY_NAME_PREFIX")
                .unwrap_or_else(|| "AutoSupply".into()),
            catalog_locale: env_string("CATALOG_LOCALE").unwrap_or_else(|| "ru".into()),
            content_max_parallel: env_u64("WB_CONTENT_MAX_PARALLEL")
                .filter(|v| *v > 0)
                .unwrap_or(3) as usize,
            retry: RetryPolicy::from_env(),
            port: env::var("PORT")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(8000),
            queue_capacity: env_u64("QUEUE_CAPACITY")
                .filter(|v| *v > 0)
                .unwrap_or(16) as usize,
        })
    }

    /// Per-account switch, falling back to the global flag.
    pub fn enabled_for(&self, account: &AccountConfig) -> bool {
        account
            .daily_supply_enabled
            .unwrap_or(self.daily_supply_enabled)
    }
}

fn offset_from_hours(hours: i32) -> Option<FixedOffset> {
    hours.checked_mul(3600).and_then(FixedOffset::east_opt)
}

fn load_accounts(raw: &str) -> Result<Vec<AccountConfig>> {
    let raw = raw.trim();
    let path = Path::new(raw);
    if path.is_file() {
        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading accounts file {}", path.display()))?;
        parse_accounts(&contents)
    } else {
        parse_accounts(raw)
    }
}

/// Parses an account list. YAML is a superset of JSON, so both are accepted.
pub fn parse_accounts(raw: &str) -> Result<Vec<AccountConfig>> {
    let accounts: Vec<AccountConfig> =
        serde_yaml::from_str(raw).wrap_err("invalid account list")?;
    for account in &accounts {
        if account.name.trim().is_empty() {
            return Err(eyre!("every account needs a non-empty name"));
        }
    }
    Ok(accounts)
}

pub(crate) fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_u64_ms(key: &str) -> Option<Duration> {
    env_u64(key).map(Duration::from_millis)
}

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    let value = env::var(key).ok()?;
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
