use anyhow::{Context, Result, anyhow};
use ipnet::IpNet;
use std::env;
use std::path::PathBuf;

/// Published webhook egress ranges of the marketplace. Overridable via
/// INTAKE_SOURCE_ALLOWLIST for staging mirrors.
const DEFAULT_SOURCE_ALLOWLIST: &str =
    "54.88.218.97/32,18.215.140.160/28,18.213.114.129/28,18.206.34.84/29";

const DEFAULT_RETRY_SCHEDULE: &str = "5,30,300";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub environment: String,
    pub db_path: PathBuf,
    pub signing_secret: Option<String>,
    pub source_allowlist: Vec<IpNet>,
    pub enforce_ip_allowlist: bool,
    pub extra_topics: Vec<String>,
    pub freshness_window_seconds: i64,
    pub max_attempts: u32,
    pub retry_schedule_seconds: Vec<i64>,
    pub dlq_retention_seconds: i64,
    pub dlq_sweep_interval_seconds: u64,
    pub worker_count: usize,
    pub poll_interval_ms: u64,
    pub max_payload_bytes: usize,
    pub ip_limit_per_minute: u32,
    pub audit_log_limit_per_minute: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let environment =
            env::var("INTAKE_ENV").unwrap_or_else(|_| "production".to_string());
        // The allowlist is only bypassable outside production.
        let enforce_ip_allowlist = environment == "production";

        let allowlist_raw = env::var("INTAKE_SOURCE_ALLOWLIST")
            .unwrap_or_else(|_| DEFAULT_SOURCE_ALLOWLIST.to_string());
        let schedule_raw = env::var("INTAKE_RETRY_SCHEDULE_SECS")
            .unwrap_or_else(|_| DEFAULT_RETRY_SCHEDULE.to_string());

        let config = Self {
            bind_addr: env::var("INTAKE_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            environment,
            db_path: PathBuf::from(
                env::var("INTAKE_DB_PATH")
                    .unwrap_or_else(|_| "data/webhook-intake.redb".to_string()),
            ),
            signing_secret: env::var("INTAKE_SIGNING_SECRET")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            source_allowlist: parse_cidr_list(&allowlist_raw)?,
            enforce_ip_allowlist,
            extra_topics: parse_topic_list(
                &env::var("INTAKE_EXTRA_TOPICS").unwrap_or_default(),
            ),
            freshness_window_seconds: env_i64("INTAKE_FRESHNESS_WINDOW_SECS", 300)?,
            max_attempts: env_u32("INTAKE_MAX_ATTEMPTS", 3)?,
            retry_schedule_seconds: parse_retry_schedule(&schedule_raw)?,
            dlq_retention_seconds: env_i64("INTAKE_DLQ_RETENTION_SECS", 7 * 24 * 60 * 60)?,
            dlq_sweep_interval_seconds: env_u64("INTAKE_DLQ_SWEEP_INTERVAL_SECS", 3_600)?,
            worker_count: env_usize("INTAKE_WORKER_COUNT", 2)?,
            poll_interval_ms: env_u64("INTAKE_POLL_INTERVAL_MS", 250)?,
            max_payload_bytes: env_usize("INTAKE_MAX_PAYLOAD_BYTES", 1_048_576)?,
            ip_limit_per_minute: env_u32("INTAKE_IP_RATE_PER_MINUTE", 100)?,
            audit_log_limit_per_minute: env_u32("INTAKE_AUDIT_LOG_PER_MINUTE", 30)?,
        };

        if config.max_attempts == 0 {
            return Err(anyhow!("INTAKE_MAX_ATTEMPTS must be at least 1"));
        }

        if config.freshness_window_seconds <= 0 {
            return Err(anyhow!("INTAKE_FRESHNESS_WINDOW_SECS must be positive"));
        }

        if config.worker_count == 0 {
            return Err(anyhow!("INTAKE_WORKER_COUNT must be at least 1"));
        }

        Ok(config)
    }

    pub fn topic_is_known(&self, topic: &str) -> bool {
        crate::model::Topic::parse(topic).is_some()
            || self.extra_topics.iter().any(|extra| extra == topic)
    }
}

pub fn parse_cidr_list(raw: &str) -> Result<Vec<IpNet>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<IpNet>()
                .with_context(|| format!("invalid CIDR in allowlist: {entry}"))
        })
        .collect()
}

pub fn parse_retry_schedule(raw: &str) -> Result<Vec<i64>> {
    let delays = raw
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<i64>()
                .with_context(|| format!("invalid retry delay: {entry}"))
        })
        .collect::<Result<Vec<i64>>>()?;

    if delays.is_empty() {
        return Err(anyhow!("retry schedule cannot be empty"));
    }

    if delays.iter().any(|delay| *delay <= 0) {
        return Err(anyhow!("retry delays must be positive seconds"));
    }

    Ok(delays)
}

fn parse_topic_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn env_u32(name: &str, default: u32) -> Result<u32> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            value
                .parse::<u32>()
                .with_context(|| format!("invalid u32 for {name}"))
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            value
                .parse::<u64>()
                .with_context(|| format!("invalid u64 for {name}"))
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
}

fn env_i64(name: &str, default: i64) -> Result<i64> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            value
                .parse::<i64>()
                .with_context(|| format!("invalid i64 for {name}"))
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
}

fn env_usize(name: &str, default: usize) -> Result<usize> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            value
                .parse::<usize>()
                .with_context(|| format!("invalid usize for {name}"))
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_allowlist() {
        let cidrs = parse_cidr_list(DEFAULT_SOURCE_ALLOWLIST).expect("default allowlist");
        assert_eq!(cidrs.len(), 4);
        assert!(cidrs[0].contains(&"54.88.218.97".parse::<std::net::IpAddr>().expect("ip")));
    }

    #[test]
    fn rejects_malformed_cidr() {
        assert!(parse_cidr_list("10.0.0.0/8,not-a-cidr").is_err());
    }

    #[test]
    fn parses_retry_schedule_with_whitespace() {
        assert_eq!(
            parse_retry_schedule(" 5, 30 ,300 ").expect("schedule"),
            vec![5, 30, 300]
        );
    }

    #[test]
    fn rejects_empty_and_non_positive_schedules() {
        assert!(parse_retry_schedule("").is_err());
        assert!(parse_retry_schedule("5,0,300").is_err());
        assert!(parse_retry_schedule("5,-30").is_err());
    }
}
