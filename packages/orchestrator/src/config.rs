use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForgeStrategy {
    Conservative,
    Aggressive,
    Adaptive,
}

impl std::str::FromStr for ForgeStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "conservative" => Ok(ForgeStrategy::Conservative),
            "aggressive" => Ok(ForgeStrategy::Aggressive),
            "adaptive" => Ok(ForgeStrategy::Adaptive),
            other => anyhow::bail!("unknown forge strategy {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub cpu_shares: i64,
    pub memory_mb: i64,
    pub pids: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct HaConfig {
    pub enabled: bool,
    pub node_id: String,
    pub lock_key: String,
    pub lock_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct ScalerConfig {
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_up_increment: u32,
    pub scale_down_increment: u32,
    pub cooldown_period: Duration,
    pub queue_depth_threshold: i64,
    pub avg_wait_time_threshold: Duration,
    pub tick_interval: Duration,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            scale_up_increment: 5,
            scale_down_increment: 1,
            cooldown_period: Duration::from_secs(300),
            queue_depth_threshold: 5,
            avg_wait_time_threshold: Duration::from_secs(60),
            tick_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheTtls {
    pub static_entities: Duration,
    pub dynamic: Duration,
    pub realtime: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            static_entities: Duration::from_secs(3600),
            dynamic: Duration::from_secs(120),
            realtime: Duration::from_secs(60),
        }
    }
}

/// Closed application configuration loaded from environment variables.
///
/// No component reaches into `std::env` directly; everything it needs to
/// vary by deployment is enumerated here.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_replica_url: Option<String>,
    pub redis_url: String,
    pub port: u16,

    pub webhook_secret: Option<String>,
    pub forge_base_url: String,
    pub forge_token: String,
    pub organization: String,
    pub forge_strategy: ForgeStrategy,

    pub docker_socket: String,
    pub runner_image: String,
    pub trusted_registries: Vec<String>,
    pub limits: ResourceLimits,

    pub ha: HaConfig,
    pub scaler: ScalerConfig,
    pub cache_ttls: CacheTtls,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let node_id = env::var("NODE_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            database_replica_url: env::var("DATABASE_REPLICA_URL").ok(),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,

            webhook_secret: env::var("WEBHOOK_SECRET").ok(),
            forge_base_url: env::var("FORGE_BASE_URL")
                .unwrap_or_else(|_| "https://api.github.com".to_string()),
            forge_token: env::var("FORGE_TOKEN").context("FORGE_TOKEN must be set")?,
            organization: env::var("FORGE_ORGANIZATION")
                .context("FORGE_ORGANIZATION must be set")?,
            forge_strategy: env::var("FORGE_STRATEGY")
                .unwrap_or_else(|_| "adaptive".to_string())
                .parse()
                .context("FORGE_STRATEGY must be one of conservative|aggressive|adaptive")?,

            docker_socket: env::var("DOCKER_SOCKET")
                .unwrap_or_else(|_| "/var/run/docker.sock".to_string()),
            runner_image: env::var("RUNNER_IMAGE")
                .unwrap_or_else(|_| "self-hosted-runner:latest".to_string()),
            trusted_registries: env::var("TRUSTED_REGISTRIES")
                .ok()
                .map(|s| s.split(',').map(|r| r.trim().to_string()).collect())
                .unwrap_or_default(),
            limits: ResourceLimits {
                cpu_shares: env::var("RUNNER_CPU_SHARES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1024),
                memory_mb: env::var("RUNNER_MEMORY_MB")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(4096),
                pids: env::var("RUNNER_PIDS_LIMIT").ok().and_then(|v| v.parse().ok()),
            },

            ha: HaConfig {
                enabled: env::var("HA_ENABLED")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(false),
                node_id,
                lock_key: env::var("HA_LOCK_KEY")
                    .unwrap_or_else(|_| "orchestrator:leader".to_string()),
                lock_ttl: Duration::from_secs(
                    env::var("HA_LOCK_TTL_SECS")
                        .ok()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(15),
                ),
            },
            scaler: ScalerConfig::default(),
            cache_ttls: CacheTtls::default(),
        })
    }
}
