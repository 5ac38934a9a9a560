use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::{
    player::PlayerSettings,
    queue::{VOLUME_MAX, VOLUME_MIN},
};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub dev_guilds: Vec<u64>, // Para comandos de desarrollo

    // Reproductor
    pub idle_disconnect_minutes: u64,
    pub default_volume: u16, // Porcentaje 0-200
    pub max_queue_size: usize,
    pub status_refresh_ms: u64,

    // Logging
    pub log_level: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Construye la configuración a partir de una función de búsqueda de variables
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| -> String {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Ok(Self {
            discord_token: lookup("DISCORD_TOKEN")
                .filter(|v| !v.trim().is_empty())
                .context("DISCORD_TOKEN no está definido")?,
            dev_guilds: parse_guild_list(&var("DEV_GUILDS", ""))?,

            idle_disconnect_minutes: var("IDLE_DISCONNECT_MINUTES", "5")
                .trim()
                .parse()
                .context("IDLE_DISCONNECT_MINUTES inválido")?,
            default_volume: var("DEFAULT_VOLUME", "100")
                .trim()
                .parse()
                .context("DEFAULT_VOLUME inválido")?,
            max_queue_size: var("MAX_QUEUE_SIZE", "1000")
                .trim()
                .parse()
                .context("MAX_QUEUE_SIZE inválido")?,
            status_refresh_ms: var("STATUS_REFRESH_MS", "1000")
                .trim()
                .parse()
                .context("STATUS_REFRESH_MS inválido")?,

            log_level: var("LOG_LEVEL", "info"),
        })
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0 and 200 percent
    /// - Queue size, refresh interval and idle duration must be > 0
    pub fn validate(&self) -> Result<()> {
        if !(VOLUME_MIN..=VOLUME_MAX).contains(&self.default_volume) {
            anyhow::bail!(
                "Default volume must be between {} and {}, got: {}",
                VOLUME_MIN,
                VOLUME_MAX,
                self.default_volume
            );
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.status_refresh_ms == 0 {
            anyhow::bail!("Status refresh interval must be greater than 0");
        }

        if self.idle_disconnect_minutes == 0 {
            anyhow::bail!("Idle disconnect duration must be greater than 0");
        }

        Ok(())
    }

    /// Parámetros que recibe cada reproductor al crearse
    pub fn player_settings(&self) -> PlayerSettings {
        PlayerSettings {
            idle_timeout: Duration::from_secs(self.idle_disconnect_minutes * 60),
            default_volume: self.default_volume,
            max_queue_size: self.max_queue_size,
            status_interval: Duration::from_millis(self.status_refresh_ms),
        }
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// The token is never included.
    pub fn summary(&self) -> String {
        let guilds = if self.dev_guilds.is_empty() {
            "global".to_string()
        } else {
            self.dev_guilds
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };

        format!(
            "Config Summary:\n  \
            Discord: comandos en {}\n  \
            Audio: {}% vol, cola máx {}\n  \
            Timers: desconexión tras {}, panel cada {}\n  \
            Log: {}",
            guilds,
            self.default_volume,
            self.max_queue_size,
            humantime::format_duration(Duration::from_secs(self.idle_disconnect_minutes * 60)),
            humantime::format_duration(Duration::from_millis(self.status_refresh_ms)),
            self.log_level
        )
    }
}

fn parse_guild_list(raw: &str) -> Result<Vec<u64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .with_context(|| format!("ID de guild inválido en DEV_GUILDS: {}", s))
        })
        .collect()
}
