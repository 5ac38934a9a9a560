use serenity::model::id::GuildId;
use std::{fmt, time::Duration};

use super::queue::LoopMode;
use crate::sources::TrackDescriptor;

/// Canciones de la cola incluidas en el panel
pub const UP_NEXT_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    /// Sin pipeline ni track actual
    Idle,
    Playing,
    /// Pipeline detenido, track actual retenido
    Paused,
    /// Transitorio: stop/skip explícito en curso
    Stopping,
    /// Transitorio: expiró el timer de inactividad
    Disconnecting,
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlayerState::Idle => "idle",
            PlayerState::Playing => "playing",
            PlayerState::Paused => "paused",
            PlayerState::Stopping => "stopping",
            PlayerState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Foto del estado de una guild para el panel de estado
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub guild_id: GuildId,
    pub state: PlayerState,
    pub current: Option<TrackDescriptor>,
    pub position: Duration,
    pub volume: u16,
    pub loop_mode: LoopMode,
    pub pending: usize,
    pub up_next: Vec<TrackDescriptor>,
    pub remaining: Duration,
    pub last_error: Option<String>,
}

impl StatusSnapshot {
    pub fn idle(guild_id: GuildId, volume: u16) -> Self {
        Self {
            guild_id,
            state: PlayerState::Idle,
            current: None,
            position: Duration::ZERO,
            volume,
            loop_mode: LoopMode::Off,
            pending: 0,
            up_next: Vec::new(),
            remaining: Duration::ZERO,
            last_error: None,
        }
    }
}
