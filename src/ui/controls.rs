//! Reaction controls on the now-playing panel.
//!
//! The panel gets one reaction per control when it is posted; a user reacting with one of
//! them (from the bot's voice channel) triggers the matching player operation.

use crate::{
    audio::{GuildPlayerHandle, LoopMode, PlayerState},
    error::PlayerResult,
};

/// Paso de volumen de los botones 🔉 / 🔊
pub const VOLUME_STEP: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelControl {
    TogglePause,
    Skip,
    Stop,
    CycleLoop,
    Shuffle,
    VolumeDown,
    VolumeUp,
    Replay,
}

/// Resultado visible de un control, para el log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEffect {
    State(PlayerState),
    Loop(LoopMode),
    Volume(u16),
    Done,
}

impl PanelControl {
    /// En el orden en que se agregan al panel
    pub const ALL: [PanelControl; 8] = [
        PanelControl::TogglePause,
        PanelControl::Skip,
        PanelControl::Stop,
        PanelControl::CycleLoop,
        PanelControl::Shuffle,
        PanelControl::VolumeDown,
        PanelControl::VolumeUp,
        PanelControl::Replay,
    ];

    pub fn emoji(self) -> &'static str {
        match self {
            PanelControl::TogglePause => "⏯",
            PanelControl::Skip => "⏭",
            PanelControl::Stop => "⏹",
            PanelControl::CycleLoop => "🔁",
            PanelControl::Shuffle => "🔀",
            PanelControl::VolumeDown => "🔉",
            PanelControl::VolumeUp => "🔊",
            PanelControl::Replay => "⏮",
        }
    }

    /// Discord may append a variation selector (U+FE0F) to the emoji it reports back.
    pub fn from_emoji(emoji: &str) -> Option<Self> {
        let emoji = emoji.trim_end_matches('\u{fe0f}');
        Self::ALL.into_iter().find(|control| control.emoji() == emoji)
    }

    pub async fn apply(self, player: &GuildPlayerHandle) -> PlayerResult<ControlEffect> {
        match self {
            PanelControl::TogglePause => player.toggle_pause().await.map(ControlEffect::State),
            PanelControl::Skip => player.skip().await.map(|_| ControlEffect::Done),
            PanelControl::Stop => player.stop().await.map(|_| ControlEffect::Done),
            PanelControl::CycleLoop => player.cycle_loop_mode().await.map(ControlEffect::Loop),
            PanelControl::Shuffle => player.shuffle().await.map(|_| ControlEffect::Done),
            PanelControl::VolumeDown => player
                .adjust_volume(-VOLUME_STEP)
                .await
                .map(ControlEffect::Volume),
            PanelControl::VolumeUp => player
                .adjust_volume(VOLUME_STEP)
                .await
                .map(ControlEffect::Volume),
            PanelControl::Replay => player
                .seek(std::time::Duration::ZERO)
                .await
                .map(|_| ControlEffect::Done),
        }
    }
}
