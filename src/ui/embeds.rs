use async_trait::async_trait;
use dashmap::DashMap;
use serenity::{
    all::{ChannelId, GuildId, MessageId, ReactionType, Timestamp},
    builder::{CreateEmbed, CreateEmbedFooter, CreateMessage, EditMessage},
    http::Http,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use super::controls::PanelControl;
use crate::{
    audio::{debounce::StatusRenderer, queue::LoopMode, PlayerState, StatusSnapshot},
    sources::TrackDescriptor,
};

/// Bloques de la barra de progreso
pub const PROGRESS_BAR_BLOCKS: usize = 16;

/// Paleta de colores estandarizada para el bot
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const WARNING_ORANGE: Colour = Colour::from_rgb(255, 193, 7);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

/// Footer estandarizado para todos los embeds
const STANDARD_FOOTER: &str = "🎵 Utila Music";

/// `mm:ss`, o `h:mm:ss` a partir de una hora
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

fn format_optional(duration: Option<Duration>) -> String {
    duration.map(format_duration).unwrap_or_else(|| "??:??".to_string())
}

/// Barra de progreso de [`PROGRESS_BAR_BLOCKS`] bloques
pub fn progress_bar(position: Duration, duration: Option<Duration>) -> String {
    let filled = match duration {
        Some(total) if !total.is_zero() => {
            let ratio = position.as_secs_f64() / total.as_secs_f64();
            ((ratio * PROGRESS_BAR_BLOCKS as f64) as usize).clamp(1, PROGRESS_BAR_BLOCKS)
        }
        // Duración desconocida (streams en vivo)
        _ => 2,
    };

    "▇".repeat(filled) + &"▁".repeat(PROGRESS_BAR_BLOCKS - filled)
}

fn loop_label(mode: LoopMode) -> &'static str {
    match mode {
        LoopMode::Off => "▶️ Off",
        LoopMode::Track => "🔂 Track",
        LoopMode::Queue => "🔁 Cola",
    }
}

/// Panel de estado de una guild
pub fn build_now_playing_embed(snapshot: &StatusSnapshot) -> CreateEmbed {
    let Some(track) = &snapshot.current else {
        let mut embed = CreateEmbed::default()
            .title("😴 Nada sonando")
            .description("💡 Usa `/play <canción>` para agregar música")
            .color(colors::NEUTRAL_GRAY)
            .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
            .timestamp(Timestamp::now());
        if let Some(error) = &snapshot.last_error {
            embed = embed.field("⚠️ Último error", error, false);
        }
        return embed;
    };

    let (title_prefix, color) = match snapshot.state {
        PlayerState::Paused => ("⏸️ En pausa", colors::WARNING_ORANGE),
        _ => ("🎵 Reproduciendo Ahora", colors::MUSIC_PURPLE),
    };

    let description = [
        format!("**Subido por:** {}", track.uploader().unwrap_or("Desconocido")),
        format!("**Duración:** {}", format_optional(track.duration())),
        format!("**Solicitado por:** <@{}>", track.requested_by()),
        format!("**Loop:** {}", loop_label(snapshot.loop_mode)),
        format!("**Volumen:** {}%", snapshot.volume),
        format!("**Cola:** {}", snapshot.pending),
        String::new(),
        format!(
            "{}  `{} / {}`",
            progress_bar(snapshot.position, track.duration()),
            format_duration(snapshot.position),
            format_optional(track.duration())
        ),
    ]
    .join("\n");

    let mut embed = CreateEmbed::default()
        .title(format!("{} — {}", title_prefix, track.title()))
        .description(description)
        .color(color);

    if track.source_ref().starts_with("http") {
        embed = embed.url(track.source_ref());
    }
    if let Some(thumbnail) = track.thumbnail() {
        embed = embed.thumbnail(thumbnail);
    }
    if !snapshot.up_next.is_empty() {
        embed = embed.field("Próximas canciones", up_next_lines(&snapshot.up_next, 0), false);
    }
    if let Some(error) = &snapshot.last_error {
        embed = embed.field("⚠️ Último error", error, false);
    }

    embed
        .footer(CreateEmbedFooter::new(format!(
            "{} • {}",
            STANDARD_FOOTER,
            track.source_name()
        )))
        .timestamp(Timestamp::now())
}

/// Líneas numeradas (1-based) de la cola
fn up_next_lines(tracks: &[TrackDescriptor], offset: usize) -> String {
    tracks
        .iter()
        .enumerate()
        .map(|(i, track)| {
            let duration = track
                .duration()
                .map(|d| format!(" `[{}]`", format_duration(d)))
                .unwrap_or_default();
            format!("**{}**. {}{}", offset + i + 1, track.title(), duration)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Crea un embed para mostrar la cola de reproducción
pub fn create_queue_embed(
    current: Option<&TrackDescriptor>,
    pending: &[TrackDescriptor],
    loop_mode: LoopMode,
) -> CreateEmbed {
    const ITEMS_SHOWN: usize = 10;

    let mut embed = CreateEmbed::default()
        .title("📋 Cola de Reproducción")
        .color(colors::INFO_BLUE);

    if current.is_none() && pending.is_empty() {
        return embed
            .description("😴 **La cola está vacía**\n\n💡 Usa `/play <canción>` para agregar música")
            .color(colors::NEUTRAL_GRAY)
            .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
            .timestamp(Timestamp::now());
    }

    if let Some(current) = current {
        embed = embed.field(
            format!("{} Reproduciendo", loop_label(loop_mode)),
            format!("**{}**", current.title()),
            false,
        );
    }

    if !pending.is_empty() {
        let shown = &pending[..pending.len().min(ITEMS_SHOWN)];
        let mut lines = up_next_lines(shown, 0);
        if pending.len() > ITEMS_SHOWN {
            lines.push_str(&format!("\n… y {} más", pending.len() - ITEMS_SHOWN));
        }
        embed = embed.field("Próximas canciones", lines, false);
    }

    let total: Duration = pending.iter().filter_map(|t| t.duration()).sum();
    let mut info = format!("**Total:** {} canciones", pending.len());
    if total > Duration::ZERO {
        info.push_str(&format!(" • **Duración:** {}", format_duration(total)));
    }

    embed
        .field("Información", info, false)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
        .timestamp(Timestamp::now())
}

/// Crea un embed para mostrar que se agregó una canción
pub fn create_track_added_embed(track: &TrackDescriptor, position: usize) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("✅ Canción agregada")
        .description(format!("**{}** en la posición {}", track.title(), position))
        .color(colors::SUCCESS_GREEN)
        .field("⏱️ Duración", format_optional(track.duration()), true)
        .field("👤 Solicitado por", format!("<@{}>", track.requested_by()), true);

    if let Some(thumbnail) = track.thumbnail() {
        embed = embed.thumbnail(thumbnail);
    }

    embed
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
        .timestamp(Timestamp::now())
}

/// Crea un embed de error
pub fn create_error_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("❌ {}", title))
        .description(description)
        .color(colors::ERROR_RED)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea un embed de éxito
pub fn create_success_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("✅ {}", title))
        .description(description)
        .color(colors::SUCCESS_GREEN)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Publica el panel de cada guild en su canal de anuncios.
///
/// The first render posts a message; later renders edit it. If the message was deleted
/// the edit fails and a new one is posted.
pub struct EmbedRenderer {
    http: Arc<Http>,
    channels: DashMap<GuildId, ChannelId>,
    messages: DashMap<GuildId, (ChannelId, MessageId)>,
}

impl EmbedRenderer {
    pub fn new(http: Arc<Http>) -> Self {
        Self {
            http,
            channels: DashMap::new(),
            messages: DashMap::new(),
        }
    }

    /// Canal donde se publica el panel de la guild
    pub fn set_announce_channel(&self, guild_id: GuildId, channel_id: ChannelId) {
        self.channels.insert(guild_id, channel_id);
    }

    /// Si `message_id` es el panel vigente de la guild
    pub fn is_panel(&self, guild_id: GuildId, message_id: MessageId) -> bool {
        self.messages
            .get(&guild_id)
            .is_some_and(|entry| entry.1 == message_id)
    }

    async fn post(&self, guild_id: GuildId, channel_id: ChannelId, embed: CreateEmbed) -> anyhow::Result<()> {
        let message = channel_id
            .send_message(self.http.as_ref(), CreateMessage::new().embed(embed))
            .await?;
        self.messages.insert(guild_id, (channel_id, message.id));
        debug!("📌 Panel publicado en guild {}", guild_id);

        for control in PanelControl::ALL {
            let reaction = ReactionType::Unicode(control.emoji().to_string());
            if let Err(e) = self.http.create_reaction(channel_id, message.id, &reaction).await {
                // Sin permiso de reacciones el panel sigue funcionando
                debug!("No se pudo agregar {} al panel de guild {}: {}", control.emoji(), guild_id, e);
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StatusRenderer for EmbedRenderer {
    async fn render(&self, guild_id: GuildId, snapshot: StatusSnapshot) -> anyhow::Result<()> {
        if snapshot.state == PlayerState::Disconnecting {
            // El panel queda con el último estado; la próxima sesión publica uno nuevo
            self.messages.remove(&guild_id);
            info!("📌 Panel de guild {} cerrado", guild_id);
            return Ok(());
        }

        let Some(channel_id) = self.channels.get(&guild_id).map(|c| *c) else {
            debug!("Guild {} sin canal de anuncios, panel omitido", guild_id);
            return Ok(());
        };

        let embed = build_now_playing_embed(&snapshot);
        let existing = self.messages.get(&guild_id).map(|m| *m);

        match existing {
            Some((message_channel, message_id)) if message_channel == channel_id => {
                let edited = channel_id
                    .edit_message(self.http.as_ref(), message_id, EditMessage::new().embed(embed.clone()))
                    .await;
                if let Err(e) = edited {
                    warn!("⚠️ No se pudo editar el panel de guild {}: {}; publicando uno nuevo", guild_id, e);
                    self.post(guild_id, channel_id, embed).await?;
                }
                Ok(())
            }
            _ => self.post(guild_id, channel_id, embed).await,
        }
    }
}
