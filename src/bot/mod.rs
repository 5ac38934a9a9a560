//! # Bot Module
//!
//! Discord adapter for Utila Music: registers the slash commands and turns interactions
//! and voice state changes into calls on the [`PlayerRegistry`].
//!
//! The bot holds no playback state of its own. Everything per guild lives in the guild's
//! player, reached through the registry. Reactions on the now-playing panel are mapped to
//! the same player operations as the slash commands.

use anyhow::Result;
use serenity::{
    all::{
        ChannelId, Context, EventHandler, Guild, GuildId, Interaction, Reaction, ReactionType,
        Ready, UnavailableGuild, VoiceState,
    },
    async_trait,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod handlers;

use crate::{
    audio::{
        voice::{Departures, SongbirdSink, VoiceSink},
        GuildPlayerHandle, PlayerRegistry,
    },
    config::Config,
    sources::TrackResolver,
    ui::{embeds::EmbedRenderer, PanelControl},
};

/// Main Discord event handler.
pub struct UtilaMusicBot {
    /// Bot configuration loaded from environment variables
    config: Arc<Config>,
    /// Per-guild players
    pub registry: Arc<PlayerRegistry>,
    /// Now-playing panels
    pub renderer: Arc<EmbedRenderer>,
    pub resolver: Arc<dyn TrackResolver>,
    /// Salidas de voz iniciadas por el propio bot
    departures: Departures,
}

impl UtilaMusicBot {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<PlayerRegistry>,
        renderer: Arc<EmbedRenderer>,
        resolver: Arc<dyn TrackResolver>,
    ) -> Self {
        Self {
            config,
            registry,
            renderer,
            resolver,
            departures: Departures::default(),
        }
    }

    /// Registers slash commands with Discord.
    ///
    /// Per dev guild when `DEV_GUILDS` is set (fast propagation), globally otherwise.
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");

        if self.config.dev_guilds.is_empty() {
            info!("🌐 Registrando comandos globalmente");
            commands::register_global_commands(ctx).await.map_err(|e| {
                error!("❌ Error registrando comandos globales: {:?}", e);
                anyhow::anyhow!("No se pudieron registrar comandos globales. Verifica que el bot tenga permisos de 'applications.commands'.")
            })?;
            info!("✅ Comandos globales registrados");
            return Ok(());
        }

        for guild_id in self.config.dev_guilds.iter().copied().map(GuildId::new) {
            match commands::register_guild_commands(ctx, guild_id).await {
                Ok(()) => info!("✅ Comandos de guild registrados para: {}", guild_id),
                Err(e) => error!("❌ Error registrando comandos de guild {}: {:?}", guild_id, e),
            }
        }

        Ok(())
    }

    /// Reproductor de la guild; si no existe, entra al canal de voz y lo crea
    pub async fn player_for(
        &self,
        ctx: &Context,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<GuildPlayerHandle> {
        if let Some(player) = self.registry.get(guild_id) {
            return Ok(player);
        }

        let manager = songbird::get(ctx)
            .await
            .ok_or_else(|| anyhow::anyhow!("Songbird no inicializado"))?;

        let call = manager.join(guild_id, channel_id).await.map_err(|e| {
            error!("Error al obtener handler de voz: {:?}", e);
            anyhow::anyhow!("Error al conectar al canal de voz")
        })?;
        info!("🔊 Conectado al canal de voz en guild {}", guild_id);

        let sink: Arc<dyn VoiceSink> = Arc::new(SongbirdSink::new(
            guild_id,
            manager,
            call,
            self.departures.clone(),
        ));
        Ok(self.registry.get_or_create(guild_id, || sink))
    }
}

#[async_trait]
impl EventHandler for UtilaMusicBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command_interaction) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command_interaction, self).await {
                error!("Error manejando comando: {:?}", e);
            }
        }
    }

    /// Si alguien saca al bot del canal de voz, el reproductor de la guild se cierra.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id {
            return;
        }

        let (Some(guild_id), true) = (new.guild_id, old.is_some() && new.channel_id.is_none()) else {
            return;
        };

        // Eco de nuestra propia desconexión: el reproductor ya se está cerrando
        if self.departures.take(guild_id) {
            debug!("Salida de voz propia confirmada en guild {}", guild_id);
            return;
        }

        if self.registry.remove(guild_id).await {
            warn!("🔌 Bot desconectado externamente en guild {}", guild_id);
        }
    }

    /// El bot fue expulsado de la guild (o esta se borró)
    async fn guild_delete(&self, _ctx: Context, incomplete: UnavailableGuild, _full: Option<Guild>) {
        if incomplete.unavailable {
            // Caída de Discord, no una salida real
            return;
        }

        if self.registry.remove(incomplete.id).await {
            info!("🧹 Estado de guild {} eliminado al salir del servidor", incomplete.id);
        }
    }

    /// Controles del panel: ⏯ ⏭ ⏹ 🔁 🔀 🔉 🔊 ⏮
    async fn reaction_add(&self, ctx: Context, reaction: Reaction) {
        let (Some(guild_id), Some(user_id)) = (reaction.guild_id, reaction.user_id) else {
            return;
        };
        if user_id == ctx.cache.current_user().id
            || reaction.member.as_ref().is_some_and(|member| member.user.bot)
            || !self.renderer.is_panel(guild_id, reaction.message_id)
        {
            return;
        }

        let ReactionType::Unicode(emoji) = &reaction.emoji else {
            return;
        };
        let Some(control) = PanelControl::from_emoji(emoji) else {
            return;
        };

        let (bot_channel, user_channel) = handlers::voice_channels(&ctx, guild_id, user_id);
        if bot_channel.is_none() || handlers::check_same_channel(bot_channel, user_channel).is_err() {
            debug!("Control {} ignorado: usuario {} fuera del canal del bot", emoji, user_id);
            return;
        }

        if let Some(player) = self.registry.get(guild_id) {
            match control.apply(&player).await {
                Ok(effect) => info!("🎛️ Control {} en guild {}: {:?}", control.emoji(), guild_id, effect),
                Err(e) => debug!("Control {} rechazado en guild {}: {}", control.emoji(), guild_id, e),
            }
        }

        // Deja el panel limpio para el siguiente uso
        if let Err(e) = reaction.delete(&ctx).await {
            debug!("No se pudo quitar la reacción en guild {}: {}", guild_id, e);
        }
    }
}
