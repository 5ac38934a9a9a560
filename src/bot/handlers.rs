use anyhow::Result;
use serenity::{
    builder::{
        CreateEmbed, CreateInteractionResponse, CreateInteractionResponseMessage,
        EditInteractionResponse,
    },
    model::{
        application::CommandInteraction,
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use std::time::Duration;
use tracing::{info, warn};

use crate::{
    audio::{GuildPlayerHandle, LoopMode, PlayOutcome},
    bot::UtilaMusicBot,
    error::{InvalidOperation, PlayerError},
    ui::embeds,
};

/// Maneja comandos slash
pub async fn handle_command(
    ctx: &Context,
    command: CommandInteraction,
    bot: &UtilaMusicBot,
) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    // Solo lectura: cualquiera puede ver la cola
    if !matches!(command.data.name.as_str(), "queue" | "np") {
        let (bot_channel, user_channel) = voice_channels(ctx, guild_id, command.user.id);
        if let Err(reason) = check_same_channel(bot_channel, user_channel) {
            return respond_text(ctx, &command, &format!("❌ {}", reason), true).await;
        }
    }

    if command.data.name == "play" {
        return handle_play(ctx, &command, bot, guild_id).await;
    }

    let Some(player) = bot.registry.get(guild_id) else {
        return respond_error(ctx, &command, &InvalidOperation::NothingPlaying.into()).await;
    };

    let result = match command.data.name.as_str() {
        "pause" => player.pause().await.map(|_| "⏸️ Reproducción pausada".to_string()),
        "resume" => player.resume().await.map(|_| "▶️ Reproducción reanudada".to_string()),
        "skip" => player.skip().await.map(|next| match next {
            Some(track) => format!("⏭️ Saltada. Ahora suena **{}**", track.title()),
            None => "⏭️ Saltada. La cola terminó".to_string(),
        }),
        "stop" => player
            .stop()
            .await
            .map(|_| "⏹️ Reproducción detenida y cola limpiada".to_string()),
        "queue" => return handle_queue(ctx, &command, &player).await,
        "np" => return handle_nowplaying(ctx, &command, &player).await,
        "volume" => match option_int(&command, "level").and_then(|v| u16::try_from(v).ok()) {
            Some(level) => player
                .set_volume(level)
                .await
                .map(|_| format!("🔊 Volumen ajustado a {}%", level)),
            None => return respond_text(ctx, &command, "❌ Volumen inválido", true).await,
        },
        "clear" => player
            .clear()
            .await
            .map(|removed| format!("🗑️ {} canciones eliminadas de la cola", removed)),
        "shuffle" => player.shuffle().await.map(|_| "🔀 Cola mezclada".to_string()),
        "remove" => match option_index(&command, "index") {
            Some(index) => player
                .remove_at(index)
                .await
                .map(|track| format!("❌ Eliminada **{}**", track.title())),
            None => return respond_text(ctx, &command, "❌ Índice inválido", true).await,
        },
        "move" => match (option_index(&command, "from"), option_index(&command, "to")) {
            (Some(from), Some(to)) => player
                .move_to(from, to)
                .await
                .map(|_| format!("📍 Canción movida de {} a {}", from + 1, to + 1)),
            _ => return respond_text(ctx, &command, "❌ Índice inválido", true).await,
        },
        "seek" => match option_str(&command, "timestamp").and_then(parse_timestamp) {
            Some(offset) => player
                .seek(offset)
                .await
                .map(|_| format!("⏩ Posición: {}", embeds::format_duration(offset))),
            None => {
                return respond_text(ctx, &command, "❌ Usa el formato mm:ss o h:mm:ss", true).await
            }
        },
        "loop" => match option_str(&command, "mode").and_then(|m| m.parse::<LoopMode>().ok()) {
            Some(mode) => player.set_loop_mode(mode).await.map(|_| match mode {
                LoopMode::Track => "🔂 Repetir canción activado".to_string(),
                LoopMode::Queue => "🔁 Repetir cola activado".to_string(),
                LoopMode::Off => "➡️ Repetición desactivada".to_string(),
            }),
            None => return respond_text(ctx, &command, "❌ Modo inválido", true).await,
        },
        "remove_dupes" => player
            .remove_duplicates()
            .await
            .map(|removed| format!("🧹 {} duplicados eliminados", removed)),
        "jump" => match option_index(&command, "index") {
            Some(index) => player
                .jump(index)
                .await
                .map(|track| format!("⏭️ Saltando a **{}**", track.title())),
            None => return respond_text(ctx, &command, "❌ Índice inválido", true).await,
        },
        _ => return respond_text(ctx, &command, "❌ Comando no reconocido", true).await,
    };

    match result {
        Ok(message) => respond_text(ctx, &command, &message, false).await,
        Err(e) => respond_error(ctx, &command, &e).await,
    }
}

async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &UtilaMusicBot,
    guild_id: GuildId,
) -> Result<()> {
    let query = option_str(command, "query")
        .ok_or_else(|| anyhow::anyhow!("Query no proporcionado"))?
        .to_string();

    // Defer la respuesta ya que puede tomar tiempo
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let voice_channel_id = match get_user_voice_channel(ctx, guild_id, command.user.id) {
        Ok(channel_id) => channel_id,
        Err(e) => return edit_with_embed(ctx, command, embeds::create_error_embed("Sin canal de voz", &e.to_string())).await,
    };

    let track = match bot.resolver.resolve(&query, command.user.id).await {
        Ok(track) => track,
        Err(e) => {
            warn!("❌ No se pudo resolver '{}': {}", query, e);
            return edit_with_embed(ctx, command, embeds::create_error_embed("Sin resultados", &e.to_string())).await;
        }
    };

    bot.renderer.set_announce_channel(guild_id, command.channel_id);

    // Un reintento: el reproductor pudo cerrarse por inactividad entre la búsqueda y el envío
    let mut outcome = Err(PlayerError::Closed);
    for _ in 0..2 {
        let player = bot.player_for(ctx, guild_id, voice_channel_id).await?;
        outcome = player.play(track.clone()).await;
        match &outcome {
            Err(e) if !e.is_recoverable() => continue,
            _ => break,
        }
    }

    let embed = match outcome {
        Ok(PlayOutcome::Started) => embeds::create_success_embed(
            "Reproduciendo",
            &format!("🎵 **{}**", track.title()),
        ),
        Ok(PlayOutcome::Enqueued { position }) => embeds::create_track_added_embed(&track, position + 1),
        Err(e) => embeds::create_error_embed("No se pudo reproducir", &e.to_string()),
    };

    edit_with_embed(ctx, command, embed).await
}

async fn handle_queue(
    ctx: &Context,
    command: &CommandInteraction,
    player: &GuildPlayerHandle,
) -> Result<()> {
    let snapshot = match player.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(e) => return respond_error(ctx, command, &e).await,
    };
    let pending = match player.list_queue().await {
        Ok(pending) => pending,
        Err(e) => return respond_error(ctx, command, &e).await,
    };

    let embed = embeds::create_queue_embed(snapshot.current.as_ref(), &pending, snapshot.loop_mode);
    respond_embed(ctx, command, embed).await
}

async fn handle_nowplaying(
    ctx: &Context,
    command: &CommandInteraction,
    player: &GuildPlayerHandle,
) -> Result<()> {
    match player.snapshot().await {
        Ok(snapshot) if snapshot.current.is_some() => {
            respond_embed(ctx, command, embeds::build_now_playing_embed(&snapshot)).await
        }
        Ok(_) => respond_text(ctx, command, "❌ No hay nada reproduciéndose actualmente", true).await,
        Err(e) => respond_error(ctx, command, &e).await,
    }
}

/// Parsea `mm:ss` o `h:mm:ss`
pub fn parse_timestamp(raw: &str) -> Option<Duration> {
    let parts = raw
        .trim()
        .split(':')
        .map(|p| p.parse::<u64>().ok())
        .collect::<Option<Vec<u64>>>()?;

    let seconds = match parts.as_slice() {
        [m, s] if *s < 60 => m.checked_mul(60)?.checked_add(*s)?,
        [h, m, s] if *m < 60 && *s < 60 => h.checked_mul(3600)?.checked_add(m * 60 + s)?,
        _ => return None,
    };
    Some(Duration::from_secs(seconds))
}

/// Índice 1-based del usuario a 0-based
pub fn to_queue_index(value: i64) -> Option<usize> {
    usize::try_from(value).ok()?.checked_sub(1)
}

fn option_str<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_str())
}

fn option_int(command: &CommandInteraction, name: &str) -> Option<i64> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_i64())
}

fn option_index(command: &CommandInteraction, name: &str) -> Option<usize> {
    option_int(command, name).and_then(to_queue_index)
}

async fn respond_text(
    ctx: &Context,
    command: &CommandInteraction,
    content: &str,
    ephemeral: bool,
) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(ephemeral),
            ),
        )
        .await?;
    Ok(())
}

async fn respond_embed(ctx: &Context, command: &CommandInteraction, embed: CreateEmbed) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().embed(embed)),
        )
        .await?;
    Ok(())
}

async fn respond_error(ctx: &Context, command: &CommandInteraction, error: &PlayerError) -> Result<()> {
    respond_text(ctx, command, &format!("❌ {}", capitalize(&error.to_string())), true).await
}

async fn edit_with_embed(ctx: &Context, command: &CommandInteraction, embed: CreateEmbed) -> Result<()> {
    command
        .edit_response(&ctx.http, EditInteractionResponse::new().embed(embed))
        .await?;
    Ok(())
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Quien controla la reproducción debe estar en el canal de voz del bot, si el bot está en uno
pub fn check_same_channel(
    bot_channel: Option<ChannelId>,
    user_channel: Option<ChannelId>,
) -> Result<(), &'static str> {
    match (bot_channel, user_channel) {
        (None, _) => Ok(()),
        (Some(_), None) => Err("Debes unirte a mi canal de voz para controlar la reproducción"),
        (Some(bot), Some(user)) if bot == user => Ok(()),
        (Some(_), Some(_)) => Err("Debes estar en el mismo canal de voz que el bot"),
    }
}

/// Canales de voz (del bot, del usuario) según la caché
pub fn voice_channels(ctx: &Context, guild_id: GuildId, user_id: UserId) -> (Option<ChannelId>, Option<ChannelId>) {
    let bot_id = ctx.cache.current_user().id;
    let Some(guild) = guild_id.to_guild_cached(&ctx.cache) else {
        return (None, None);
    };
    let channel_of = |id: UserId| guild.voice_states.get(&id).and_then(|state| state.channel_id);
    (channel_of(bot_id), channel_of(user_id))
}

fn get_user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Result<ChannelId> {
    let guild = guild_id
        .to_guild_cached(&ctx.cache)
        .ok_or_else(|| anyhow::anyhow!("Guild no encontrada en caché"))?;

    let channel_id = guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
        .ok_or_else(|| anyhow::anyhow!("Debes estar en un canal de voz"))?;

    Ok(channel_id)
}
