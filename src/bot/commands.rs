use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{application::CommandOptionType, id::GuildId},
    prelude::Context,
};

use crate::audio::queue::VOLUME_MAX;

/// Todos los comandos slash del bot
pub fn all_commands() -> Vec<CreateCommand> {
    vec![
        play_command(),
        pause_command(),
        resume_command(),
        skip_command(),
        stop_command(),
        queue_command(),
        nowplaying_command(),
        volume_command(),
        clear_command(),
        shuffle_command(),
        remove_command(),
        move_command(),
        seek_command(),
        loop_command(),
        remove_dupes_command(),
        jump_command(),
    ]
}

/// Registra comandos globales
pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    for command in all_commands() {
        ctx.http.create_global_command(&command).await?;
    }

    Ok(())
}

/// Registra comandos para una guild específica (desarrollo)
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id.set_commands(&ctx.http, all_commands()).await?;

    Ok(())
}

fn index_option(name: &str, description: &str) -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::Integer, name, description)
        .min_int_value(1)
        .required(true)
}

// Comandos de reproducción

fn play_command() -> CreateCommand {
    CreateCommand::new("play")
        .description("Reproduce una canción o la agrega a la cola")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "query",
                "URL o término de búsqueda",
            )
            .required(true),
        )
}

// Comandos de control

fn pause_command() -> CreateCommand {
    CreateCommand::new("pause").description("Pausa la reproducción actual")
}

fn resume_command() -> CreateCommand {
    CreateCommand::new("resume").description("Reanuda la reproducción pausada")
}

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip").description("Salta a la siguiente canción")
}

fn stop_command() -> CreateCommand {
    CreateCommand::new("stop").description("Detiene la reproducción y limpia la cola")
}

fn seek_command() -> CreateCommand {
    CreateCommand::new("seek")
        .description("Salta a una posición de la canción actual")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "timestamp",
                "Posición en mm:ss o h:mm:ss",
            )
            .required(true),
        )
}

fn volume_command() -> CreateCommand {
    CreateCommand::new("volume")
        .description("Ajusta el volumen de reproducción")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::Integer,
                "level",
                "Nivel de volumen (0-200)",
            )
            .min_int_value(0)
            .max_int_value(u64::from(VOLUME_MAX))
            .required(true),
        )
}

fn loop_command() -> CreateCommand {
    CreateCommand::new("loop")
        .description("Configura el modo de repetición")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "mode", "Modo de repetición")
                .add_string_choice("Desactivar", "off")
                .add_string_choice("Canción", "track")
                .add_string_choice("Cola", "queue")
                .required(true),
        )
}

// Comandos de cola

fn queue_command() -> CreateCommand {
    CreateCommand::new("queue").description("Muestra la cola de reproducción")
}

fn nowplaying_command() -> CreateCommand {
    CreateCommand::new("np").description("Muestra información de la canción actual")
}

fn clear_command() -> CreateCommand {
    CreateCommand::new("clear").description("Limpia la cola (la canción actual sigue)")
}

fn shuffle_command() -> CreateCommand {
    CreateCommand::new("shuffle").description("Mezcla la cola de reproducción")
}

fn remove_command() -> CreateCommand {
    CreateCommand::new("remove")
        .description("Elimina una canción de la cola")
        .add_option(index_option("index", "Posición en la cola (desde 1)"))
}

fn move_command() -> CreateCommand {
    CreateCommand::new("move")
        .description("Mueve una canción a otra posición de la cola")
        .add_option(index_option("from", "Posición actual (desde 1)"))
        .add_option(index_option("to", "Nueva posición (desde 1)"))
}

fn remove_dupes_command() -> CreateCommand {
    CreateCommand::new("remove_dupes").description("Elimina canciones repetidas de la cola")
}

fn jump_command() -> CreateCommand {
    CreateCommand::new("jump")
        .description("Salta a una canción de la cola y la reproduce")
        .add_option(index_option("index", "Posición en la cola (desde 1)"))
}
