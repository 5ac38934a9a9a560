use anyhow::Result;
use serenity::{http::Http, model::gateway::GatewayIntents, Client};
use songbird::SerenityInit;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use utila_music::{
    audio::{ffmpeg::FfmpegLauncher, PlayerRegistry, StatusDebouncer},
    bot::UtilaMusicBot,
    config::Config,
    sources::YtDlpResolver,
    ui::EmbedRenderer,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Inicializar logging (RUST_LOG tiene prioridad sobre LOG_LEVEL)
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&log_level))
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Utila Music v{}", env!("CARGO_PKG_VERSION"));

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check().await;
    }

    // Cargar configuración
    let config = Arc::new(Config::load()?);
    info!("{}", config.summary());

    let resolver = Arc::new(YtDlpResolver::new());
    if let Err(e) = resolver.verify_dependencies().await {
        error!("❌ {:?}", e);
    }

    let settings = config.player_settings();
    let http = Arc::new(Http::new(&config.discord_token));
    let renderer = Arc::new(EmbedRenderer::new(http));
    let debouncer = Arc::new(StatusDebouncer::new(settings.status_interval, renderer.clone()));
    let registry = Arc::new(PlayerRegistry::new(
        settings,
        resolver.clone(),
        Arc::new(FfmpegLauncher::new()),
        debouncer,
    ));

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGE_REACTIONS;

    // Crear handler del bot
    let handler = UtilaMusicBot::new(config.clone(), registry.clone(), renderer, resolver);

    // Construir cliente
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird()
        .await?;

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        registry.shutdown().await;
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    info!("👋 Utila Music detenido");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Error al registrar SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C recibido"),
        _ = terminate => info!("SIGTERM recibido"),
    }
}

async fn health_check() -> Result<()> {
    // Verificar dependencias críticas
    YtDlpResolver::new().verify_dependencies().await?;
    println!("OK");
    Ok(())
}
