use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use serenity::model::id::GuildId;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::{debug, info};

use super::{
    debounce::StatusDebouncer,
    pipeline::EncoderLauncher,
    player::{GuildPlayer, GuildPlayerHandle, PlayerDeps, PlayerSettings},
    voice::VoiceSink,
};
use crate::{error::PlayerError, sources::TrackResolver};

/// Tabla de reproductores por guild.
///
/// Creation is atomic per guild: the dashmap entry lock is held while a missing (or
/// already torn down) player is replaced, so two racing callers always get the same one.
pub struct PlayerRegistry {
    players: Arc<DashMap<GuildId, GuildPlayerHandle>>,
    next_id: AtomicU64,
    settings: PlayerSettings,
    resolver: Arc<dyn TrackResolver>,
    launcher: Arc<dyn EncoderLauncher>,
    debouncer: Arc<StatusDebouncer>,
}

impl PlayerRegistry {
    pub fn new(
        settings: PlayerSettings,
        resolver: Arc<dyn TrackResolver>,
        launcher: Arc<dyn EncoderLauncher>,
        debouncer: Arc<StatusDebouncer>,
    ) -> Self {
        Self {
            players: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            settings,
            resolver,
            launcher,
            debouncer,
        }
    }

    /// Devuelve el reproductor de la guild, creándolo si no existe.
    ///
    /// `make_sink` only runs when a new player is built.
    pub fn get_or_create(
        &self,
        guild_id: GuildId,
        make_sink: impl FnOnce() -> Arc<dyn VoiceSink>,
    ) -> GuildPlayerHandle {
        match self.players.entry(guild_id) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    return entry.get().clone();
                }
                debug!("♻️ Reemplazando reproductor cerrado de guild {}", guild_id);
                let handle = self.spawn_player(guild_id, make_sink());
                entry.insert(handle.clone());
                handle
            }
            Entry::Vacant(entry) => {
                let handle = self.spawn_player(guild_id, make_sink());
                entry.insert(handle.clone());
                handle
            }
        }
    }

    fn spawn_player(&self, guild_id: GuildId, sink: Arc<dyn VoiceSink>) -> GuildPlayerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let players = Arc::clone(&self.players);

        // Solo quita la entrada si sigue siendo este reproductor
        let deregister = Box::new(move || {
            players.remove_if(&guild_id, |_, handle| handle.id() == id);
        });

        let deps = PlayerDeps {
            resolver: self.resolver.clone(),
            launcher: self.launcher.clone(),
            sink,
            debouncer: self.debouncer.clone(),
        };

        GuildPlayer::spawn(id, guild_id, self.settings, deps, deregister)
    }

    /// Reproductor vivo de la guild, sin crearlo
    pub fn get(&self, guild_id: GuildId) -> Option<GuildPlayerHandle> {
        self.players
            .get(&guild_id)
            .map(|handle| handle.clone())
            .filter(|handle| !handle.is_closed())
    }

    pub fn contains(&self, guild_id: GuildId) -> bool {
        self.get(guild_id).is_some()
    }

    /// Detiene y elimina el reproductor de la guild. Devuelve si había uno.
    ///
    /// The entry is left in place while the player tears down (it deregisters itself at
    /// the end), so no replacement can be created for the guild in the meantime.
    pub async fn remove(&self, guild_id: GuildId) -> bool {
        let Some(handle) = self.players.get(&guild_id).map(|entry| entry.clone()) else {
            return false;
        };
        self.remove_player(guild_id, &handle).await
    }

    /// Como `remove`, pero solo si el reproductor registrado sigue siendo `handle`
    pub async fn remove_player(&self, guild_id: GuildId, handle: &GuildPlayerHandle) -> bool {
        let id = handle.id();
        let registered = self
            .players
            .get(&guild_id)
            .is_some_and(|entry| entry.id() == id);
        if !registered {
            return false;
        }

        match handle.shutdown().await {
            Ok(()) | Err(PlayerError::Closed) => {}
            Err(e) => debug!("Cierre de guild {} con error: {}", guild_id, e),
        }
        // Por si la tarea ya había muerto sin desregistrarse
        self.players.remove_if(&guild_id, |_, entry| entry.id() == id);
        info!("🗑️ Reproductor de guild {} eliminado del registro", guild_id);
        true
    }

    /// Cierra todos los reproductores registrados
    pub async fn shutdown(&self) {
        let guilds: Vec<GuildId> = self.players.iter().map(|entry| *entry.key()).collect();
        info!("🛑 Cerrando {} reproductores", guilds.len());

        join_all(guilds.into_iter().map(|guild_id| self.remove(guild_id))).await;
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}
