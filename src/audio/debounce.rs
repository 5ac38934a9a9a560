//! Debounced status rendering.
//!
//! Every attached guild gets one worker task. `mark_dirty` only flips a flag and wakes
//! the worker; the worker waits one interval to coalesce the burst and then renders the
//! latest snapshot. Renders for one guild are awaited in sequence, so they never overlap.
//! Detaching a guild flushes a pending change right away.
//!
//! Slots are keyed by guild and owned by one player id. A player that is still shutting
//! down can neither dirty nor detach the slot of its successor.

use async_trait::async_trait;
use dashmap::DashMap;
use serenity::model::id::GuildId;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::status::StatusSnapshot;

/// Dibuja el panel de estado de una guild.
#[async_trait]
pub trait StatusRenderer: Send + Sync {
    async fn render(&self, guild_id: GuildId, snapshot: StatusSnapshot) -> anyhow::Result<()>;
}

struct Slot {
    owner: u64,
    dirty: AtomicBool,
    notify: Notify,
    cancel: CancellationToken,
}

pub struct StatusDebouncer {
    interval: Duration,
    renderer: Arc<dyn StatusRenderer>,
    slots: DashMap<GuildId, Arc<Slot>>,
}

impl StatusDebouncer {
    pub fn new(interval: Duration, renderer: Arc<dyn StatusRenderer>) -> Self {
        Self {
            interval,
            renderer,
            slots: DashMap::new(),
        }
    }

    /// Registra la fuente de snapshots de una guild y arranca su worker
    pub fn attach(&self, guild_id: GuildId, owner: u64, source: watch::Receiver<StatusSnapshot>) {
        let slot = Arc::new(Slot {
            owner,
            dirty: AtomicBool::new(false),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
        });

        if let Some(previous) = self.slots.insert(guild_id, slot.clone()) {
            previous.cancel.cancel();
        }

        let worker = Worker {
            guild_id,
            interval: self.interval,
            renderer: self.renderer.clone(),
            slot,
            source,
        };
        tokio::spawn(worker.run());
    }

    /// Quita la guild y detiene su worker tras un último render si había cambios
    pub fn detach(&self, guild_id: GuildId, owner: u64) {
        if let Some((_, slot)) = self.slots.remove_if(&guild_id, |_, slot| slot.owner == owner) {
            slot.cancel.cancel();
        }
    }

    /// No bloquea. Pide un render para la guild dentro de un intervalo.
    pub fn mark_dirty(&self, guild_id: GuildId, owner: u64) {
        match self.slots.get(&guild_id) {
            Some(slot) if slot.owner == owner => {
                if !slot.dirty.swap(true, Ordering::AcqRel) {
                    slot.notify.notify_one();
                }
            }
            _ => debug!("Estado marcado para guild {} sin panel registrado", guild_id),
        }
    }
}

struct Worker {
    guild_id: GuildId,
    interval: Duration,
    renderer: Arc<dyn StatusRenderer>,
    slot: Arc<Slot>,
    source: watch::Receiver<StatusSnapshot>,
}

impl Worker {
    async fn run(self) {
        loop {
            tokio::select! {
                _ = self.slot.cancel.cancelled() => break,
                _ = self.slot.notify.notified() => {}
            }

            // Ventana de coalescencia
            tokio::select! {
                _ = self.slot.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            if !self.slot.dirty.swap(false, Ordering::AcqRel) {
                continue;
            }

            self.render().await;
        }

        // Último estado pendiente al soltar la guild (p. ej. la desconexión)
        if self.slot.dirty.swap(false, Ordering::AcqRel) {
            self.render().await;
        }
        debug!("Panel de estado de guild {} liberado", self.guild_id);
    }

    async fn render(&self) {
        let snapshot = self.source.borrow().clone();
        if let Err(e) = self.renderer.render(self.guild_id, snapshot).await {
            warn!("No se pudo actualizar el panel de guild {}: {:?}", self.guild_id, e);
        }
    }
}
