//! Per-guild player.
//!
//! Each guild runs one [`GuildPlayer`] task that owns the queue, the pipeline supervisor
//! and the idle timer. Every operation (user commands and pipeline completions alike)
//! is a message handled by that task, one at a time, in arrival order. The task is the
//! guild's critical section; nothing else touches its state.
//!
//! Callers talk to the task through a cloneable [`GuildPlayerHandle`].

use serenity::model::id::GuildId;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{sleep_until, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use super::{
    debounce::StatusDebouncer,
    pipeline::{EncoderLauncher, PipelineEvent, PipelineOutcome, PipelineSupervisor},
    queue::{Advance, GuildQueue, LoopMode, VOLUME_MAX},
    status::{PlayerState, StatusSnapshot, UP_NEXT_LEN},
    voice::VoiceSink,
};
use crate::{
    error::{InvalidOperation, PlayerError, PlayerResult},
    sources::{TrackDescriptor, TrackResolver},
};

const COMMAND_BUFFER: usize = 64;

/// Parámetros de construcción de cada reproductor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerSettings {
    pub idle_timeout: Duration,
    pub default_volume: u16,
    pub max_queue_size: usize,
    pub status_interval: Duration,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5 * 60),
            default_volume: 100,
            max_queue_size: 1000,
            status_interval: Duration::from_secs(1),
        }
    }
}

/// Colaboradores externos que necesita un reproductor
#[derive(Clone)]
pub struct PlayerDeps {
    pub resolver: Arc<dyn TrackResolver>,
    pub launcher: Arc<dyn EncoderLauncher>,
    pub sink: Arc<dyn VoiceSink>,
    pub debouncer: Arc<StatusDebouncer>,
}

/// Resultado de `play`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayOutcome {
    /// Sonando ya
    Started,
    /// En cola, posición 0-based dentro de la cola pendiente
    Enqueued { position: usize },
}

type Reply<T> = oneshot::Sender<PlayerResult<T>>;

enum Command {
    Play(TrackDescriptor, Reply<PlayOutcome>),
    Pause(Reply<()>),
    Resume(Reply<()>),
    TogglePause(Reply<PlayerState>),
    Skip(Reply<Option<TrackDescriptor>>),
    Stop(Reply<()>),
    Seek(Duration, Reply<()>),
    SetVolume(u16, Reply<()>),
    AdjustVolume(i32, Reply<u16>),
    SetLoopMode(LoopMode, Reply<()>),
    CycleLoopMode(Reply<LoopMode>),
    Shuffle(Reply<()>),
    ListQueue(Reply<Vec<TrackDescriptor>>),
    RemoveAt(usize, Reply<TrackDescriptor>),
    MoveTo(usize, usize, Reply<()>),
    Clear(Reply<usize>),
    RemoveDuplicates(Reply<usize>),
    Jump(usize, Reply<TrackDescriptor>),
    Snapshot(Reply<StatusSnapshot>),
    Shutdown(Reply<()>),
    #[cfg(test)]
    ForceState(PlayerState, Reply<()>),
}

impl Command {
    fn reject(self, error: PlayerError) {
        match self {
            Command::Play(_, r) => drop(r.send(Err(error))),
            Command::Skip(r) => drop(r.send(Err(error))),
            Command::TogglePause(r) => drop(r.send(Err(error))),
            Command::AdjustVolume(_, r) => drop(r.send(Err(error))),
            Command::CycleLoopMode(r) => drop(r.send(Err(error))),
            Command::ListQueue(r) => drop(r.send(Err(error))),
            Command::RemoveAt(_, r) | Command::Jump(_, r) => drop(r.send(Err(error))),
            Command::Clear(r) | Command::RemoveDuplicates(r) => drop(r.send(Err(error))),
            Command::Snapshot(r) => drop(r.send(Err(error))),
            Command::Pause(r)
            | Command::Resume(r)
            | Command::Stop(r)
            | Command::Seek(_, r)
            | Command::SetVolume(_, r)
            | Command::SetLoopMode(_, r)
            | Command::Shuffle(r)
            | Command::MoveTo(_, _, r)
            | Command::Shutdown(r) => drop(r.send(Err(error))),
            #[cfg(test)]
            Command::ForceState(_, r) => drop(r.send(Err(error))),
        }
    }
}

/// Handle clonable hacia el reproductor de una guild
#[derive(Clone)]
pub struct GuildPlayerHandle {
    id: u64,
    guild_id: GuildId,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<StatusSnapshot>,
}

impl GuildPlayerHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> PlayerResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| PlayerError::Closed)?;
        rx.await.map_err(|_| PlayerError::Closed)?
    }

    pub async fn play(&self, track: TrackDescriptor) -> PlayerResult<PlayOutcome> {
        self.request(|r| Command::Play(track, r)).await
    }

    pub async fn pause(&self) -> PlayerResult<()> {
        self.request(Command::Pause).await
    }

    pub async fn resume(&self) -> PlayerResult<()> {
        self.request(Command::Resume).await
    }

    /// Pausa si suena, reanuda si está en pausa. Devuelve el estado resultante.
    pub async fn toggle_pause(&self) -> PlayerResult<PlayerState> {
        self.request(Command::TogglePause).await
    }

    /// Salta el actual; devuelve el track que empieza, si hay
    pub async fn skip(&self) -> PlayerResult<Option<TrackDescriptor>> {
        self.request(Command::Skip).await
    }

    pub async fn stop(&self) -> PlayerResult<()> {
        self.request(Command::Stop).await
    }

    pub async fn seek(&self, offset: Duration) -> PlayerResult<()> {
        self.request(|r| Command::Seek(offset, r)).await
    }

    pub async fn set_volume(&self, percent: u16) -> PlayerResult<()> {
        self.request(|r| Command::SetVolume(percent, r)).await
    }

    pub async fn set_loop_mode(&self, mode: LoopMode) -> PlayerResult<()> {
        self.request(|r| Command::SetLoopMode(mode, r)).await
    }

    /// off → track → queue → off
    pub async fn cycle_loop_mode(&self) -> PlayerResult<LoopMode> {
        self.request(Command::CycleLoopMode).await
    }

    /// Suma `delta` al volumen, recortado a 0..=200. Devuelve el volumen nuevo.
    pub async fn adjust_volume(&self, delta: i32) -> PlayerResult<u16> {
        self.request(|r| Command::AdjustVolume(delta, r)).await
    }

    pub async fn shuffle(&self) -> PlayerResult<()> {
        self.request(Command::Shuffle).await
    }

    pub async fn list_queue(&self) -> PlayerResult<Vec<TrackDescriptor>> {
        self.request(Command::ListQueue).await
    }

    pub async fn remove_at(&self, index: usize) -> PlayerResult<TrackDescriptor> {
        self.request(|r| Command::RemoveAt(index, r)).await
    }

    pub async fn move_to(&self, from: usize, to: usize) -> PlayerResult<()> {
        self.request(|r| Command::MoveTo(from, to, r)).await
    }

    pub async fn clear(&self) -> PlayerResult<usize> {
        self.request(Command::Clear).await
    }

    pub async fn remove_duplicates(&self) -> PlayerResult<usize> {
        self.request(Command::RemoveDuplicates).await
    }

    /// Salta directamente al track en `index` de la cola pendiente
    pub async fn jump(&self, index: usize) -> PlayerResult<TrackDescriptor> {
        self.request(|r| Command::Jump(index, r)).await
    }

    pub async fn snapshot(&self) -> PlayerResult<StatusSnapshot> {
        self.request(Command::Snapshot).await
    }

    /// Detiene todo, sale de voz y termina el reproductor
    pub async fn shutdown(&self) -> PlayerResult<()> {
        self.request(Command::Shutdown).await
    }

    #[cfg(test)]
    pub(crate) async fn force_state(&self, state: PlayerState) -> PlayerResult<()> {
        self.request(|r| Command::ForceState(state, r)).await
    }

    /// Último estado publicado, sin pasar por la sección crítica
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }
}

/// Posición de reproducción llevada fuera del pipeline
#[derive(Debug, Default)]
struct PlaybackClock {
    base: Duration,
    started_at: Option<Instant>,
}

impl PlaybackClock {
    fn position(&self) -> Duration {
        self.base + self.started_at.map(|s| s.elapsed()).unwrap_or_default()
    }

    fn run_from(&mut self, offset: Duration) {
        self.base = offset;
        self.started_at = Some(Instant::now());
    }

    fn freeze(&mut self) {
        self.base = self.position();
        self.started_at = None;
    }

    fn set(&mut self, offset: Duration) {
        self.base = offset;
        if self.started_at.is_some() {
            self.started_at = Some(Instant::now());
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Quita al reproductor del registro (si sigue siendo la entrada vigente)
pub type Deregister = Box<dyn FnOnce() + Send + Sync>;

pub struct GuildPlayer {
    id: u64,
    guild_id: GuildId,
    settings: PlayerSettings,
    queue: GuildQueue,
    pipeline: PipelineSupervisor,
    sink: Arc<dyn VoiceSink>,
    state: PlayerState,
    clock: PlaybackClock,
    idle_deadline: Option<Instant>,
    status_dirty: bool,
    last_error: Option<String>,
    status: watch::Sender<StatusSnapshot>,
    debouncer: Arc<StatusDebouncer>,
    deregister: Option<Deregister>,
}

impl GuildPlayer {
    /// Crea el reproductor, lanza su tarea y devuelve el handle
    pub fn spawn(
        id: u64,
        guild_id: GuildId,
        settings: PlayerSettings,
        deps: PlayerDeps,
        deregister: Deregister,
    ) -> GuildPlayerHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) =
            watch::channel(StatusSnapshot::idle(guild_id, settings.default_volume));

        deps.debouncer.attach(guild_id, id, status_rx.clone());

        let pipeline = PipelineSupervisor::new(
            guild_id,
            deps.resolver,
            deps.launcher,
            deps.sink.clone(),
            events_tx,
        );

        let mut player = GuildPlayer {
            id,
            guild_id,
            settings,
            queue: GuildQueue::new(settings.default_volume, settings.max_queue_size),
            pipeline,
            sink: deps.sink,
            state: PlayerState::Idle,
            clock: PlaybackClock::default(),
            idle_deadline: None,
            status_dirty: false,
            last_error: None,
            status: status_tx,
            debouncer: deps.debouncer,
            deregister: Some(deregister),
        };
        player.enter_idle();

        info!("🎛️ Reproductor creado para guild {}", guild_id);
        tokio::spawn(player.run(commands_rx, events_rx));

        GuildPlayerHandle {
            id,
            guild_id,
            commands: commands_tx,
            status: status_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<PipelineEvent>,
    ) {
        let mut progress = tokio::time::interval(self.settings.status_interval);
        progress.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let idle_deadline = self.idle_deadline;
            let playing = self.state == PlayerState::Playing;

            let step: PlayerResult<bool> = tokio::select! {
                biased;
                Some(event) = events.recv() => self.on_pipeline_event(event).await.map(|_| true),
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.teardown().await;
                        let _ = reply.send(Ok(()));
                        Ok(false)
                    }
                    Some(command) => self.handle(command).await.map(|_| true),
                    None => {
                        // Todos los handles se soltaron
                        self.teardown().await;
                        Ok(false)
                    }
                },
                _ = sleep_until(idle_deadline.unwrap_or_else(Instant::now)), if idle_deadline.is_some() => {
                    self.on_idle_timeout().await;
                    Ok(false)
                }
                _ = progress.tick(), if playing => {
                    self.status_dirty = true;
                    Ok(true)
                }
            };

            let keep_running = match step.and_then(|keep| self.check_invariants().map(|_| keep)) {
                Ok(keep) => keep,
                Err(e) => {
                    error!("💥 Reproductor de guild {} abortado: {}", self.guild_id, e);
                    self.teardown().await;
                    false
                }
            };

            if !keep_running {
                break;
            }
            if self.status_dirty {
                self.publish_status();
            }
        }

        // Lo que quedó en el canal llegó tarde: el reproductor ya no existe
        commands.close();
        while let Ok(command) = commands.try_recv() {
            command.reject(PlayerError::Closed);
        }
        debug!("Tarea del reproductor de guild {} finalizada", self.guild_id);
    }

    /// Returns `Err` only for `ConcurrencyViolation`; everything else is replied to the caller.
    async fn handle(&mut self, command: Command) -> PlayerResult<()> {
        match command {
            Command::Play(track, r) => {
                let result = self.play(track).await;
                self.reply(r, result)
            }
            Command::Pause(r) => {
                let result = self.pause().await;
                self.reply(r, result)
            }
            Command::Resume(r) => {
                let result = self.resume().await;
                self.reply(r, result)
            }
            Command::TogglePause(r) => {
                let result = match self.state {
                    PlayerState::Paused => self.resume().await,
                    _ => self.pause().await,
                };
                let state = self.state;
                self.reply(r, result.map(|_| state))
            }
            Command::Skip(r) => {
                let result = self.skip().await;
                self.reply(r, result)
            }
            Command::Stop(r) => {
                let result = self.stop().await;
                self.reply(r, result)
            }
            Command::Seek(offset, r) => {
                let result = self.seek(offset).await;
                self.reply(r, result)
            }
            Command::SetVolume(percent, r) => {
                let result = self.set_volume(percent).await;
                self.reply(r, result)
            }
            Command::AdjustVolume(delta, r) => {
                let target = (i32::from(self.queue.volume()) + delta).clamp(0, i32::from(VOLUME_MAX));
                let target = u16::try_from(target).unwrap_or(VOLUME_MAX);
                let result = self.set_volume(target).await.map(|_| target);
                self.reply(r, result)
            }
            Command::CycleLoopMode(r) => {
                let mode = self.queue.loop_mode().cycle();
                self.queue.set_loop_mode(mode);
                self.reply(r, Ok(mode))
            }
            Command::SetLoopMode(mode, r) => {
                self.queue.set_loop_mode(mode);
                self.reply(r, Ok(()))
            }
            Command::Shuffle(r) => {
                self.queue.shuffle();
                self.reply(r, Ok(()))
            }
            Command::ListQueue(r) => {
                self.touch();
                let _ = r.send(Ok(self.queue.list()));
                Ok(())
            }
            Command::RemoveAt(index, r) => {
                let result = self.queue.remove_at(index).map_err(PlayerError::from);
                self.reply(r, result)
            }
            Command::MoveTo(from, to, r) => {
                let result = self.queue.move_to(from, to).map_err(PlayerError::from);
                self.reply(r, result)
            }
            Command::Clear(r) => {
                let removed = self.queue.clear();
                self.reply(r, Ok(removed))
            }
            Command::RemoveDuplicates(r) => {
                let removed = self.queue.remove_duplicates();
                self.reply(r, Ok(removed))
            }
            Command::Jump(index, r) => {
                let result = self.jump(index).await;
                self.reply(r, result)
            }
            Command::Snapshot(r) => {
                self.touch();
                let _ = r.send(Ok(self.snapshot()));
                Ok(())
            }
            Command::Shutdown(r) => {
                // Se atiende en run()
                let _ = r.send(Ok(()));
                Ok(())
            }
            #[cfg(test)]
            Command::ForceState(state, r) => {
                self.state = state;
                let _ = r.send(Ok(()));
                Ok(())
            }
        }
    }

    /// Envía la respuesta; los cambios aceptados ensucian el panel
    fn reply<T>(&mut self, reply: Reply<T>, result: PlayerResult<T>) -> PlayerResult<()> {
        if let Err(PlayerError::ConcurrencyViolation(msg)) = &result {
            let msg = msg.clone();
            let _ = reply.send(result);
            return Err(PlayerError::ConcurrencyViolation(msg));
        }
        if result.is_ok() {
            self.status_dirty = true;
            self.touch();
        }
        let _ = reply.send(result);
        Ok(())
    }

    /// Una operación aceptada en Idle reinicia la cuenta de inactividad
    fn touch(&mut self) {
        if self.state == PlayerState::Idle {
            self.idle_deadline = Some(Instant::now() + self.settings.idle_timeout);
        }
    }

    async fn play(&mut self, track: TrackDescriptor) -> PlayerResult<PlayOutcome> {
        match self.state {
            PlayerState::Idle => {
                info!("🎵 Reproduciendo {} en guild {}", track.title(), self.guild_id);
                self.queue.set_current(track);
                self.start_current(Duration::ZERO).await?;
                Ok(PlayOutcome::Started)
            }
            _ => {
                let len = self.queue.enqueue(track)?;
                Ok(PlayOutcome::Enqueued { position: len - 1 })
            }
        }
    }

    async fn pause(&mut self) -> PlayerResult<()> {
        match self.state {
            PlayerState::Playing => {
                self.pipeline.stop().await;
                self.clock.freeze();
                self.state = PlayerState::Paused;
                info!("⏸️ Reproducción pausada en guild {}", self.guild_id);
                Ok(())
            }
            PlayerState::Paused => Err(InvalidOperation::NotPlaying.into()),
            _ => Err(InvalidOperation::NothingPlaying.into()),
        }
    }

    async fn resume(&mut self) -> PlayerResult<()> {
        match self.state {
            PlayerState::Paused => {
                let offset = self.clock.position();
                self.start_current(offset).await?;
                info!("▶️ Reproducción reanudada en guild {}", self.guild_id);
                Ok(())
            }
            PlayerState::Playing => Err(InvalidOperation::NotPaused.into()),
            _ => Err(InvalidOperation::NothingPlaying.into()),
        }
    }

    async fn skip(&mut self) -> PlayerResult<Option<TrackDescriptor>> {
        if self.queue.current().is_none() {
            return Err(InvalidOperation::NothingPlaying.into());
        }

        self.state = PlayerState::Stopping;
        self.pipeline.stop().await;
        info!("⏭️ Track saltado en guild {}", self.guild_id);
        self.advance(Advance::Skipped).await
    }

    async fn stop(&mut self) -> PlayerResult<()> {
        self.state = PlayerState::Stopping;
        self.pipeline.stop().await;
        self.queue.clear();
        self.queue.take_current();
        info!("⏹️ Reproducción detenida en guild {}", self.guild_id);
        self.enter_idle();
        Ok(())
    }

    async fn seek(&mut self, offset: Duration) -> PlayerResult<()> {
        let current = self
            .queue
            .current()
            .ok_or(InvalidOperation::NothingPlaying)?;

        if let Some(duration) = current.duration() {
            if offset > duration {
                return Err(InvalidOperation::SeekOutOfRange { offset, duration }.into());
            }
        }

        match self.state {
            PlayerState::Playing => self.start_current(offset).await?,
            _ => self.clock.set(offset),
        }
        info!("⏩ Seek a {:?} en guild {}", offset, self.guild_id);
        Ok(())
    }

    async fn set_volume(&mut self, percent: u16) -> PlayerResult<()> {
        if self.queue.current().is_none() {
            return Err(InvalidOperation::NothingPlaying.into());
        }
        self.queue.set_volume(percent)?;

        // Sin canal de parámetros en vivo: reinicio en la posición actual
        if self.state == PlayerState::Playing {
            let offset = self.clock.position();
            self.start_current(offset).await?;
        }
        info!("🔊 Volumen ajustado a {}% en guild {}", percent, self.guild_id);
        Ok(())
    }

    async fn jump(&mut self, index: usize) -> PlayerResult<TrackDescriptor> {
        if self.queue.current().is_none() {
            return Err(InvalidOperation::NothingPlaying.into());
        }
        self.queue.jump_to(index)?;

        self.state = PlayerState::Stopping;
        self.pipeline.stop().await;
        self.advance(Advance::Skipped)
            .await?
            .ok_or_else(|| PlayerError::ConcurrencyViolation("jump sin track destino".to_string()))
    }

    async fn on_pipeline_event(&mut self, event: PipelineEvent) -> PlayerResult<()> {
        if !self.pipeline.accept(&event).await {
            return Ok(());
        }
        if self.state != PlayerState::Playing {
            return Err(PlayerError::ConcurrencyViolation(format!(
                "señal de pipeline en estado {}",
                self.state
            )));
        }

        self.status_dirty = true;
        let advance = match event.outcome {
            PipelineOutcome::Finished => Advance::Completed,
            PipelineOutcome::Interrupted(reason) => {
                warn!("⚠️ Stream cortado en guild {}: {}", self.guild_id, reason);
                Advance::Completed
            }
            PipelineOutcome::ResolutionFailed(reason) => {
                let failed = PlayerError::Resolution(reason);
                warn!("❌ {} en guild {}", failed, self.guild_id);
                self.last_error = Some(failed.to_string());
                Advance::Skipped
            }
            PipelineOutcome::LaunchFailed(reason) => {
                let failed = PlayerError::PipelineLaunch(reason);
                warn!("❌ {} en guild {}", failed, self.guild_id);
                self.last_error = Some(failed.to_string());
                Advance::Skipped
            }
        };

        self.advance(advance).await.map(|_| ())
    }

    /// Pasa al siguiente track o a Idle si no queda nada
    async fn advance(&mut self, advance: Advance) -> PlayerResult<Option<TrackDescriptor>> {
        match self.queue.dequeue_next(advance) {
            Ok(next) => {
                self.start_current(Duration::ZERO).await?;
                Ok(Some(next))
            }
            Err(_) => {
                self.enter_idle();
                Ok(None)
            }
        }
    }

    async fn start_current(&mut self, offset: Duration) -> PlayerResult<()> {
        let track = self.queue.current().cloned().ok_or_else(|| {
            PlayerError::ConcurrencyViolation("arranque de pipeline sin track actual".to_string())
        })?;

        if self.idle_deadline.take().is_some() {
            debug!("⏱️ Timer de inactividad cancelado en guild {}", self.guild_id);
        }
        self.pipeline
            .start(track, self.queue.volume(), offset)
            .await;
        self.clock.run_from(offset);
        self.state = PlayerState::Playing;
        self.status_dirty = true;
        Ok(())
    }

    fn enter_idle(&mut self) {
        self.state = PlayerState::Idle;
        self.clock.reset();
        self.idle_deadline = Some(Instant::now() + self.settings.idle_timeout);
        self.status_dirty = true;
        debug!(
            "💤 Guild {} inactiva, desconexión en {:?}",
            self.guild_id, self.settings.idle_timeout
        );
    }

    async fn on_idle_timeout(&mut self) {
        info!("🚪 Desconectando por inactividad en guild {}", self.guild_id);
        self.teardown().await;
    }

    /// Detiene el pipeline, sale de voz y se quita del registro.
    ///
    /// The handle stays registered until voice is released, so a request arriving
    /// meanwhile gets `Closed` instead of a second player racing for the same call.
    async fn teardown(&mut self) {
        self.state = PlayerState::Disconnecting;
        self.idle_deadline = None;
        self.pipeline.stop().await;
        self.queue.clear();
        self.queue.take_current();
        self.sink.disconnect().await;
        self.publish_status();
        self.debouncer.detach(self.guild_id, self.id);
        if let Some(deregister) = self.deregister.take() {
            deregister();
        }
        info!("👋 Reproductor de guild {} eliminado", self.guild_id);
    }

    fn check_invariants(&self) -> PlayerResult<()> {
        let has_current = self.queue.current().is_some();
        let has_pipeline = self.pipeline.is_active();

        let consistent = match self.state {
            PlayerState::Playing => has_current && has_pipeline,
            PlayerState::Paused => has_current && !has_pipeline,
            PlayerState::Idle => !has_current && !has_pipeline,
            PlayerState::Disconnecting => !has_pipeline,
            PlayerState::Stopping => false,
        };

        if consistent {
            Ok(())
        } else {
            Err(PlayerError::ConcurrencyViolation(format!(
                "estado {} con track actual={} y pipeline={}",
                self.state, has_current, has_pipeline
            )))
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        let position = match self.queue.current().and_then(|t| t.duration()) {
            Some(duration) => self.clock.position().min(duration),
            None => self.clock.position(),
        };

        StatusSnapshot {
            guild_id: self.guild_id,
            state: self.state,
            current: self.queue.current().cloned(),
            position,
            volume: self.queue.volume(),
            loop_mode: self.queue.loop_mode(),
            pending: self.queue.len(),
            up_next: self.queue.list().into_iter().take(UP_NEXT_LEN).collect(),
            remaining: self.queue.remaining_duration(),
            last_error: self.last_error.clone(),
        }
    }

    fn publish_status(&mut self) {
        self.status.send_replace(self.snapshot());
        self.debouncer.mark_dirty(self.guild_id, self.id);
        self.status_dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{
        debounce::StatusRenderer,
        pipeline::{EncoderProcess, EncoderRequest},
        registry::PlayerRegistry,
    };
    use crate::sources::MockTrackResolver;
    use async_trait::async_trait;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;
    use std::{
        io,
        sync::atomic::{AtomicUsize, Ordering},
    };

    /// Encoder que nunca termina
    struct EndlessProcess;

    #[async_trait]
    impl EncoderProcess for EndlessProcess {
        async fn next_frame(&mut self) -> io::Result<Option<Bytes>> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Some(Bytes::from_static(&[0u8; 8])))
        }

        async fn kill(&mut self) {}
    }

    struct EndlessLauncher;

    #[async_trait]
    impl EncoderLauncher for EndlessLauncher {
        async fn launch(&self, _request: EncoderRequest) -> PlayerResult<Box<dyn EncoderProcess>> {
            Ok(Box::new(EndlessProcess))
        }
    }

    #[derive(Default)]
    struct CountingSink {
        disconnects: AtomicUsize,
    }

    #[async_trait]
    impl VoiceSink for CountingSink {
        async fn send_frames(&self, frames: flume::Receiver<Bytes>) -> anyhow::Result<()> {
            tokio::spawn(async move { while frames.recv_async().await.is_ok() {} });
            Ok(())
        }

        async fn drained(&self) {}

        async fn halt(&self) {}

        async fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct SilentRenderer;

    #[async_trait]
    impl StatusRenderer for SilentRenderer {
        async fn render(&self, _guild_id: GuildId, _snapshot: StatusSnapshot) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry() -> PlayerRegistry {
        let mut resolver = MockTrackResolver::new();
        resolver
            .expect_stream_url()
            .returning(|track| Ok(format!("https://cdn.example/{}", track.title())));
        let debouncer = Arc::new(StatusDebouncer::new(Duration::from_secs(1), Arc::new(SilentRenderer)));
        PlayerRegistry::new(
            PlayerSettings::default(),
            Arc::new(resolver),
            Arc::new(EndlessLauncher),
            debouncer,
        )
    }

    fn track(title: &str) -> TrackDescriptor {
        TrackDescriptor::new(format!("https://youtu.be/{}", title), title, UserId::new(1))
    }

    #[tokio::test(start_paused = true)]
    async fn broken_invariant_tears_down_only_that_guild() {
        let registry = registry();
        let broken_sink = Arc::new(CountingSink::default());
        let healthy_sink = Arc::new(CountingSink::default());
        let broken_guild = GuildId::new(1);
        let healthy_guild = GuildId::new(2);

        let broken = registry.get_or_create(broken_guild, || broken_sink.clone() as Arc<dyn VoiceSink>);
        let healthy = registry.get_or_create(healthy_guild, || healthy_sink.clone() as Arc<dyn VoiceSink>);
        broken.play(track("a")).await.unwrap();
        healthy.play(track("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Pausado con el pipeline todavía vivo
        broken.force_state(PlayerState::Paused).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!registry.contains(broken_guild));
        assert!(matches!(broken.skip().await, Err(PlayerError::Closed)));
        assert_eq!(broken_sink.disconnects.load(Ordering::SeqCst), 1);

        assert!(registry.contains(healthy_guild));
        let snapshot = healthy.snapshot().await.unwrap();
        assert_eq!(snapshot.state, PlayerState::Playing);
        assert_eq!(snapshot.current.map(|t| t.title().to_string()), Some("b".to_string()));
        assert_eq!(healthy_sink.disconnects.load(Ordering::SeqCst), 0);

        let fresh = registry.get_or_create(broken_guild, || broken_sink.clone() as Arc<dyn VoiceSink>);
        assert_ne!(fresh.id(), broken.id());
        assert_eq!(fresh.play(track("c")).await, Ok(PlayOutcome::Started));
    }
}
