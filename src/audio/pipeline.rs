//! Encoder pipeline supervision.
//!
//! A [`PipelineSupervisor`] owns at most one running encoder per guild. Starting a new
//! pipeline always stops (and waits for) the previous one, so two encoders for the same
//! guild never coexist. Completion is reported once per pipeline as a [`PipelineEvent`]
//! on the channel handed over at construction; explicit stops report nothing.

use async_trait::async_trait;
use bytes::Bytes;
use serenity::model::id::GuildId;
use std::{io, sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::voice::VoiceSink;
use crate::{
    error::{PlayerError, PlayerResult},
    sources::{TrackDescriptor, TrackResolver},
};

/// Frames en vuelo entre el encoder y el sink (~1s de audio)
const FRAME_BUFFER: usize = 50;

/// Tope de espera a que el sink termine de sonar lo que ya recibió
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Parámetros de arranque de un encoder
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderRequest {
    pub input_url: String,
    pub volume_percent: u16,
    pub start_offset: Duration,
}

/// Un proceso de encoding en ejecución.
#[async_trait]
pub trait EncoderProcess: Send {
    /// Next encoded frame; `Ok(None)` on clean end of stream.
    async fn next_frame(&mut self) -> io::Result<Option<Bytes>>;

    /// Kills the process and waits until it has been reaped. Idempotent.
    async fn kill(&mut self);
}

#[async_trait]
pub trait EncoderLauncher: Send + Sync {
    async fn launch(&self, request: EncoderRequest) -> PlayerResult<Box<dyn EncoderProcess>>;
}

/// Cómo terminó un pipeline que no fue detenido explícitamente
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Fin natural del stream
    Finished,
    /// Corte inesperado a mitad de stream; se trata igual que el fin natural
    Interrupted(String),
    /// La fuente no se pudo resolver
    ResolutionFailed(String),
    /// El encoder no arrancó
    LaunchFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineEvent {
    pub generation: u64,
    pub outcome: PipelineOutcome,
}

struct ActivePipeline {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct PipelineSupervisor {
    guild_id: GuildId,
    resolver: Arc<dyn TrackResolver>,
    launcher: Arc<dyn EncoderLauncher>,
    sink: Arc<dyn VoiceSink>,
    events: mpsc::UnboundedSender<PipelineEvent>,
    active: Option<ActivePipeline>,
    generation: u64,
}

impl PipelineSupervisor {
    pub fn new(
        guild_id: GuildId,
        resolver: Arc<dyn TrackResolver>,
        launcher: Arc<dyn EncoderLauncher>,
        sink: Arc<dyn VoiceSink>,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Self {
        Self {
            guild_id,
            resolver,
            launcher,
            sink,
            events,
            active: None,
            generation: 0,
        }
    }

    /// Arranca un pipeline para `track`. Vuelve enseguida; el resultado llega como evento.
    ///
    /// Any running pipeline is stopped first and awaited. Returns the generation of the new
    /// pipeline.
    pub async fn start(&mut self, track: TrackDescriptor, volume_percent: u16, start_offset: Duration) -> u64 {
        self.stop().await;

        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();

        let run = PipelineRun {
            guild_id: self.guild_id,
            track,
            volume_percent,
            start_offset,
            resolver: self.resolver.clone(),
            launcher: self.launcher.clone(),
            sink: self.sink.clone(),
            cancel: cancel.clone(),
        };
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            if let Some(outcome) = run.drive().await {
                // El receptor puede haberse cerrado si el reproductor ya terminó
                let _ = events.send(PipelineEvent { generation, outcome });
            }
        });

        self.active = Some(ActivePipeline {
            generation,
            cancel,
            task,
        });
        generation
    }

    /// Detiene el pipeline activo, si hay uno, y espera a que el proceso termine.
    ///
    /// Once this returns no further frames reach the sink. Returns whether a pipeline was
    /// running.
    pub async fn stop(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };

        active.cancel.cancel();
        if let Err(e) = active.task.await {
            if e.is_panic() {
                error!("💥 Pipeline de guild {} terminó en pánico", self.guild_id);
            }
        }
        self.sink.halt().await;
        debug!("⏹️ Pipeline {} detenido en guild {}", active.generation, self.guild_id);
        true
    }

    /// Acepta la señal de fin del pipeline actual. Las señales viejas se descartan.
    pub async fn accept(&mut self, event: &PipelineEvent) -> bool {
        let current = self.active.as_ref().map(|active| active.generation);
        if current == Some(event.generation) {
            // La tarea ya terminó y el sink sonó todo: se recoge sin silenciarlo
            if let Some(active) = self.active.take() {
                if let Err(e) = active.task.await {
                    if e.is_panic() {
                        error!("💥 Pipeline de guild {} terminó en pánico", self.guild_id);
                    }
                }
            }
            return true;
        }

        debug!(
            "Señal de pipeline {} descartada en guild {}",
            event.generation, self.guild_id
        );
        false
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct PipelineRun {
    guild_id: GuildId,
    track: TrackDescriptor,
    volume_percent: u16,
    start_offset: Duration,
    resolver: Arc<dyn TrackResolver>,
    launcher: Arc<dyn EncoderLauncher>,
    sink: Arc<dyn VoiceSink>,
    cancel: CancellationToken,
}

impl PipelineRun {
    /// `None` cuando el pipeline fue cancelado
    async fn drive(self) -> Option<PipelineOutcome> {
        let input_url = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            resolved = self.resolver.stream_url(&self.track) => match resolved {
                Ok(url) => url,
                Err(e) => return Some(PipelineOutcome::ResolutionFailed(failure_message(e))),
            },
        };

        let request = EncoderRequest {
            input_url,
            volume_percent: self.volume_percent,
            start_offset: self.start_offset,
        };

        let mut process = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            launched = self.launcher.launch(request) => match launched {
                Ok(process) => process,
                Err(e) => return Some(PipelineOutcome::LaunchFailed(failure_message(e))),
            },
        };

        let (frames_tx, frames_rx) = flume::bounded(FRAME_BUFFER);
        if let Err(e) = self.sink.send_frames(frames_rx).await {
            process.kill().await;
            return Some(PipelineOutcome::LaunchFailed(format!("sink de voz: {}", e)));
        }

        info!(
            "▶️ Reproduciendo {} en guild {} (desde {:?})",
            self.track.title(),
            self.guild_id,
            self.start_offset
        );

        let mut forwarded: u64 = 0;
        let outcome = loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    process.kill().await;
                    return None;
                }
                frame = process.next_frame() => frame,
            };

            match frame {
                Ok(Some(frame)) => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            process.kill().await;
                            return None;
                        }
                        sent = frames_tx.send_async(frame) => {
                            if sent.is_err() {
                                break PipelineOutcome::Interrupted("el sink de voz se cerró".to_string());
                            }
                            forwarded += 1;
                        }
                    }
                }
                Ok(None) => break PipelineOutcome::Finished,
                // Sin un solo frame: el encoder nunca arrancó de verdad
                Err(e) if forwarded == 0 => break PipelineOutcome::LaunchFailed(e.to_string()),
                Err(e) => break PipelineOutcome::Interrupted(e.to_string()),
            }
        };

        process.kill().await;

        // El fin se reporta cuando el último frame ya sonó
        if matches!(outcome, PipelineOutcome::Finished | PipelineOutcome::Interrupted(_)) {
            drop(frames_tx);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                drained = tokio::time::timeout(DRAIN_TIMEOUT, self.sink.drained()) => {
                    if drained.is_err() {
                        warn!("⏱️ El sink de guild {} no terminó de sonar a tiempo", self.guild_id);
                    }
                }
            }
        }

        match &outcome {
            PipelineOutcome::Finished => debug!(
                "🏁 {} terminó en guild {} ({} frames)",
                self.track.title(),
                self.guild_id,
                forwarded
            ),
            other => warn!("⚠️ Pipeline de guild {} terminó: {:?}", self.guild_id, other),
        }
        Some(outcome)
    }
}

fn failure_message(error: PlayerError) -> String {
    match error {
        PlayerError::Resolution(msg) | PlayerError::PipelineLaunch(msg) => msg,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::MockTrackResolver;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch;

    struct CountingProcess {
        remaining: usize,
        kills: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EncoderProcess for CountingProcess {
        async fn next_frame(&mut self) -> io::Result<Option<Bytes>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.remaining -= 1;
            Ok(Some(Bytes::from_static(&[0u8; 8])))
        }

        async fn kill(&mut self) {
            self.kills.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FixedLauncher {
        frames: usize,
        requests: Mutex<Vec<EncoderRequest>>,
        kills: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EncoderLauncher for FixedLauncher {
        async fn launch(&self, request: EncoderRequest) -> PlayerResult<Box<dyn EncoderProcess>> {
            self.requests.lock().push(request);
            Ok(Box::new(CountingProcess {
                remaining: self.frames,
                kills: self.kills.clone(),
            }))
        }
    }

    /// Suena cada frame durante `playout`
    #[derive(Default)]
    struct DrainSink {
        playout: Duration,
        played: Arc<AtomicUsize>,
        halts: AtomicUsize,
        done: Mutex<Option<watch::Receiver<bool>>>,
    }

    #[async_trait]
    impl VoiceSink for DrainSink {
        async fn send_frames(&self, frames: flume::Receiver<Bytes>) -> anyhow::Result<()> {
            let (done_tx, done_rx) = watch::channel(false);
            *self.done.lock() = Some(done_rx);
            let played = self.played.clone();
            let playout = self.playout;
            tokio::spawn(async move {
                while frames.recv_async().await.is_ok() {
                    tokio::time::sleep(playout).await;
                    played.fetch_add(1, Ordering::SeqCst);
                }
                done_tx.send_replace(true);
            });
            Ok(())
        }

        async fn drained(&self) {
            let done = self.done.lock().clone();
            if let Some(mut done) = done {
                let _ = done.wait_for(|d| *d).await;
            }
        }

        async fn halt(&self) {
            self.halts.fetch_add(1, Ordering::SeqCst);
        }

        async fn disconnect(&self) {}
    }

    fn track() -> TrackDescriptor {
        TrackDescriptor::new("https://youtu.be/abc", "Canción", UserId::new(1))
    }

    fn resolving_to(url: &'static str) -> Arc<MockTrackResolver> {
        let mut resolver = MockTrackResolver::new();
        resolver
            .expect_stream_url()
            .returning(move |_| Ok(url.to_string()));
        Arc::new(resolver)
    }

    fn supervisor(
        resolver: Arc<MockTrackResolver>,
        launcher: Arc<FixedLauncher>,
        sink: Arc<DrainSink>,
    ) -> (PipelineSupervisor, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = PipelineSupervisor::new(GuildId::new(1), resolver, launcher, sink, tx);
        (supervisor, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn natural_end_reports_finished_once() {
        let launcher = Arc::new(FixedLauncher {
            frames: 3,
            ..Default::default()
        });
        let (mut pipeline, mut events) = supervisor(
            resolving_to("https://cdn.example.com/a.webm"),
            launcher.clone(),
            Arc::new(DrainSink::default()),
        );

        let generation = pipeline.start(track(), 80, Duration::from_secs(5)).await;
        let event = events.recv().await.unwrap();

        assert_eq!(
            event,
            PipelineEvent {
                generation,
                outcome: PipelineOutcome::Finished
            }
        );
        assert_eq!(
            launcher.requests.lock().clone(),
            vec![EncoderRequest {
                input_url: "https://cdn.example.com/a.webm".to_string(),
                volume_percent: 80,
                start_offset: Duration::from_secs(5),
            }]
        );
        assert!(pipeline.accept(&event).await);
        assert!(!pipeline.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn natural_end_is_reported_after_the_sink_played_every_frame() {
        let launcher = Arc::new(FixedLauncher {
            frames: 5,
            ..Default::default()
        });
        let sink = Arc::new(DrainSink {
            playout: Duration::from_millis(100),
            ..Default::default()
        });
        let (mut pipeline, mut events) = supervisor(
            resolving_to("https://cdn.example.com/a.webm"),
            launcher.clone(),
            sink.clone(),
        );

        pipeline.start(track(), 100, Duration::ZERO).await;
        let event = events.recv().await.unwrap();

        assert_eq!(event.outcome, PipelineOutcome::Finished);
        assert_eq!(sink.played.load(Ordering::SeqCst), 5);

        assert!(pipeline.accept(&event).await);
        assert_eq!(sink.halts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resolution_failure_is_reported() {
        let mut resolver = MockTrackResolver::new();
        resolver
            .expect_stream_url()
            .returning(|_| Err(PlayerError::Resolution("sin formatos".to_string())));
        let launcher = Arc::new(FixedLauncher::default());
        let (mut pipeline, mut events) = supervisor(
            Arc::new(resolver),
            launcher.clone(),
            Arc::new(DrainSink::default()),
        );

        pipeline.start(track(), 100, Duration::ZERO).await;
        let event = events.recv().await.unwrap();

        assert_eq!(
            event.outcome,
            PipelineOutcome::ResolutionFailed("sin formatos".to_string())
        );
        assert!(launcher.requests.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_kills_process_halts_sink_and_reports_nothing() {
        let launcher = Arc::new(FixedLauncher {
            frames: 10_000,
            ..Default::default()
        });
        let sink = Arc::new(DrainSink::default());
        let (mut pipeline, mut events) = supervisor(
            resolving_to("https://cdn.example.com/a.webm"),
            launcher.clone(),
            sink.clone(),
        );

        pipeline.start(track(), 100, Duration::ZERO).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(pipeline.stop().await);
        assert_eq!(launcher.kills.load(Ordering::SeqCst), 1);
        assert_eq!(sink.halts.load(Ordering::SeqCst), 1);
        assert!(!pipeline.stop().await);

        let late = tokio::time::timeout(Duration::from_secs(1), events.recv()).await;
        assert!(late.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_discards_previous_generation() {
        let launcher = Arc::new(FixedLauncher {
            frames: 10_000,
            ..Default::default()
        });
        let (mut pipeline, _events) = supervisor(
            resolving_to("https://cdn.example.com/a.webm"),
            launcher.clone(),
            Arc::new(DrainSink::default()),
        );

        let first = pipeline.start(track(), 100, Duration::ZERO).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = pipeline.start(track(), 100, Duration::from_secs(30)).await;

        assert!(second > first);
        assert_eq!(launcher.kills.load(Ordering::SeqCst), 1);

        let stale = PipelineEvent {
            generation: first,
            outcome: PipelineOutcome::Finished,
        };
        assert!(!pipeline.accept(&stale).await);
        assert!(pipeline.is_active());
        assert_eq!(pipeline.generation(), second);
    }
}
