//! Fakes for the player collaborators.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serenity::model::id::{GuildId, UserId};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use utila_music::{
    audio::{
        pipeline::{EncoderLauncher, EncoderProcess, EncoderRequest},
        player::PlayerSettings,
        voice::VoiceSink,
        GuildPlayerHandle, PlayerRegistry, StatusDebouncer, StatusRenderer, StatusSnapshot,
    },
    error::{PlayerError, PlayerResult},
    sources::{TrackDescriptor, TrackResolver},
};

pub fn guild() -> GuildId {
    GuildId::new(42)
}

pub fn user() -> UserId {
    UserId::new(7)
}

/// Track de `secs` segundos; la fuente es el nombre
pub fn track(name: &str, secs: u64) -> TrackDescriptor {
    TrackDescriptor::new(name, name.to_uppercase(), user()).with_duration(Duration::from_secs(secs))
}

pub fn settings() -> PlayerSettings {
    PlayerSettings {
        idle_timeout: Duration::from_secs(5 * 60),
        default_volume: 100,
        max_queue_size: 100,
        status_interval: Duration::from_secs(1),
    }
}

/// Deja correr las tareas pendientes
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Fuentes que empiezan por `bad:` no se resuelven
#[derive(Default)]
pub struct FakeResolver {
    pub stream_requests: AtomicUsize,
}

#[async_trait]
impl TrackResolver for FakeResolver {
    async fn resolve(&self, query: &str, requested_by: UserId) -> PlayerResult<TrackDescriptor> {
        Ok(TrackDescriptor::new(query, query, requested_by))
    }

    async fn stream_url(&self, track: &TrackDescriptor) -> PlayerResult<String> {
        self.stream_requests.fetch_add(1, Ordering::SeqCst);
        if track.source_ref().starts_with("bad:") {
            return Err(PlayerError::Resolution("fuente no disponible".to_string()));
        }
        Ok(format!("https://cdn.test/{}", track.source_ref()))
    }
}

/// Procesos que emiten un frame por segundo de audio.
///
/// URLs containing `fail-launch` fail to start. Tracks last `track_len` unless the URL
/// ends in `:<secs>`.
pub struct FakeLauncher {
    pub track_len: Duration,
    pub requests: Mutex<Vec<EncoderRequest>>,
    pub live: Arc<AtomicUsize>,
    pub max_live: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn new(track_len: Duration) -> Self {
        Self {
            track_len,
            requests: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
            max_live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn requests(&self) -> Vec<EncoderRequest> {
        self.requests.lock().clone()
    }

    pub fn started_sources(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|r| r.input_url.trim_start_matches("https://cdn.test/").to_string())
            .collect()
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    fn length_for(&self, url: &str) -> Duration {
        url.rsplit_once(':')
            .and_then(|(_, secs)| secs.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(self.track_len)
    }
}

#[async_trait]
impl EncoderLauncher for FakeLauncher {
    async fn launch(&self, request: EncoderRequest) -> PlayerResult<Box<dyn EncoderProcess>> {
        self.requests.lock().push(request.clone());
        if request.input_url.contains("fail-launch") {
            return Err(PlayerError::PipelineLaunch("ffmpeg no arrancó".to_string()));
        }

        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now, Ordering::SeqCst);

        let remaining = self
            .length_for(&request.input_url)
            .saturating_sub(request.start_offset)
            .as_secs();

        Ok(Box::new(FakeProcess {
            remaining,
            live: self.live.clone(),
            reaped: AtomicBool::new(false),
        }))
    }
}

struct FakeProcess {
    remaining: u64,
    live: Arc<AtomicUsize>,
    reaped: AtomicBool,
}

impl FakeProcess {
    fn reap(&self) {
        if !self.reaped.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl EncoderProcess for FakeProcess {
    async fn next_frame(&mut self) -> io::Result<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.remaining -= 1;
        Ok(Some(Bytes::from_static(&[0u8; 16])))
    }

    async fn kill(&mut self) {
        self.reap();
    }
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        self.reap();
    }
}

/// Sink que "suena" cada frame durante `playout`.
///
/// `halt` drops whatever the current session still holds, like songbird stopping the track.
#[derive(Default)]
pub struct FakeSink {
    pub playout: Duration,
    pub disconnect_delay: Duration,
    pub sessions: AtomicUsize,
    pub frames: Arc<AtomicUsize>,
    pub halts: AtomicUsize,
    pub disconnects: AtomicUsize,
    session: Mutex<Option<(CancellationToken, watch::Receiver<bool>)>>,
}

impl FakeSink {
    pub fn with_playout(playout: Duration) -> Self {
        Self {
            playout,
            ..Default::default()
        }
    }

    pub fn with_disconnect_delay(disconnect_delay: Duration) -> Self {
        Self {
            disconnect_delay,
            ..Default::default()
        }
    }
}

#[async_trait]
impl VoiceSink for FakeSink {
    async fn send_frames(&self, frames: flume::Receiver<Bytes>) -> anyhow::Result<()> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        if let Some((previous, _)) = self.session.lock().replace((cancel.clone(), done_rx)) {
            previous.cancel();
        }

        let counter = self.frames.clone();
        let playout = self.playout;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = frames.recv_async() => {
                        if frame.is_err() {
                            break;
                        }
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(playout) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
            done_tx.send_replace(true);
        });
        Ok(())
    }

    async fn drained(&self) {
        let done = self.session.lock().as_ref().map(|(_, done)| done.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(|d| *d).await;
        }
    }

    async fn halt(&self) {
        self.halts.fetch_add(1, Ordering::SeqCst);
        if let Some((cancel, _)) = self.session.lock().take() {
            cancel.cancel();
        }
    }

    async fn disconnect(&self) {
        tokio::time::sleep(self.disconnect_delay).await;
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingRenderer {
    pub snapshots: Mutex<Vec<StatusSnapshot>>,
}

impl RecordingRenderer {
    pub fn last(&self) -> Option<StatusSnapshot> {
        self.snapshots.lock().last().cloned()
    }
}

#[async_trait]
impl StatusRenderer for RecordingRenderer {
    async fn render(&self, _guild_id: GuildId, snapshot: StatusSnapshot) -> anyhow::Result<()> {
        self.snapshots.lock().push(snapshot);
        Ok(())
    }
}

pub struct Harness {
    pub registry: Arc<PlayerRegistry>,
    pub resolver: Arc<FakeResolver>,
    pub launcher: Arc<FakeLauncher>,
    pub sink: Arc<FakeSink>,
    pub renderer: Arc<RecordingRenderer>,
    pub sinks_created: Arc<AtomicUsize>,
}

impl Harness {
    pub fn new(settings: PlayerSettings) -> Self {
        Self::with_track_len(settings, Duration::from_secs(180))
    }

    pub fn with_track_len(settings: PlayerSettings, track_len: Duration) -> Self {
        Self::build(settings, track_len, FakeSink::default())
    }

    pub fn with_sink(settings: PlayerSettings, sink: FakeSink) -> Self {
        Self::build(settings, Duration::from_secs(180), sink)
    }

    fn build(settings: PlayerSettings, track_len: Duration, sink: FakeSink) -> Self {
        let resolver = Arc::new(FakeResolver::default());
        let launcher = Arc::new(FakeLauncher::new(track_len));
        let renderer = Arc::new(RecordingRenderer::default());
        let debouncer = Arc::new(StatusDebouncer::new(settings.status_interval, renderer.clone()));
        let registry = Arc::new(PlayerRegistry::new(
            settings,
            resolver.clone(),
            launcher.clone(),
            debouncer,
        ));

        Self {
            registry,
            resolver,
            launcher,
            sink: Arc::new(sink),
            renderer,
            sinks_created: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn player(&self, guild_id: GuildId) -> GuildPlayerHandle {
        let sink = self.sink.clone();
        let created = self.sinks_created.clone();
        self.registry.get_or_create(guild_id, move || {
            created.fetch_add(1, Ordering::SeqCst);
            sink as Arc<dyn VoiceSink>
        })
    }
}

pub fn sources(tracks: &[TrackDescriptor]) -> Vec<String> {
    tracks.iter().map(|t| t.source_ref().to_string()).collect()
}
