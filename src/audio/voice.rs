use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use parking_lot::Mutex;
use serenity::model::id::GuildId;
use songbird::{
    input::{Input, RawAdapter},
    tracks::TrackHandle,
    Call, Event, EventContext, EventHandler, Songbird, TrackEvent,
};
use std::{
    io::{self, Read, Seek, SeekFrom},
    sync::Arc,
};
use symphonia::core::io::MediaSource;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::ffmpeg::{CHANNELS, SAMPLE_RATE};

/// Destino de los frames codificados (la conexión de voz de una guild).
#[async_trait]
pub trait VoiceSink: Send + Sync {
    /// Empieza a enviar los frames del canal, reemplazando lo que se estuviera enviando
    async fn send_frames(&self, frames: flume::Receiver<Bytes>) -> anyhow::Result<()>;

    /// Waits until the stream handed to `send_frames` has been played out after its
    /// sender closed. Returns at once when nothing is playing.
    async fn drained(&self);

    /// Silencia inmediatamente la salida, descartando frames en buffer
    async fn halt(&self);

    /// Sale del canal de voz
    async fn disconnect(&self);
}

/// Guilds de las que el propio bot está saliendo.
///
/// The voice state update caused by our own `disconnect` must not be mistaken for someone
/// kicking the bot out.
#[derive(Debug, Clone, Default)]
pub struct Departures(Arc<DashSet<GuildId>>);

impl Departures {
    pub fn expect(&self, guild_id: GuildId) {
        self.0.insert(guild_id);
    }

    pub fn cancel(&self, guild_id: GuildId) {
        self.0.remove(&guild_id);
    }

    /// Consume la marca; `true` si la salida la inició el bot
    pub fn take(&self, guild_id: GuildId) -> bool {
        self.0.remove(&guild_id).is_some()
    }
}

struct PlayingTrack {
    handle: TrackHandle,
    ended: watch::Receiver<bool>,
}

/// Avisa cuando songbird termina de reproducir el track
struct TrackEndNotifier(watch::Sender<bool>);

#[async_trait]
impl EventHandler for TrackEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        self.0.send_replace(true);
        Some(Event::Cancel)
    }
}

/// Sink sobre una llamada de songbird.
pub struct SongbirdSink {
    guild_id: GuildId,
    manager: Arc<Songbird>,
    call: Arc<tokio::sync::Mutex<Call>>,
    departures: Departures,
    track: Mutex<Option<PlayingTrack>>,
}

impl SongbirdSink {
    pub fn new(
        guild_id: GuildId,
        manager: Arc<Songbird>,
        call: Arc<tokio::sync::Mutex<Call>>,
        departures: Departures,
    ) -> Self {
        Self {
            guild_id,
            manager,
            call,
            departures,
            track: Mutex::new(None),
        }
    }
}

#[async_trait]
impl VoiceSink for SongbirdSink {
    async fn send_frames(&self, frames: flume::Receiver<Bytes>) -> anyhow::Result<()> {
        let source = FrameReader::new(frames);
        let input: Input = RawAdapter::new(source, SAMPLE_RATE, CHANNELS).into();

        let handle = {
            let mut call = self.call.lock().await;
            call.play_only_input(input)
        };

        let (ended_tx, ended) = watch::channel(false);
        for event in [TrackEvent::End, TrackEvent::Error] {
            if let Err(e) = handle.add_event(Event::Track(event), TrackEndNotifier(ended_tx.clone())) {
                warn!("No se pudo observar el fin del track en guild {}: {:?}", self.guild_id, e);
            }
        }

        if let Some(previous) = self.track.lock().replace(PlayingTrack { handle, ended }) {
            let _ = previous.handle.stop();
        }
        debug!("🔊 Stream de frames conectado en guild {}", self.guild_id);
        Ok(())
    }

    async fn drained(&self) {
        let ended = self.track.lock().as_ref().map(|track| track.ended.clone());
        let Some(mut ended) = ended else {
            return;
        };

        // Err = los handlers se soltaron, el track ya no existe
        let _ = ended.wait_for(|done| *done).await;

        let mut slot = self.track.lock();
        if slot.as_ref().is_some_and(|track| track.ended.same_channel(&ended)) {
            slot.take();
        }
    }

    async fn halt(&self) {
        if let Some(track) = self.track.lock().take() {
            if let Err(e) = track.handle.stop() {
                debug!("Track ya detenido en guild {}: {:?}", self.guild_id, e);
            }
        }
    }

    async fn disconnect(&self) {
        self.halt().await;

        // Otro reproductor pudo haber unido la guild con una llamada nueva
        let owns_call = self
            .manager
            .get(self.guild_id)
            .is_some_and(|current| Arc::ptr_eq(&current, &self.call));
        if !owns_call {
            debug!("Llamada de guild {} ya no es de este reproductor", self.guild_id);
            return;
        }

        let connected = self.call.lock().await.current_channel().is_some();
        if connected {
            self.departures.expect(self.guild_id);
        }
        match self.manager.remove(self.guild_id).await {
            Ok(()) => info!("👋 Desconectado del canal de voz en guild {}", self.guild_id),
            Err(e) => {
                self.departures.cancel(self.guild_id);
                warn!("Error al desconectar de voz en guild {}: {:?}", self.guild_id, e)
            }
        }
    }
}

/// Lector bloqueante sobre el canal de frames; EOF cuando el emisor se cierra.
struct FrameReader {
    frames: flume::Receiver<Bytes>,
    pending: Bytes,
}

impl FrameReader {
    fn new(frames: flume::Receiver<Bytes>) -> Self {
        Self {
            frames,
            pending: Bytes::new(),
        }
    }
}

impl Read for FrameReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            match self.frames.recv() {
                Ok(frame) => self.pending = frame,
                Err(flume::RecvError::Disconnected) => return Ok(0),
            }
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        Ok(n)
    }
}

impl Seek for FrameReader {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "stream de frames no es seekable"))
    }
}

impl MediaSource for FrameReader {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_reader_concatenates_frames_until_sender_closes() {
        let (tx, rx) = flume::bounded(4);
        tx.send(Bytes::from_static(&[1, 2, 3])).unwrap();
        tx.send(Bytes::from_static(&[4, 5])).unwrap();
        drop(tx);

        let mut reader = FrameReader::new(rx);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn departures_are_consumed_once() {
        let departures = Departures::default();
        let guild = GuildId::new(3);

        assert!(!departures.take(guild));
        departures.expect(guild);
        assert!(departures.clone().take(guild));
        assert!(!departures.take(guild));

        departures.expect(guild);
        departures.cancel(guild);
        assert!(!departures.take(guild));
    }

    #[test]
    fn frame_reader_splits_large_frames() {
        let (tx, rx) = flume::bounded(1);
        tx.send(Bytes::from_static(&[9; 10])).unwrap();
        drop(tx);

        let mut reader = FrameReader::new(rx);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }
}
