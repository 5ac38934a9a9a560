use async_trait::async_trait;
use serde::Deserialize;
use serenity::model::id::UserId;
use std::time::Duration;
use tokio::{process::Command, time::timeout};
use tracing::{debug, error, info, warn};

use super::{looks_like_url, TrackDescriptor, TrackResolver};
use crate::error::{PlayerError, PlayerResult};

const FORMAT: &str = "bestaudio[acodec=opus]/bestaudio/best";
const PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolver basado en yt-dlp (búsqueda + URL directa de stream)
pub struct YtDlpResolver {
    binary: String,
}

impl YtDlpResolver {
    pub fn new() -> Self {
        Self {
            binary: "yt-dlp".to_string(),
        }
    }

    /// Verifica que yt-dlp y ffmpeg estén disponibles
    pub async fn verify_dependencies(&self) -> anyhow::Result<()> {
        let ytdlp_check = Command::new(&self.binary).arg("--version").output().await;

        match ytdlp_check {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                info!("✅ yt-dlp versión: {}", version.trim());
            }
            _ => {
                error!("❌ yt-dlp no encontrado. Instala con: pip install yt-dlp");
                anyhow::bail!("yt-dlp no disponible");
            }
        }

        let ffmpeg_check = Command::new("ffmpeg").arg("-version").output().await;

        match ffmpeg_check {
            Ok(output) if output.status.success() => {
                info!("✅ ffmpeg disponible");
            }
            _ => {
                error!("❌ ffmpeg no encontrado. Instala con: sudo apt install ffmpeg");
                anyhow::bail!("ffmpeg no disponible");
            }
        }

        Ok(())
    }

    /// Ejecuta yt-dlp con límite de tiempo y devuelve stdout
    async fn run(&self, args: &[&str]) -> PlayerResult<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.args([
            "--quiet",
            "--no-warnings",
            "--socket-timeout",
            "15",
            "--retries",
            "3",
            "--force-ipv4",
        ]);
        cmd.args(args);
        cmd.kill_on_drop(true);

        let output = timeout(PROCESS_TIMEOUT, cmd.output())
            .await
            .map_err(|_| PlayerError::Resolution("yt-dlp excedió el tiempo límite".to_string()))?
            .map_err(|e| PlayerError::Resolution(format!("yt-dlp no pudo ejecutarse: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp falló: {}", stderr.trim());
            return Err(PlayerError::Resolution(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for YtDlpResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrackResolver for YtDlpResolver {
    async fn resolve(&self, query: &str, requested_by: UserId) -> PlayerResult<TrackDescriptor> {
        info!("🔍 Resolviendo: {}", query);

        // Búsquedas de texto: sin playlists, primer resultado
        let target = if looks_like_url(query) {
            query.trim().to_string()
        } else {
            format!("ytsearch1:{}", query.trim())
        };

        let stdout = self
            .run(&["--dump-json", "--no-playlist", "--skip-download", &target])
            .await?;

        let line = stdout
            .lines()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| PlayerError::Resolution(format!("sin resultados para: {}", query)))?;

        let track = parse_info(line, query, requested_by)?;
        info!("✅ Resuelto: {} ({})", track.title(), track.source_ref());
        Ok(track)
    }

    async fn stream_url(&self, track: &TrackDescriptor) -> PlayerResult<String> {
        let stdout = self
            .run(&["-f", FORMAT, "-g", "--no-playlist", track.source_ref()])
            .await?;

        let url = stdout
            .lines()
            .map(str::trim)
            .find(|line| looks_like_url(line))
            .ok_or_else(|| {
                PlayerError::Resolution(format!("yt-dlp no devolvió stream para {}", track.title()))
            })?;

        debug!("🔗 Stream directo para {}", track.title());
        Ok(url.to_string())
    }
}

/// Campos de `--dump-json` que usamos
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    webpage_url: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    extractor_key: Option<String>,
}

/// Interpreta una línea JSON de yt-dlp
fn parse_info(line: &str, query: &str, requested_by: UserId) -> PlayerResult<TrackDescriptor> {
    let info: YtDlpInfo = serde_json::from_str(line.trim())
        .map_err(|e| PlayerError::Resolution(format!("respuesta inesperada de yt-dlp: {}", e)))?;

    let present = |value: Option<String>| value.filter(|s| !s.trim().is_empty());

    let source_ref = present(info.webpage_url).unwrap_or_else(|| query.to_string());
    let title = present(info.title).unwrap_or_else(|| "Unknown Title".to_string());
    let mut track = TrackDescriptor::new(source_ref, title, requested_by);

    if let Some(uploader) = present(info.uploader) {
        track = track.with_uploader(uploader);
    }
    if let Some(duration) = info.duration.filter(|d| d.is_finite() && *d > 0.0) {
        track = track.with_duration(Duration::from_secs_f64(duration));
    }
    if let Some(thumbnail) = present(info.thumbnail) {
        track = track.with_thumbnail(thumbnail);
    }
    if let Some(extractor) = present(info.extractor_key) {
        track = track.with_source_name(extractor);
    }

    Ok(track)
}
