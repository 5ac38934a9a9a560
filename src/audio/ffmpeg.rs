use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::{io, process::Stdio, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::{Child, ChildStdout, Command},
};
use tracing::{debug, info, warn};

use super::pipeline::{EncoderLauncher, EncoderProcess, EncoderRequest};
use crate::error::{PlayerError, PlayerResult};

/// Discord voice: 48kHz estéreo
pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u32 = 2;
/// 20ms de f32le estéreo @ 48kHz
pub const FRAME_BYTES: usize = 960 * CHANNELS as usize * 4;

/// Opciones de entrada: reconexión en streams HTTP
pub const FFMPEG_INPUT_OPTS: &[&str] = &[
    "-reconnect",
    "1",
    "-reconnect_streamed",
    "1",
    "-reconnect_delay_max",
    "5",
];

const RESAMPLE_FILTER: &str = "aresample=async=1:min_hard_comp=0.100000:first_pts=0";

/// Construye los argumentos de ffmpeg para una petición
pub fn build_args(request: &EncoderRequest) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-loglevel", "error"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    args.extend(FFMPEG_INPUT_OPTS.iter().map(|s| s.to_string()));

    // -ss antes de -i: seek en la entrada
    if request.start_offset > Duration::ZERO {
        args.push("-ss".to_string());
        args.push(format!("{:.3}", request.start_offset.as_secs_f64()));
    }

    args.push("-i".to_string());
    args.push(request.input_url.clone());
    args.push("-vn".to_string());
    args.push("-af".to_string());
    args.push(format!(
        "{},volume={:.2}",
        RESAMPLE_FILTER,
        f32::from(request.volume_percent) / 100.0
    ));
    args.extend(
        [
            "-f",
            "f32le",
            "-ar",
            &SAMPLE_RATE.to_string(),
            "-ac",
            &CHANNELS.to_string(),
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string()),
    );

    args
}

/// Lanza procesos ffmpeg reales
pub struct FfmpegLauncher {
    binary: String,
}

impl FfmpegLauncher {
    pub fn new() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
        }
    }
}

impl Default for FfmpegLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EncoderLauncher for FfmpegLauncher {
    async fn launch(&self, request: EncoderRequest) -> PlayerResult<Box<dyn EncoderProcess>> {
        let args = build_args(&request);
        debug!("🎛️ ffmpeg {}", args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlayerError::PipelineLaunch(format!("no se pudo ejecutar ffmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PlayerError::PipelineLaunch("ffmpeg sin stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("ffmpeg: {}", line);
                }
            });
        }

        info!(
            "🎵 ffmpeg iniciado (volumen {}%, desde {:?})",
            request.volume_percent, request.start_offset
        );

        Ok(Box::new(FfmpegProcess {
            child,
            stdout,
            reaped: false,
        }))
    }
}

struct FfmpegProcess {
    child: Child,
    stdout: ChildStdout,
    reaped: bool,
}

#[async_trait]
impl EncoderProcess for FfmpegProcess {
    async fn next_frame(&mut self) -> io::Result<Option<Bytes>> {
        let mut frame = BytesMut::zeroed(FRAME_BYTES);
        let mut filled = 0;

        while filled < FRAME_BYTES {
            let n = self.stdout.read(&mut frame[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            // Fin del stream: distinguir salida limpia de error
            let status = self.child.wait().await?;
            self.reaped = true;
            if !status.success() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("ffmpeg terminó con {}", status),
                ));
            }
            return Ok(None);
        }

        // Último frame incompleto: el resto queda en silencio
        Ok(Some(frame.freeze()))
    }

    async fn kill(&mut self) {
        if self.reaped {
            return;
        }
        if let Err(e) = self.child.kill().await {
            debug!("ffmpeg ya había terminado: {}", e);
        }
        self.reaped = true;
    }
}
