//! Ringback toward the originator while legs race
//!
//! ## Features
//!
//! - Tone scripts rendered once into a looping buffer
//! - 16-bit WAV files looped with rewind on end of file
//! - `silence[:level]` comfort noise
//! - Raw L16 codec installed on the originator only while playing
//!
//! The player runs as its own task on the originator's packet interval. It
//! keeps reading the originator's media while the race runs, starts writing
//! once armed, and restores the codec before it exits. [`RingbackHandle::stop`]
//! returns only after the task has finished, so nothing is written afterwards.

pub mod file;
pub mod tone;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, warn, Instrument};

use crate::channel::ChannelHandle;
use crate::errors::{OriginateError, Result};
use crate::types::{CodecImpl, Frame};

pub use file::WavLoop;
pub use tone::{parse_tone_script, LoopBuffer};

/// Audio source for ringback.
#[derive(Debug)]
pub enum RingbackSource {
    Tone(LoopBuffer),
    File(WavLoop),
    Silence { level: u32, rng: SmallRng },
}

impl RingbackSource {
    /// Open the source named by a `ringback` value for the given codec.
    pub fn open(spec: &str, codec: &CodecImpl, default_silence: u32) -> Result<Self> {
        let spec = spec.trim();
        if spec == "silence" || spec.starts_with("silence:") {
            let level = spec
                .strip_prefix("silence:")
                .and_then(|l| l.trim().parse::<u32>().ok())
                .filter(|l| *l > 0)
                .unwrap_or(default_silence);
            return Ok(RingbackSource::Silence {
                level,
                rng: SmallRng::from_entropy(),
            });
        }
        if is_file_path(spec) {
            let wav = WavLoop::open(spec, codec.sample_rate, codec.channels)?;
            return Ok(RingbackSource::File(wav));
        }
        let segments = parse_tone_script(spec)?;
        let pcm = tone::render(&segments, codec.sample_rate, codec.channels);
        Ok(RingbackSource::Tone(LoopBuffer::new(pcm)))
    }

    /// One packet worth of audio.
    pub fn next_frame(&mut self, codec: &CodecImpl) -> Result<Frame> {
        let samples = codec.samples_per_packet();
        let pcm = match self {
            RingbackSource::Tone(buffer) => buffer.read(samples),
            RingbackSource::File(wav) => wav.read(samples / codec.channels.max(1) as usize)?,
            RingbackSource::Silence { level, rng } => {
                // Higher level means quieter noise
                let peak = (i16::MAX as u32 / (*level).max(1)).max(1) as i16;
                (0..samples).map(|_| rng.gen_range(-peak..=peak)).collect()
            }
        };
        Ok(Frame::from_samples(&pcm, codec.sample_rate, codec.channels))
    }
}

fn is_file_path(spec: &str) -> bool {
    spec.starts_with('/')
        || spec.starts_with('\\')
        || (spec.contains("://") && !spec.starts_with("tone_stream://"))
        || spec.as_bytes().get(1) == Some(&b':')
        || spec.to_ascii_lowercase().ends_with(".wav")
}

/// What one ringback run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RingbackStats {
    pub frames_written: u64,
    pub codec_installed: bool,
    pub codec_restored: bool,
    pub error: Option<String>,
}

/// Running ringback player.
pub struct RingbackHandle {
    armed: Arc<AtomicBool>,
    token: CancellationToken,
    task: Option<JoinHandle<RingbackStats>>,
    stats: Option<RingbackStats>,
}

impl RingbackHandle {
    /// Start playing on the next packet tick. Idempotent.
    pub fn arm(&self) {
        if !self.armed.swap(true, Ordering::SeqCst) {
            debug!("Ringback armed");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Stop the player and wait for it to restore the codec. Idempotent.
    pub async fn stop(&mut self) -> RingbackStats {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let stats = match task.await {
                Ok(stats) => stats,
                Err(e) => RingbackStats {
                    error: Some(format!("ringback task failed: {}", e)),
                    ..Default::default()
                },
            };
            self.stats = Some(stats);
        }
        self.stats.clone().unwrap_or_default()
    }
}

impl Drop for RingbackHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Spawns the media pump for one race.
pub struct RingbackPlayer {
    originator: ChannelHandle,
    spec: Option<String>,
    silence_level: u32,
}

impl RingbackPlayer {
    pub fn new(originator: ChannelHandle, spec: Option<String>, silence_level: u32) -> Self {
        Self {
            originator,
            spec,
            silence_level,
        }
    }

    /// Run the pump until `parent` fires or the handle is stopped.
    pub fn spawn(self, parent: &CancellationToken) -> RingbackHandle {
        let armed = Arc::new(AtomicBool::new(false));
        let token = parent.child_token();
        let span = debug_span!("ringback", channel = %self.originator.name());
        let task = tokio::spawn(self.run(armed.clone(), token.clone()).instrument(span));
        RingbackHandle {
            armed,
            token,
            task: Some(task),
            stats: None,
        }
    }

    async fn run(self, armed: Arc<AtomicBool>, token: CancellationToken) -> RingbackStats {
        let mut stats = RingbackStats::default();
        let Some(read_codec) = self.originator.read_codec() else {
            debug!("Originator {} has no media, ringback idle", self.originator.name());
            token.cancelled().await;
            return stats;
        };
        let interval = read_codec.packet_interval();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut source: Option<(RingbackSource, CodecImpl)> = None;
        let mut setup_failed = false;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.originator.is_ready() {
                break;
            }

            let read = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                read = self.originator.read_frame(interval * 2) => read,
            };
            if let Err(e) = read {
                debug!("Originator media read failed: {}", e);
                break;
            }

            if source.is_none() && !setup_failed && armed.load(Ordering::SeqCst) {
                match self.setup(&read_codec, &mut stats).await {
                    Ok(active) => source = Some(active),
                    Err(e) => {
                        warn!("Ringback disabled for {}: {}", self.originator.name(), e);
                        stats.error = Some(e.to_string());
                        setup_failed = true;
                    }
                }
            }

            let Some((src, codec)) = source.as_mut() else {
                continue;
            };
            let frame = match src.next_frame(codec) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Ringback source failed: {}", e);
                    stats.error = Some(e.to_string());
                    source = None;
                    setup_failed = true;
                    continue;
                }
            };
            if token.is_cancelled() {
                break;
            }
            if let Err(e) = self.originator.write_frame(&frame).await {
                debug!("Ringback write failed: {}", e);
                break;
            }
            stats.frames_written += 1;
        }

        if stats.codec_installed {
            self.originator.restore_codec();
            stats.codec_restored = true;
        }
        stats
    }

    async fn setup(&self, read_codec: &CodecImpl, stats: &mut RingbackStats) -> Result<(RingbackSource, CodecImpl)> {
        let spec = self
            .spec
            .as_deref()
            .ok_or_else(|| OriginateError::media("no ringback configured"))?;
        if read_codec.passthrough {
            return Err(OriginateError::media(format!(
                "codec {} is passthrough, cannot generate ringback",
                read_codec.name
            )));
        }

        let flags = self.originator.snapshot().flags;
        if !flags.answered && !flags.early_media {
            self.originator.pre_answer().await?;
        }

        let raw = CodecImpl::linear(read_codec.sample_rate, read_codec.ptime_ms, read_codec.channels);
        self.originator.install_raw_codec(raw.clone())?;
        stats.codec_installed = true;

        let source = RingbackSource::open(spec, &raw, self.silence_level)?;
        debug!("Ringback playing '{}' to {}", spec, self.originator.name());
        Ok((source, raw))
    }
}
