//! Looping WAV file source

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use hound::{SampleFormat, WavReader};
use tracing::warn;

use crate::errors::{OriginateError, Result};

/// Streams a 16-bit PCM WAV file, rewinding on end of file, adapted to the
/// originator's rate and channel count.
pub struct WavLoop {
    reader: WavReader<BufReader<File>>,
    src_rate: u32,
    src_channels: u16,
    dst_rate: u32,
    dst_channels: u16,
    /// Fractional source position for rate conversion.
    phase: f64,
    /// Last source frame, reused while upsampling.
    current: Vec<i16>,
}

impl std::fmt::Debug for WavLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavLoop")
            .field("src_rate", &self.src_rate)
            .field("src_channels", &self.src_channels)
            .field("dst_rate", &self.dst_rate)
            .field("dst_channels", &self.dst_channels)
            .finish()
    }
}

impl WavLoop {
    pub fn open(path: impl AsRef<Path>, dst_rate: u32, dst_channels: u16) -> Result<Self> {
        let path = path.as_ref();
        let reader = WavReader::open(path)?;
        let spec = reader.spec();
        if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(OriginateError::media(format!(
                "{} is not 16-bit PCM",
                path.display()
            )));
        }
        if reader.duration() == 0 {
            return Err(OriginateError::media(format!("{} is empty", path.display())));
        }
        if spec.sample_rate != dst_rate {
            warn!(
                "Ringback file {} is {} Hz, resampling to {} Hz",
                path.display(),
                spec.sample_rate,
                dst_rate
            );
        }
        Ok(Self {
            reader,
            src_rate: spec.sample_rate,
            src_channels: spec.channels,
            dst_rate,
            dst_channels: dst_channels.max(1),
            phase: 1.0,
            current: vec![0; spec.channels as usize],
        })
    }

    /// Read one source frame, rewinding on a short read.
    fn next_source_frame(&mut self) -> Result<Vec<i16>> {
        let want = self.src_channels as usize;
        let mut frame = Vec::with_capacity(want);
        for attempt in 0..2 {
            frame.clear();
            for sample in self.reader.samples::<i16>().take(want) {
                frame.push(sample?);
            }
            if frame.len() == want {
                return Ok(frame);
            }
            if attempt == 0 {
                self.reader.seek(0)?;
            }
        }
        Err(OriginateError::media("ringback file yields no audio"))
    }

    /// Next `frames` destination frames as interleaved samples.
    pub fn read(&mut self, frames: usize) -> Result<Vec<i16>> {
        let step = self.src_rate as f64 / self.dst_rate as f64;
        let mut out = Vec::with_capacity(frames * self.dst_channels as usize);
        for _ in 0..frames {
            while self.phase >= 1.0 {
                self.current = self.next_source_frame()?;
                self.phase -= 1.0;
            }
            self.phase += step;
            push_frame(&mut out, &self.current, self.dst_channels);
        }
        Ok(out)
    }
}

fn push_frame(out: &mut Vec<i16>, src: &[i16], dst_channels: u16) {
    let dst = dst_channels as usize;
    if src.len() == dst {
        out.extend_from_slice(src);
    } else if dst == 1 {
        let sum: i32 = src.iter().map(|s| *s as i32).sum();
        out.push((sum / src.len().max(1) as i32) as i16);
    } else {
        for c in 0..dst {
            out.push(src.get(c).or_else(|| src.first()).copied().unwrap_or(0));
        }
    }
}
