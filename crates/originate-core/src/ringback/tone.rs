//! Tone script synthesis
//!
//! Scripts follow the familiar cadence notation:
//!
//! ```text
//! tone_stream://v=-7;%(2000,4000,440,480)
//! %(400,200,400,450);%(400,2000,400,450)
//! ```
//!
//! Each `%(on_ms,off_ms,freq...)` segment plays the summed frequencies for
//! `on_ms` then silence for `off_ms`. `v=<dB>` sets the level for the
//! following segments. `L=<n>` loop counts are accepted and ignored since
//! ringback always loops.

use std::f64::consts::PI;

use crate::errors::{OriginateError, Result};

const DEFAULT_VOLUME_DB: f64 = -7.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ToneSegment {
    pub on_ms: u32,
    pub off_ms: u32,
    pub freqs: Vec<f64>,
    pub volume_db: f64,
}

/// Parse a tone script into segments.
pub fn parse_tone_script(script: &str) -> Result<Vec<ToneSegment>> {
    let body = script.trim();
    let body = body.strip_prefix("tone_stream://").unwrap_or(body);
    let mut volume_db = DEFAULT_VOLUME_DB;
    let mut segments = Vec::new();

    for part in body.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some(v) = part.strip_prefix("v=") {
            volume_db = v
                .trim()
                .parse()
                .map_err(|_| OriginateError::media(format!("bad tone volume '{}'", v)))?;
            continue;
        }
        if part.starts_with("L=") || part.starts_with("l=") {
            continue;
        }
        let inner = part
            .strip_prefix("%(")
            .and_then(|p| p.strip_suffix(')'))
            .ok_or_else(|| OriginateError::media(format!("bad tone segment '{}'", part)))?;
        let fields: Vec<&str> = inner.split(',').map(str::trim).collect();
        if fields.len() < 2 {
            return Err(OriginateError::media(format!("tone segment needs on,off: '{}'", part)));
        }
        let number = |s: &str| -> Result<f64> {
            s.parse::<f64>()
                .ok()
                .filter(|n| n.is_finite() && *n >= 0.0)
                .ok_or_else(|| OriginateError::media(format!("bad tone value '{}'", s)))
        };
        let on_ms = number(fields[0])? as u32;
        let off_ms = number(fields[1])? as u32;
        let freqs = fields[2..]
            .iter()
            .map(|f| number(*f))
            .collect::<Result<Vec<f64>>>()?;
        segments.push(ToneSegment {
            on_ms,
            off_ms,
            freqs,
            volume_db,
        });
    }

    if segments.iter().all(|s| s.on_ms == 0 && s.off_ms == 0) {
        return Err(OriginateError::media(format!("empty tone script '{}'", script)));
    }
    Ok(segments)
}

/// Render one full cadence cycle as interleaved samples.
pub fn render(segments: &[ToneSegment], sample_rate: u32, channels: u16) -> Vec<i16> {
    let rate = sample_rate as f64;
    let mut out = Vec::new();
    for seg in segments {
        let amplitude = 32767.0 * 10f64.powf(seg.volume_db / 20.0);
        let on = (seg.on_ms as u64 * sample_rate as u64 / 1000) as usize;
        let off = (seg.off_ms as u64 * sample_rate as u64 / 1000) as usize;
        for n in 0..on {
            let value = if seg.freqs.is_empty() {
                0.0
            } else {
                let t = n as f64 / rate;
                seg.freqs.iter().map(|f| (2.0 * PI * f * t).sin()).sum::<f64>()
                    / seg.freqs.len() as f64
            };
            let sample = (value * amplitude).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            for _ in 0..channels.max(1) {
                out.push(sample);
            }
        }
        out.extend(std::iter::repeat(0i16).take(off * channels.max(1) as usize));
    }
    out
}

/// Ring buffer replaying one rendered cycle forever.
#[derive(Debug, Clone)]
pub struct LoopBuffer {
    samples: Vec<i16>,
    pos: usize,
}

impl LoopBuffer {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Next `n` samples, wrapping at the end of the cycle.
    pub fn read(&mut self, n: usize) -> Vec<i16> {
        if self.samples.is_empty() {
            return vec![0; n];
        }
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let take = (n - out.len()).min(self.samples.len() - self.pos);
            out.extend_from_slice(&self.samples[self.pos..self.pos + take]);
            self.pos = (self.pos + take) % self.samples.len();
        }
        out
    }
}
