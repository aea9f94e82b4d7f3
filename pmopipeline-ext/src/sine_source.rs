//! Source de test : générateur sinusoïdal
//!
//! Produit une sinusoïde continue au format demandé, un buffer par cycle
//! de process (contrat des producteurs synchrones). Les buffers viennent
//! du pool du stage et portent un timestamp dérivé de la position en
//! frames.

use std::f32::consts::PI;

use tracing::debug;

use pmopipeline::{
    Buffer, BufferFormat, BufferLength, BufferPool, SampleFormat, Sink, Source, StageContext,
    StageLogic,
};

/// Générateur sinusoïdal
///
/// Optionnellement borné : une fois le budget de frames épuisé, le dernier
/// buffer part avec le drapeau fin de flux et le stage ne produit plus
/// rien.
pub struct SineSource {
    pool: BufferPool,
    format: BufferFormat,
    frames_per_buffer: u32,
    frequency: f32,
    amplitude: f32,
    /// Position absolue en frames, base de la phase et des timestamps
    position: u64,
    frame_limit: Option<u64>,
    finished: bool,
    out: Option<Source>,
    scratch: Vec<f32>,
}

impl SineSource {
    /// Source sans fin au format donné
    pub fn new(format: BufferFormat, frames_per_buffer: u32, frequency: f32) -> Self {
        SineSource {
            pool: BufferPool::with_capacity(
                SampleFormat::F32,
                format,
                BufferLength::Frames(frames_per_buffer),
                4,
            ),
            format,
            frames_per_buffer,
            frequency,
            amplitude: 1.0,
            position: 0,
            frame_limit: None,
            finished: false,
            out: None,
            scratch: Vec::new(),
        }
    }

    /// Borne la production ; le dernier buffer est marqué fin de flux
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Amplitude crête de la sinusoïde (1.0 = pleine échelle)
    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude;
        self
    }

    fn fill(&mut self, buffer: &mut Buffer) {
        let channels = self.format.channel_count() as usize;
        let rate = self.format.sample_rate() as f32;

        let mut frames = self.frames_per_buffer as u64;
        if let Some(limit) = self.frame_limit {
            frames = frames.min(limit.saturating_sub(self.position));
        }

        self.scratch.resize(frames as usize * channels, 0.0);
        for i in 0..frames as usize {
            let t = (self.position + i as u64) as f32 / rate;
            let sample = self.amplitude * (2.0 * PI * self.frequency * t).sin();
            for ch in 0..channels {
                self.scratch[i * channels + ch] = sample;
            }
        }

        buffer.set_timestamp_sec(self.position as f64 / rate as f64);
        buffer.write_interleaved(&self.scratch);
        self.position += frames;

        if let Some(limit) = self.frame_limit {
            if self.position >= limit {
                buffer.set_flag(Buffer::END_OF_STREAM);
                self.finished = true;
                debug!("sine source: frame budget exhausted, flagging end of stream");
            }
        }
    }
}

impl StageLogic for SineSource {
    fn begin_playback(&mut self) -> bool {
        self.position = 0;
        self.finished = false;
        true
    }

    fn process(&mut self, ctx: &mut StageContext<'_>) {
        if self.finished {
            return;
        }

        if self.out.is_none() {
            self.out = ctx.source("out");
        }
        let Some(out) = self.out.clone() else {
            debug!("sine source: no source port named \"out\"");
            return;
        };

        let mut buffer = self.pool.acquire();
        self.fill(&mut buffer);
        ctx.push(&out, buffer);
    }

    fn reconfigure_input_format(&mut self, _sink: &Sink, _format: &BufferFormat) -> bool {
        // Pas de sink : jamais appelé.
        true
    }
}

// ============================================================================
// Tests
// ============================================================================
