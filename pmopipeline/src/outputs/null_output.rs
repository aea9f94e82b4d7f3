//! Sortie nulle : consomme le flux sans le jouer
//!
//! Tient le rôle du backend terminal dans les tests et les benchmarks :
//! pur consommateur avec provider d'horloge, piloté en publiant des ticks
//! sur le provider. Compte ce qu'il consomme dans des statistiques
//! partagées.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error};

use crate::buffer::Buffer;
use crate::buffer_format::BufferFormat;
use crate::clock_provider::{ClockCapabilities, ClockProvider};
use crate::events::Message;
use crate::port::{PullError, Sink};
use crate::stage::{StageContext, StageLogic};

struct StatsInner {
    buffers: AtomicU64,
    frames: AtomicU64,
    underruns: AtomicU64,
    end_of_stream: AtomicU64,
    /// Timestamp du dernier buffer consommé, en bits f64
    last_timestamp: AtomicU64,
}

/// Statistiques partagées d'une sortie
///
/// Clonable ; toutes les copies lisent les mêmes compteurs.
#[derive(Clone)]
pub struct OutputStats {
    inner: Arc<StatsInner>,
}

impl OutputStats {
    fn new() -> Self {
        OutputStats {
            inner: Arc::new(StatsInner {
                buffers: AtomicU64::new(0),
                frames: AtomicU64::new(0),
                underruns: AtomicU64::new(0),
                end_of_stream: AtomicU64::new(0),
                last_timestamp: AtomicU64::new(0.0f64.to_bits()),
            }),
        }
    }

    /// Buffers consommés
    pub fn buffers(&self) -> u64 {
        self.inner.buffers.load(Ordering::Acquire)
    }

    /// Frames consommées
    pub fn frames(&self) -> u64 {
        self.inner.frames.load(Ordering::Acquire)
    }

    /// Pulls revenus à vide (mode non bloquant)
    pub fn underruns(&self) -> u64 {
        self.inner.underruns.load(Ordering::Acquire)
    }

    /// Vrai si un buffer marqué fin de flux a été consommé
    pub fn saw_end_of_stream(&self) -> bool {
        self.inner.end_of_stream.load(Ordering::Acquire) > 0
    }

    /// Timestamp du dernier buffer consommé, en secondes
    pub fn last_timestamp_sec(&self) -> f64 {
        f64::from_bits(self.inner.last_timestamp.load(Ordering::Acquire))
    }
}

/// Sortie terminale sans périphérique
///
/// En mode bloquant (défaut), chaque tick d'horloge consomme exactement un
/// buffer (le pull attend le producteur). En mode non bloquant, un tick
/// sans buffer disponible est compté comme underrun, comme un périphérique
/// réel qui jouerait du silence.
pub struct NullOutput {
    provider: Arc<ClockProvider>,
    stats: OutputStats,
    blocking: bool,
    input: Option<Sink>,
}

impl NullOutput {
    /// Capacités de cadence annoncées : de 1 ms à 1 s
    pub const CAPABILITIES: ClockCapabilities = ClockCapabilities::new(1_000_000, 1_000_000_000);

    /// Période par défaut : 10 ms
    pub const DEFAULT_PERIOD_NS: u64 = 10_000_000;

    pub fn new() -> Self {
        Self::with_blocking(true)
    }

    /// Variante non bloquante : `try_pull` à chaque tick
    pub fn non_blocking() -> Self {
        Self::with_blocking(false)
    }

    fn with_blocking(blocking: bool) -> Self {
        NullOutput {
            provider: Arc::new(ClockProvider::new(
                Self::CAPABILITIES,
                Self::DEFAULT_PERIOD_NS,
            )),
            stats: OutputStats::new(),
            blocking,
            input: None,
        }
    }

    /// Statistiques de consommation
    pub fn stats(&self) -> OutputStats {
        self.stats.clone()
    }

    /// Provider d'horloge de la sortie
    ///
    /// Les tests publient dessus pour cadencer le pipeline.
    pub fn provider(&self) -> Arc<ClockProvider> {
        Arc::clone(&self.provider)
    }

    fn consume(&self, buffer: &Buffer, ctx: &StageContext<'_>) {
        self.stats.inner.buffers.fetch_add(1, Ordering::AcqRel);
        self.stats
            .inner
            .frames
            .fetch_add(buffer.available() as u64, Ordering::AcqRel);
        self.stats
            .inner
            .last_timestamp
            .store(buffer.timestamp_sec().to_bits(), Ordering::Release);

        if buffer.has_flag(Buffer::END_OF_STREAM) {
            debug!("null output: end of stream reached");
            self.stats.inner.end_of_stream.fetch_add(1, Ordering::AcqRel);
            ctx.post(Message::EndOfStream);
        }
    }
}

impl Default for NullOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl StageLogic for NullOutput {
    fn process(&mut self, ctx: &mut StageContext<'_>) {
        if self.input.is_none() {
            self.input = ctx.sink("input");
        }
        let Some(input) = self.input.clone() else {
            debug!("null output: no sink named \"input\"");
            return;
        };

        if !input.is_linked() {
            debug!("null output: no source linked to input");
            return;
        }

        // La logique repasse en argument du pull pour la renégociation de
        // format en cours de route.
        let result = if self.blocking {
            ctx.pull(&mut *self, &input)
        } else {
            ctx.try_pull(&mut *self, &input)
        };

        match result {
            Ok(buffer) => self.consume(&buffer, ctx),
            Err(PullError::BufferQueueEmpty) => {
                // Un périphérique réel jouerait du silence.
                self.stats.inner.underruns.fetch_add(1, Ordering::AcqRel);
            }
            Err(PullError::Cancelled) => {
                debug!("null output: pull cancelled");
            }
            Err(err) => {
                error!("null output: pull error: {err}");
            }
        }
    }

    fn stopped_playback(&mut self) -> bool {
        if let Some(input) = &self.input {
            input.reset_format();
        }
        true
    }

    fn reconfigure_input_format(&mut self, _sink: &Sink, format: &BufferFormat) -> bool {
        debug!("null output: accepting input format {format}");
        format.is_valid()
    }

    fn clock_provider(&self) -> Option<Arc<ClockProvider>> {
        Some(Arc::clone(&self.provider))
    }
}

// ============================================================================
// Tests
// ============================================================================
