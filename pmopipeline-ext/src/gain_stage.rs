//! Étage de gain en place
//!
//! Transformateur un sink / un source : tire un buffer, applique un gain
//! linéaire sur la région lisible sans copie, et le pousse en aval. Le
//! gain est stocké en décibels ; `gain_linear = 10^(gain_db / 20)`.

use tracing::debug;

use pmopipeline::{
    Buffer, BufferFormat, PullError, Sample, SampleFormat, Sink, Source, StageContext, StageLogic,
};

const MIN_GAIN_DB: f64 = -120.0;

/// Convertit un gain linéaire (>0) en décibels
#[inline]
pub fn linear_to_db(gain_linear: f64) -> f64 {
    if gain_linear <= 0.0 {
        MIN_GAIN_DB
    } else {
        (20.0 * gain_linear.log10()).max(MIN_GAIN_DB)
    }
}

/// Convertit un gain en décibels vers un gain linéaire
#[inline]
pub fn db_to_linear(gain_db: f64) -> f64 {
    10f64.powf(gain_db / 20.0)
}

/// Gain appliqué au flux, quel que soit le type de samples
///
/// Les types entiers sont quantifiés avec saturation après le produit ;
/// les flottants sont multipliés directement.
pub struct GainStage {
    gain_db: f64,
    input: Option<Sink>,
    out: Option<Source>,
}

impl GainStage {
    pub fn new(gain_db: f64) -> Self {
        GainStage {
            gain_db,
            input: None,
            out: None,
        }
    }

    /// Gain courant en décibels
    pub fn gain_db(&self) -> f64 {
        self.gain_db
    }

    fn apply(&self, buffer: &mut Buffer) {
        let gain = db_to_linear(self.gain_db);
        if (gain - 1.0).abs() < f64::EPSILON {
            return;
        }

        match buffer.sample_format() {
            SampleFormat::U8 => scale::<u8>(buffer, gain),
            SampleFormat::I16 => scale::<i16>(buffer, gain),
            SampleFormat::I24 => scale::<pmopipeline::I24>(buffer, gain),
            SampleFormat::I32 => scale::<i32>(buffer, gain),
            SampleFormat::F32 => scale::<f32>(buffer, gain),
            SampleFormat::F64 => scale::<f64>(buffer, gain),
        }
    }
}

fn scale<T: Sample>(buffer: &mut Buffer, gain: f64) {
    if let Some(samples) = buffer.samples_mut::<T>() {
        for sample in samples {
            *sample = T::from_f64(sample.to_f64() * gain);
        }
    }
}

impl StageLogic for GainStage {
    fn process(&mut self, ctx: &mut StageContext<'_>) {
        if self.input.is_none() {
            self.input = ctx.sink("input");
        }
        if self.out.is_none() {
            self.out = ctx.source("out");
        }
        let (Some(input), Some(out)) = (self.input.clone(), self.out.clone()) else {
            debug!("gain stage: ports \"input\"/\"out\" missing");
            return;
        };

        match ctx.pull(&mut *self, &input) {
            Ok(mut buffer) => {
                self.apply(&mut buffer);
                ctx.push(&out, buffer);
            }
            Err(PullError::Cancelled) => debug!("gain stage: pull cancelled"),
            Err(PullError::BufferQueueEmpty) => {
                // Producteur en retard : rien à transformer ce cycle.
            }
            Err(err) => debug!("gain stage: pull error: {err}"),
        }
    }

    fn reconfigure_input_format(&mut self, _sink: &Sink, format: &BufferFormat) -> bool {
        // Le gain est indifférent au format : tout format valide passe.
        format.is_valid()
    }
}

// ============================================================================
// Tests
// ============================================================================
