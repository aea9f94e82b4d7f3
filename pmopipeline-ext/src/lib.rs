//! Stages d'extension pour pmopipeline
//!
//! Construits uniquement sur l'API publique de la crate cœur : un
//! générateur sinusoïdal (source de test et de mesure) et un étage de gain
//! en place. Les vrais décodeurs et DSP suivent les mêmes patrons.

mod gain_stage;
mod sine_source;

pub use gain_stage::{db_to_linear, linear_to_db, GainStage};
pub use sine_source::SineSource;
