//! Stages de sortie (backends)
//!
//! Un backend est un stage terminal pur consommateur qui fait le pont vers
//! une sortie plateforme et fournit l'horloge du pipeline. Le contrat d'un
//! stage de sortie :
//!
//! - déclarer un unique sink nommé `"input"` ;
//! - posséder un [`ClockProvider`](crate::ClockProvider) dont les
//!   [`ClockCapabilities`](crate::ClockCapabilities) décrivent les cadences
//!   supportées par le périphérique, et y publier le temps écoulé à chaque
//!   callback matériel ;
//! - ouvrir le périphérique dans `begin_playback` ;
//! - dans `process`, tirer de `"input"` et livrer le buffer au
//!   périphérique, en posant le hint
//!   [`PROCESS_MORE`](crate::stage::PROCESS_MORE) tant que le tampon du
//!   périphérique a de la place ;
//! - fermer le périphérique et vider ses tampons dans `stopped_playback`.
//!
//! [`NullOutput`] est la sortie de référence sans matériel (tests,
//! benchmarks) ; la sortie cpal est derrière la feature `cpal-output`.

mod null_output;

pub use null_output::{NullOutput, OutputStats};

#[cfg(feature = "cpal-output")]
mod cpal_output;

#[cfg(feature = "cpal-output")]
pub use cpal_output::CpalOutput;
