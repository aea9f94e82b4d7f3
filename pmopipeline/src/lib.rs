#![doc = r#"
PMOPipeline - Runtime de pipeline audio temps réel

Cette crate fournit un graphe orienté de stages de traitement à travers
lequel des buffers PCM circulent des producteurs (décodeurs, générateurs)
vers les consommateurs (sorties plateforme), tirés par l'horloge du
consommateur terminal.

# Architecture

Le cœur est le runtime stage/port : chaque paire (Source, Sink) liée forme
un lien un-à-un portant une file SPSC bornée, le mode de synchronicité
résolu au `play`, et la négociation de format bit-exacte. Un stage résolu
asynchrone reçoit son propre thread et sa propre horloge, abonnée au
provider du backend ; un stage synchrone s'exécute sur le thread de son
consommateur, pendant le pull.

## Pipeline type

```text
SineSource → GainStage → NullOutput (ou CpalOutput)
     ↑ pool      ↑ in-place       ↓ ticks
  de buffers    sur le flux   ClockProvider
```

Les buffers viennent de pools par stage ([`BufferPool`]) et y retournent
au drop de leur handle ([`ManagedBuffer`]) : aucune allocation sur le
chemin du callback audio, attente bornée sur le chemin de contrôle.

# Exemple

```no_run
use pmopipeline::outputs::NullOutput;
use pmopipeline::{Pipeline, Stage};

let output = NullOutput::new();
let provider = output.provider();
let stats = output.stats();

let stage = Stage::new("output", output);
stage.add_sink("input").unwrap();
// ... lier un producteur sur "input", insérer les stages ...

let pipeline = Pipeline::new();
pipeline.add_stage(stage);
pipeline.activate();
pipeline.play();

// Le driver cadence le pipeline en publiant le temps écoulé.
provider.publish(0.010);

pipeline.deactivate();
assert!(stats.buffers() <= 1);
```
"#]

mod buffer;
mod buffer_format;
mod buffer_length;
pub mod channels;
mod clock;
mod clock_provider;
pub mod conversions;
pub mod events;
mod pipeline;
mod pool;
mod port;
mod queue;
mod raw_buffer;
mod sample_types;
pub mod stage;

pub mod outputs;

pub use buffer::{Buffer, SampleStore};
pub use buffer_format::BufferFormat;
pub use buffer_length::BufferLength;
pub use channels::{Channel, ChannelSet};
pub use clock::{Clock, ClockObserver};
pub use clock_provider::{ClockCapabilities, ClockError, ClockProvider};
pub use events::{Message, MessageBus, MessageBusHandle, MessageKind};
pub use pipeline::Pipeline;
pub use pool::{BufferPool, ManagedBuffer};
pub use port::{PullError, SchedulingMode, Sink, Source, SynchronicityMode};
pub use queue::BufferQueue;
pub use raw_buffer::{RawBuffer, RawStorage};
pub use sample_types::{Sample, SampleFormat, I24};
pub use stage::{
    LinkError, Stage, StageContext, StageError, StageLogic, StageStatus, PROCESS_MORE,
};
