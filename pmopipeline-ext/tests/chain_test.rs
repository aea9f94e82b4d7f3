//! Tests d'intégration du runtime : chaînes complètes de stages
//!
//! Monte des graphes sinusoïde → gain → sortie nulle et vérifie les
//! comportements de bout en bout : résolution de synchronicité, cadence
//! un buffer par tick, remplacement à chaud, renégociation de format,
//! underrun et arrêt d'horloge en vol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pmopipeline::outputs::{NullOutput, OutputStats};
use pmopipeline::{
    BufferFormat, BufferLength, BufferPool, ChannelSet, ClockCapabilities, ClockProvider, Message,
    MessageKind, Pipeline, PullError, SampleFormat, SchedulingMode, Sink, Source, Stage,
    StageContext, StageLogic, SynchronicityMode,
};
use pmopipeline_ext::{linear_to_db, GainStage, SineSource};

const TICK_SEC: f64 = 512.0 / 48_000.0;

/// `RUST_LOG=debug cargo test -- --nocapture` pour suivre le runtime
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn stereo_48k() -> BufferFormat {
    BufferFormat::new(ChannelSet::STEREO, 48_000)
}

/// Attend qu'une condition devienne vraie, avec timeout
fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Publie un tick et attend que la sortie l'ait consommé
fn tick_and_wait(provider: &ClockProvider, stats: &OutputStats, expected: u64) {
    provider.publish(TICK_SEC);
    assert!(
        wait_until(|| stats.buffers() >= expected, Duration::from_secs(2)),
        "output did not consume buffer {expected} (got {})",
        stats.buffers()
    );
}

// ============================================================================
// S1 : chaîne synchrone source → gain → sortie
// ============================================================================

#[test]
fn test_sync_chain_one_buffer_per_tick() {
    init_logging();
    let source_stage = Stage::new("source", SineSource::new(stereo_48k(), 512, 440.0));
    let source_out = source_stage.add_source("out").unwrap();

    let gain_stage = Stage::new("gain", GainStage::new(linear_to_db(0.5)));
    let gain_in = gain_stage.add_sink("input").unwrap();
    let gain_out = gain_stage.add_source("out").unwrap();

    let output = NullOutput::new();
    let stats = output.stats();
    let provider = output.provider();
    let output_stage = Stage::new("output", output);
    let output_in = output_stage.add_sink("input").unwrap();

    Stage::link(&source_out, &gain_in).unwrap();
    Stage::link(&gain_out, &output_in).unwrap();

    let pipeline = Pipeline::new();
    pipeline.add_stage(source_stage);
    pipeline.add_stage(gain_stage);
    pipeline.add_stage(output_stage);

    assert!(pipeline.activate());
    assert!(pipeline.play());

    // Toute la chaîne amont est résolue synchrone : elle s'exécute sur le
    // thread de la sortie, pendant ses pulls.
    assert_eq!(
        source_out.link_synchronicity(),
        SynchronicityMode::Synchronous
    );
    assert_eq!(gain_out.link_synchronicity(), SynchronicityMode::Synchronous);

    for i in 1..=10 {
        tick_and_wait(&provider, &stats, i);
    }

    assert_eq!(stats.buffers(), 10);
    assert_eq!(stats.frames(), 10 * 512);

    assert!(pipeline.stop());
    assert!(pipeline.deactivate());
}

// ============================================================================
// S2 : sink forcé asynchrone
// ============================================================================

#[test]
fn test_force_asynchronous_spawns_producer_thread() {
    let source_stage = Stage::new("source", SineSource::new(stereo_48k(), 512, 440.0));
    let source_out = source_stage.add_source("out").unwrap();

    let gain_stage = Stage::new("gain", GainStage::new(0.0));
    let gain_in = gain_stage.add_sink("input").unwrap();
    let gain_out = gain_stage.add_source("out").unwrap();

    let output = NullOutput::new();
    let stats = output.stats();
    let provider = output.provider();
    let output_stage = Stage::new("output", output);
    let output_in = output_stage.add_sink("input").unwrap();
    // La sortie force son producteur en asynchrone, avant le link.
    output_in.set_scheduling(SchedulingMode::ForceAsynchronous);

    Stage::link(&source_out, &gain_in).unwrap();
    Stage::link(&gain_out, &output_in).unwrap();

    let pipeline = Pipeline::new();
    pipeline.add_stage(source_stage);
    pipeline.add_stage(gain_stage);
    pipeline.add_stage(output_stage);

    assert!(pipeline.activate());
    assert!(pipeline.play());

    // Le gain tourne en asynchrone (son sink aval le force) ; la source
    // reste synchrone et s'exécute sur le thread du gain.
    assert_eq!(
        gain_out.link_synchronicity(),
        SynchronicityMode::Asynchronous
    );
    assert_eq!(
        source_out.link_synchronicity(),
        SynchronicityMode::Synchronous
    );

    for i in 1..=10 {
        tick_and_wait(&provider, &stats, i);
    }

    // Cadence respectée malgré le découplage : un buffer par tick, au
    // retard de file près.
    let consumed = stats.buffers();
    assert!(
        (10..=12).contains(&consumed),
        "unexpected buffer count: {consumed}"
    );

    assert!(pipeline.stop());
    assert!(pipeline.deactivate());
}

// ============================================================================
// S3 : remplacement à chaud du producteur
// ============================================================================

#[test]
fn test_hot_swap_producer() {
    init_logging();
    let source_a = Stage::new("source-a", SineSource::new(stereo_48k(), 512, 440.0));
    let out_a = source_a.add_source("out").unwrap();

    let gain_stage = Stage::new("gain", GainStage::new(0.0));
    let gain_in = gain_stage.add_sink("input").unwrap();
    let gain_out = gain_stage.add_source("out").unwrap();

    let output = NullOutput::new();
    let stats = output.stats();
    let provider = output.provider();
    let output_stage = Stage::new("output", output);
    let output_in = output_stage.add_sink("input").unwrap();

    Stage::link(&out_a, &gain_in).unwrap();
    Stage::link(&gain_out, &output_in).unwrap();

    source_a.activate(None).unwrap();
    gain_stage.activate(None).unwrap();
    output_stage.activate(None).unwrap();
    source_a.play(&provider).unwrap();
    gain_stage.play(&provider).unwrap();
    output_stage.play(&provider).unwrap();

    for i in 1..=5 {
        tick_and_wait(&provider, &stats, i);
    }
    // Cinquième buffer : timestamp = 4 × 512 / 48000
    let before_swap = stats.last_timestamp_sec();
    assert!((before_swap - 4.0 * TICK_SEC).abs() < 1e-9);

    // Nouveau producteur, prêt avant l'échange.
    let source_b = Stage::new("source-b", SineSource::new(stereo_48k(), 512, 880.0));
    let out_b = source_b.add_source("out").unwrap();
    source_b.activate(None).unwrap();
    source_b.play(&provider).unwrap();

    Stage::replace(&out_a, &out_b, &gain_in).unwrap();
    assert!(!out_a.is_linked());
    assert!(out_b.is_linked());

    // Le premier buffer après l'échange vient du nouveau producteur : son
    // timestamp repart de zéro.
    tick_and_wait(&provider, &stats, 6);
    assert!(stats.last_timestamp_sec() < TICK_SEC);

    for i in 7..=10 {
        tick_and_wait(&provider, &stats, i);
    }
    // Aucun buffer livré deux fois : le compte reste exact.
    assert_eq!(stats.buffers(), 10);

    output_stage.stop();
    gain_stage.stop();
    source_b.stop();
    source_a.stop();
}

// ============================================================================
// S4 : changement de format en cours de flux
// ============================================================================

/// Source qui change de taux d'échantillonnage après N buffers
struct SwitchingSource {
    pool_48k: BufferPool,
    pool_44k: BufferPool,
    sent: u32,
    switch_after: u32,
    out: Option<Source>,
}

impl SwitchingSource {
    fn new(switch_after: u32) -> Self {
        SwitchingSource {
            pool_48k: BufferPool::new(
                SampleFormat::F32,
                BufferFormat::new(ChannelSet::STEREO, 48_000),
                BufferLength::Frames(128),
            ),
            pool_44k: BufferPool::new(
                SampleFormat::F32,
                BufferFormat::new(ChannelSet::STEREO, 44_100),
                BufferLength::Frames(128),
            ),
            sent: 0,
            switch_after,
            out: None,
        }
    }
}

impl StageLogic for SwitchingSource {
    fn process(&mut self, ctx: &mut StageContext<'_>) {
        if self.out.is_none() {
            self.out = ctx.source("out");
        }
        let Some(out) = self.out.clone() else { return };

        let pool = if self.sent < self.switch_after {
            &self.pool_48k
        } else {
            &self.pool_44k
        };
        let mut buffer = pool.acquire();
        let frames = buffer.frames();
        buffer.fill_silence(frames);
        ctx.push(&out, buffer);
        self.sent += 1;
    }

    fn reconfigure_input_format(&mut self, _sink: &Sink, _format: &BufferFormat) -> bool {
        true
    }
}

/// Sortie de test qui journalise les renégociations et les pulls
struct RecordingSink {
    provider: Arc<ClockProvider>,
    reconfigures: Arc<Mutex<Vec<BufferFormat>>>,
    accept: Arc<AtomicBool>,
    pulls: Arc<Mutex<Vec<Result<BufferFormat, PullError>>>>,
    input: Option<Sink>,
}

impl RecordingSink {
    fn new() -> Self {
        RecordingSink {
            provider: Arc::new(ClockProvider::new(
                ClockCapabilities::new(1_000_000, 1_000_000_000),
                10_000_000,
            )),
            reconfigures: Arc::new(Mutex::new(Vec::new())),
            accept: Arc::new(AtomicBool::new(true)),
            pulls: Arc::new(Mutex::new(Vec::new())),
            input: None,
        }
    }
}

impl StageLogic for RecordingSink {
    fn process(&mut self, ctx: &mut StageContext<'_>) {
        if self.input.is_none() {
            self.input = ctx.sink("input");
        }
        let Some(input) = self.input.clone() else { return };
        if !input.is_linked() {
            return;
        }

        let result = ctx.pull(&mut *self, &input).map(|buffer| buffer.format());
        self.pulls.lock().unwrap().push(result);
    }

    fn reconfigure_input_format(&mut self, _sink: &Sink, format: &BufferFormat) -> bool {
        self.reconfigures.lock().unwrap().push(*format);
        self.accept.load(Ordering::Acquire)
    }

    fn clock_provider(&self) -> Option<Arc<ClockProvider>> {
        Some(Arc::clone(&self.provider))
    }
}

#[test]
fn test_format_change_renegotiates_once() {
    let source_stage = Stage::new("switching", SwitchingSource::new(5));
    let source_out = source_stage.add_source("out").unwrap();

    let sink_logic = RecordingSink::new();
    let provider = sink_logic.provider.clone();
    let reconfigures = sink_logic.reconfigures.clone();
    let pulls = sink_logic.pulls.clone();
    let sink_stage = Stage::new("recording", sink_logic);
    let sink_in = sink_stage.add_sink("input").unwrap();

    Stage::link(&source_out, &sink_in).unwrap();

    source_stage.activate(None).unwrap();
    sink_stage.activate(None).unwrap();
    source_stage.play(&provider).unwrap();
    sink_stage.play(&provider).unwrap();

    let tick = |n: usize| {
        provider.publish(0.010);
        assert!(wait_until(
            || pulls.lock().unwrap().len() >= n,
            Duration::from_secs(2)
        ));
    };

    // Cinq buffers à 48 kHz : une seule négociation (la première)
    for i in 1..=5 {
        tick(i);
    }
    assert_eq!(reconfigures.lock().unwrap().len(), 1);
    assert_eq!(
        sink_in.negotiated_format(),
        Some(BufferFormat::new(ChannelSet::STEREO, 48_000))
    );

    // Sixième buffer à 44,1 kHz : exactement une négociation de plus
    tick(6);
    {
        let reconfigures = reconfigures.lock().unwrap();
        assert_eq!(reconfigures.len(), 2);
        assert_eq!(reconfigures[1].sample_rate(), 44_100);
    }
    assert_eq!(
        sink_in.negotiated_format(),
        Some(BufferFormat::new(ChannelSet::STEREO, 44_100))
    );
    {
        let pulls = pulls.lock().unwrap();
        assert!(pulls[5].is_ok());
    }

    sink_stage.stop();
    source_stage.stop();
}

#[test]
fn test_format_change_refused_keeps_last_format() {
    let source_stage = Stage::new("switching", SwitchingSource::new(2));
    let source_out = source_stage.add_source("out").unwrap();

    let sink_logic = RecordingSink::new();
    let provider = sink_logic.provider.clone();
    let accept = sink_logic.accept.clone();
    let pulls = sink_logic.pulls.clone();
    let sink_stage = Stage::new("recording", sink_logic);
    let sink_in = sink_stage.add_sink("input").unwrap();

    Stage::link(&source_out, &sink_in).unwrap();

    source_stage.activate(None).unwrap();
    sink_stage.activate(None).unwrap();
    source_stage.play(&provider).unwrap();
    sink_stage.play(&provider).unwrap();

    let tick = |n: usize| {
        provider.publish(0.010);
        assert!(wait_until(
            || pulls.lock().unwrap().len() >= n,
            Duration::from_secs(2)
        ));
    };

    tick(1);
    tick(2);
    let negotiated = sink_in.negotiated_format();
    assert_eq!(
        negotiated,
        Some(BufferFormat::new(ChannelSet::STEREO, 48_000))
    );

    // Refuser le format suivant : le pull échoue, le format négocié reste
    accept.store(false, Ordering::Release);
    tick(3);
    {
        let pulls = pulls.lock().unwrap();
        assert_eq!(pulls[2], Err(PullError::UnsupportedFormat));
    }
    assert_eq!(
        sink_in.negotiated_format(),
        Some(BufferFormat::new(ChannelSet::STEREO, 48_000))
    );

    sink_stage.stop();
    source_stage.stop();
}

// ============================================================================
// S5 : fin de flux et underrun
// ============================================================================

#[test]
fn test_underrun_and_end_of_stream() {
    // Source bornée : un seul buffer (256 frames) marqué fin de flux.
    let source_stage = Stage::new(
        "source",
        SineSource::new(stereo_48k(), 512, 440.0).with_frame_limit(256),
    );
    let source_out = source_stage.add_source("out").unwrap();

    let output = NullOutput::non_blocking();
    let stats = output.stats();
    let provider = output.provider();
    let output_stage = Stage::new("output", output);
    let output_in = output_stage.add_sink("input").unwrap();
    output_in.set_scheduling(SchedulingMode::ForceAsynchronous);

    Stage::link(&source_out, &output_in).unwrap();

    let pipeline = Pipeline::new();
    let saw_eos = Arc::new(AtomicBool::new(false));
    {
        let saw_eos = saw_eos.clone();
        pipeline
            .message_bus()
            .subscribe(MessageKind::EndOfStream, move |message| {
                assert_eq!(*message, Message::EndOfStream);
                saw_eos.store(true, Ordering::Release);
            });
    }
    pipeline.add_stage(source_stage);
    pipeline.add_stage(output_stage);

    assert!(pipeline.activate());
    assert!(pipeline.play());

    // Le consommateur tire plus vite que le producteur ne produit : les
    // ticks au-delà du flux comptent des underruns, sans panique.
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline
        && !(stats.saw_end_of_stream() && stats.underruns() >= 2 && saw_eos.load(Ordering::Acquire))
    {
        provider.publish(0.010);
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(stats.buffers(), 1);
    assert_eq!(stats.frames(), 256);
    assert!(stats.saw_end_of_stream());
    assert!(stats.underruns() >= 2);
    assert!(saw_eos.load(Ordering::Acquire));

    assert!(pipeline.stop());
    assert!(pipeline.deactivate());
}

#[test]
fn test_try_pull_requires_asynchronous_link() {
    // Lien synchrone + sortie non bloquante : try_pull est un refus
    // propre, rien n'est consommé.
    let source_stage = Stage::new("source", SineSource::new(stereo_48k(), 512, 440.0));
    let source_out = source_stage.add_source("out").unwrap();

    let output = NullOutput::non_blocking();
    let stats = output.stats();
    let provider = output.provider();
    let output_stage = Stage::new("output", output);
    let output_in = output_stage.add_sink("input").unwrap();

    Stage::link(&source_out, &output_in).unwrap();

    source_stage.activate(None).unwrap();
    output_stage.activate(None).unwrap();
    source_stage.play(&provider).unwrap();
    output_stage.play(&provider).unwrap();

    provider.publish(0.010);
    std::thread::sleep(Duration::from_millis(50));

    assert_eq!(stats.buffers(), 0);
    assert_eq!(stats.underruns(), 0);

    output_stage.stop();
    source_stage.stop();
}

// ============================================================================
// S6 : arrêt d'horloge en vol
// ============================================================================

#[test]
fn test_clock_stop_mid_flight_is_isolated() {
    let source_stage = Stage::new("source", SineSource::new(stereo_48k(), 512, 440.0));
    let source_out = source_stage.add_source("out").unwrap();

    let gain_stage = Stage::new("gain", GainStage::new(0.0));
    let gain_in = gain_stage.add_sink("input").unwrap();
    let gain_out = gain_stage.add_source("out").unwrap();
    gain_in.set_scheduling(SchedulingMode::ForceAsynchronous);

    let output = NullOutput::new();
    let provider = output.provider();
    let output_stage = Stage::new("output", output);
    let output_in = output_stage.add_sink("input").unwrap();
    output_in.set_scheduling(SchedulingMode::ForceAsynchronous);

    Stage::link(&source_out, &gain_in).unwrap();
    Stage::link(&gain_out, &output_in).unwrap();

    // Trois stages asynchrones : source, gain et sortie.
    source_stage.activate(None).unwrap();
    gain_stage.activate(None).unwrap();
    output_stage.activate(None).unwrap();
    source_stage.play(&provider).unwrap();
    gain_stage.play(&provider).unwrap();
    output_stage.play(&provider).unwrap();

    assert!(source_stage.is_asynchronous());
    assert!(gain_stage.is_asynchronous());
    assert!(output_stage.is_asynchronous());

    provider.publish(0.010);
    std::thread::sleep(Duration::from_millis(50));

    // Arrêter l'horloge du gain seulement : son thread sort proprement,
    // les autres stages ne sont pas affectés.
    gain_stage.clock().unwrap().stop();
    std::thread::sleep(Duration::from_millis(50));

    assert_eq!(source_stage.status(), pmopipeline::StageStatus::Playing);
    assert_eq!(output_stage.status(), pmopipeline::StageStatus::Playing);

    // L'arrêt complet ne bloque pas, même avec un thread déjà sorti.
    output_stage.stop();
    gain_stage.stop();
    source_stage.stop();

    assert_eq!(gain_stage.status(), pmopipeline::StageStatus::Activated);
}

// ============================================================================
// Divers : le gain de la chaîne S1 est bien appliqué
// ============================================================================

/// Sortie qui mesure la crête du signal reçu
struct PeakSink {
    provider: Arc<ClockProvider>,
    peak: Arc<Mutex<f32>>,
    count: Arc<Mutex<usize>>,
    input: Option<Sink>,
}

impl PeakSink {
    fn new() -> Self {
        PeakSink {
            provider: Arc::new(ClockProvider::new(
                ClockCapabilities::new(1_000_000, 1_000_000_000),
                10_000_000,
            )),
            peak: Arc::new(Mutex::new(0.0)),
            count: Arc::new(Mutex::new(0)),
            input: None,
        }
    }
}

impl StageLogic for PeakSink {
    fn process(&mut self, ctx: &mut StageContext<'_>) {
        if self.input.is_none() {
            self.input = ctx.sink("input");
        }
        let Some(input) = self.input.clone() else { return };

        if let Ok(buffer) = ctx.pull(&mut *self, &input) {
            if let Some(samples) = buffer.samples::<f32>() {
                let mut peak = self.peak.lock().unwrap();
                for sample in samples {
                    *peak = peak.max(sample.abs());
                }
            }
            *self.count.lock().unwrap() += 1;
        }
    }

    fn reconfigure_input_format(&mut self, _sink: &Sink, format: &BufferFormat) -> bool {
        format.is_valid()
    }

    fn clock_provider(&self) -> Option<Arc<ClockProvider>> {
        Some(Arc::clone(&self.provider))
    }
}

#[test]
fn test_gain_is_applied_through_chain() {
    let source_stage = Stage::new(
        "source",
        SineSource::new(stereo_48k(), 512, 440.0).with_amplitude(1.0),
    );
    let source_out = source_stage.add_source("out").unwrap();

    let gain_stage = Stage::new("gain", GainStage::new(linear_to_db(0.5)));
    let gain_in = gain_stage.add_sink("input").unwrap();
    let gain_out = gain_stage.add_source("out").unwrap();

    let sink_logic = PeakSink::new();
    let provider = sink_logic.provider.clone();
    let peak = sink_logic.peak.clone();
    let count = sink_logic.count.clone();
    let sink_stage = Stage::new("peak", sink_logic);
    let sink_in = sink_stage.add_sink("input").unwrap();

    Stage::link(&source_out, &gain_in).unwrap();
    Stage::link(&gain_out, &sink_in).unwrap();

    source_stage.activate(None).unwrap();
    gain_stage.activate(None).unwrap();
    sink_stage.activate(None).unwrap();
    source_stage.play(&provider).unwrap();
    gain_stage.play(&provider).unwrap();
    sink_stage.play(&provider).unwrap();

    for i in 1..=4 {
        provider.publish(TICK_SEC);
        assert!(wait_until(
            || *count.lock().unwrap() >= i,
            Duration::from_secs(2)
        ));
    }

    let peak = *peak.lock().unwrap();
    assert!((0.45..=0.51).contains(&peak), "peak = {peak}");

    sink_stage.stop();
    gain_stage.stop();
    source_stage.stop();
}
