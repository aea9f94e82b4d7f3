//! Runtime des stages : machine à états, ordonnancement, reconfiguration
//!
//! Un stage est un nœud du graphe qui produit, transforme ou consomme des
//! buffers. L'implémenteur fournit la logique métier via [`StageLogic`]
//! (callbacks de lifecycle + `process`) ; le runtime [`Stage`] possède la
//! machine à états Deactivated→Activated→Playing, les ports, le thread de
//! traitement éventuel et la fenêtre de reconfiguration.
//!
//! # Synchronicité
//!
//! La synchronicité d'un stage est résolue au `play`, quand les liens sont
//! définitifs :
//!
//! - aucun source (pur consommateur) → asynchrone ;
//! - plusieurs sources → asynchrone ;
//! - un seul source dont le sink aval force l'asynchrone, ou dont le stage
//!   aval a plusieurs sinks → asynchrone ;
//! - sinon → synchrone : le stage s'exécute sur le thread du consommateur,
//!   pendant ses pulls.
//!
//! Le mode résolu est écrit dans l'état partagé de chaque lien ; les sinks
//! du stage aval l'y lisent.
//!
//! # Verrouillage
//!
//! Le mutex d'état sérialise les transitions, la reconfiguration et chaque
//! invocation de `process` : aucune mutation structurelle des ports ne peut
//! chevaucher un traitement. L'ordre de prise des fenêtres de
//! reconfiguration est fixe (extrémité sink d'abord, puis source), le même
//! ordre que les chaînes de process synchrones (aval vers amont), ce qui
//! exclut les interblocages sur un graphe acyclique.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;

use tracing::{debug, error, info, warn};

use crate::buffer_format::BufferFormat;
use crate::clock::Clock;
use crate::clock_provider::ClockProvider;
use crate::events::{Message, MessageBus, MessageBusHandle};
use crate::pool::ManagedBuffer;
use crate::port::{
    PullError, SchedulingMode, Sink, Source, SynchronicityMode,
};

/// Drapeau de `process` : le stage peut traiter un buffer de plus
///
/// Posé par un pur consommateur dont le tampon interne a encore de la
/// place ; le runtime enchaîne alors un cycle supplémentaire sans attendre
/// le tick suivant.
pub const PROCESS_MORE: u32 = 1 << 0;

/// États d'un stage
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StageStatus {
    /// Non initialisé ; seuls l'ajout de ports et `activate` sont permis
    Deactivated,
    /// Initialisé, prêt à jouer
    Activated,
    /// En cours de lecture
    Playing,
}

/// Erreurs de lifecycle d'un stage
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("invalid state for {operation}: stage is {status:?}")]
    InvalidState {
        operation: &'static str,
        status: StageStatus,
    },
    #[error("{callback} callback failed")]
    CallbackFailed { callback: &'static str },
}

/// Erreurs des opérations de lien
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("source or sink is already linked")]
    LinkExists,
    #[error("ports are not linked to each other")]
    NotLinked,
    #[error("cannot link two ports of the same stage")]
    SameStage,
    #[error("owning stage no longer exists")]
    StageDropped,
}

/// Logique métier d'un stage
///
/// Sépare ce que le stage **fait** de la plomberie d'orchestration
/// (threads, horloges, fenêtres de reconfiguration), qui appartient au
/// runtime [`Stage`]. Le runtime n'invoque jamais deux callbacks du même
/// stage en parallèle.
pub trait StageLogic: Send + 'static {
    /// Appelé au passage en lecture, avant le premier `process`
    fn begin_playback(&mut self) -> bool {
        true
    }

    /// Appelé à l'arrêt, après le dernier `process`
    fn stopped_playback(&mut self) -> bool {
        true
    }

    /// Un cycle de traitement
    ///
    /// Tire de ses sinks, pousse sur ses sources, via les helpers du
    /// [`StageContext`]. Un producteur synchrone doit produire au plus un
    /// buffer par invocation.
    fn process(&mut self, ctx: &mut StageContext<'_>);

    /// Appelé en fin de fenêtre de reconfiguration si le stage jouait
    fn reconfigure_io(&mut self) -> bool {
        true
    }

    /// Proposition d'un nouveau format d'entrée sur `sink`
    ///
    /// Retourner `false` refuse le format : le pull en cours rend
    /// [`PullError::UnsupportedFormat`] et le dernier format négocié du
    /// sink reste inchangé.
    fn reconfigure_input_format(&mut self, sink: &Sink, format: &BufferFormat) -> bool;

    /// Provider d'horloge du stage, s'il en pilote un (backends)
    fn clock_provider(&self) -> Option<Arc<ClockProvider>> {
        None
    }
}

#[derive(Default)]
pub(crate) struct CycleCounters {
    /// Drapeaux IO du cycle courant
    pub(crate) io_flags: u32,
    /// Nombre de pushes du cycle ayant laissé leur file non pleine
    pub(crate) not_full_reports: u32,
}

pub(crate) struct StageState {
    status: StageStatus,
    logic: Box<dyn StageLogic>,
    /// Horloge effective : possédée en asynchrone, cascadée du consommateur
    /// en synchrone
    current_clock: Option<Arc<Clock>>,
    asynchronous: bool,
    cycle: CycleCounters,
    bus: Option<MessageBusHandle>,
}

pub(crate) struct StageShared {
    id: u64,
    name: String,
    sources: RwLock<Vec<Source>>,
    sinks: RwLock<Vec<Sink>>,
    state: Mutex<StageState>,
    /// Horloge possédée (mode asynchrone), accessible sans le mutex d'état
    /// pour pouvoir débloquer le thread pendant `stop`
    owned_clock: Mutex<Option<Arc<Clock>>>,
    processing_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

fn next_stage_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

impl StageShared {
    fn post_message(state: &StageState, message: Message) {
        if let Some(bus) = &state.bus {
            bus.publish(message);
        }
    }

    /// Un cycle de process sous le mutex d'état
    fn process_once(&self, state: &mut StageState, sources: &[Source], sinks: &[Sink]) {
        let StageState {
            logic,
            current_clock,
            cycle,
            bus,
            ..
        } = state;

        let mut ctx = StageContext {
            stage_name: &self.name,
            sources,
            sinks,
            clock: current_clock.clone(),
            cycle,
            bus: bus.clone(),
        };
        logic.process(&mut ctx);
    }

    /// Boucle de process synchrone : un cycle sur le thread de l'appelant
    ///
    /// Invoquée par le pull aval ; `clock` est l'horloge du consommateur,
    /// mise en cache pour que les pulls de ce stage la cascadent à leur
    /// tour.
    pub(crate) fn sync_process_loop(&self, clock: Option<Arc<Clock>>) {
        let sources = self.sources.read().unwrap();
        let sinks = self.sinks.read().unwrap();
        let mut state = self.state.lock().unwrap();

        if state.status != StageStatus::Playing {
            debug!(
                stage = %self.name,
                "process() attempted on a stage that is not playing"
            );
            return;
        }

        state.current_clock = clock;
        state.cycle.io_flags = 0;
        state.cycle.not_full_reports = 0;
        self.process_once(&mut state, &sources, &sinks);
    }

    /// Un tour de la boucle asynchrone ; retourne (flags, reports, sources)
    fn run_async_cycle(&self) -> (u32, u32, usize) {
        let sources = self.sources.read().unwrap();
        let sinks = self.sinks.read().unwrap();
        let mut state = self.state.lock().unwrap();

        state.cycle.io_flags = 0;
        state.cycle.not_full_reports = 0;
        self.process_once(&mut state, &sources, &sinks);

        (
            state.cycle.io_flags,
            state.cycle.not_full_reports,
            sources.len(),
        )
    }

    fn async_process_loop(self: Arc<Self>, clock: Arc<Clock>) {
        let mut do_buffer_run = false;

        loop {
            if !do_buffer_run && !clock.wait() {
                break;
            }

            let (io_flags, not_full, active_sources) = self.run_async_cycle();

            // Deux cas de buffering supplémentaire : toutes les sources ont
            // signalé de la place pour au moins un buffer de plus, ou un pur
            // consommateur à tampon interne demande un cycle de plus.
            do_buffer_run = (not_full > 0 && not_full as usize == active_sources)
                || ((io_flags & PROCESS_MORE) != 0 && active_sources == 0);
        }

        info!(stage = %self.name, "asynchronous processing thread exiting");
    }

    /// Ouvre une fenêtre de reconfiguration : verrouille l'état et note
    /// l'état d'entrée
    fn begin_reconfiguration(&self) -> ReconfigurationWindow<'_> {
        let state = self.state.lock().unwrap();
        let was_playing = state.status == StageStatus::Playing;
        ReconfigurationWindow { state, was_playing }
    }

    fn should_run_asynchronous(&self, sources: &[Source]) -> bool {
        // Pur consommateur : toujours asynchrone.
        if sources.is_empty() {
            return true;
        }
        // Plusieurs sources : asynchrone.
        if sources.len() > 1 {
            return true;
        }

        let source = &sources[0];
        if let Some(sink) = source.linked_sink() {
            if *sink.scheduling.lock().unwrap() == SchedulingMode::ForceAsynchronous {
                info!(
                    stage = %self.name,
                    sink = %sink.name,
                    "downstream sink forces asynchronous operation"
                );
                return true;
            }

            // Plusieurs sinks sur le stage aval : lien asynchrone.
            if let Some(peer) = sink.stage.upgrade() {
                if peer.sinks.read().unwrap().len() > 1 {
                    return true;
                }
            }
        }

        false
    }
}

/// Fenêtre de reconfiguration ouverte sur un stage
///
/// Tient le mutex d'état : aucun `process` ne peut courir. À la fermeture,
/// si le stage jouait, `reconfigure_io` est invoqué avant de relâcher le
/// mutex.
struct ReconfigurationWindow<'a> {
    state: MutexGuard<'a, StageState>,
    was_playing: bool,
}

impl Drop for ReconfigurationWindow<'_> {
    fn drop(&mut self) {
        if self.was_playing && !self.state.logic.reconfigure_io() {
            warn!("reconfigure_io failed");
            StageShared::post_message(
                &self.state,
                Message::Error("reconfigure_io failed".into()),
            );
        }
    }
}

/// Contexte passé à [`StageLogic::process`]
///
/// Donne accès aux ports du stage, à l'horloge effective du cycle et aux
/// helpers pull/push. Les helpers qui renégocient le format reprennent la
/// logique en paramètre pour pouvoir rappeler le stage pendant le pull.
pub struct StageContext<'a> {
    stage_name: &'a str,
    sources: &'a [Source],
    sinks: &'a [Sink],
    clock: Option<Arc<Clock>>,
    cycle: &'a mut CycleCounters,
    bus: Option<MessageBusHandle>,
}

impl StageContext<'_> {
    /// Ports source du stage
    pub fn sources(&self) -> &[Source] {
        self.sources
    }

    /// Ports sink du stage
    pub fn sinks(&self) -> &[Sink] {
        self.sinks
    }

    /// Cherche un port source par nom
    pub fn source(&self, name: &str) -> Option<Source> {
        self.sources.iter().find(|s| s.name() == name).cloned()
    }

    /// Cherche un port sink par nom
    pub fn sink(&self, name: &str) -> Option<Sink> {
        self.sinks.iter().find(|s| s.name() == name).cloned()
    }

    /// Horloge effective du cycle courant
    pub fn clock(&self) -> Option<&Arc<Clock>> {
        self.clock.as_ref()
    }

    /// Demande un cycle de traitement supplémentaire (pur consommateur)
    pub fn hint_process_more(&mut self) {
        self.cycle.io_flags |= PROCESS_MORE;
    }

    /// Publie un message sur le bus du pipeline
    pub fn post(&self, message: Message) {
        if let Some(bus) = &self.bus {
            bus.publish(message);
        }
    }

    /// Pousse un buffer sur un port source
    ///
    /// Si la file du lien est pleine, le buffer est abandonné avec un
    /// avertissement : cela ne se produit que si le sink aval ne suit pas.
    /// Sur un lien asynchrone, signale le consommateur et comptabilise la
    /// place restante pour la décision de buffering du runtime.
    pub fn push(&mut self, source: &Source, buffer: ManagedBuffer) {
        let shared = &source.inner.shared;

        if shared.queue.push(buffer).is_err() {
            warn!(
                stage = self.stage_name,
                source = source.name(),
                "failed to push buffer: queue full"
            );
            return;
        }

        if shared.synchronicity() == SynchronicityMode::Asynchronous {
            if !shared.queue.full() {
                self.cycle.not_full_reports += 1;
            }
            shared.notify_push();
        }
    }

    /// Tire un buffer d'un port sink
    ///
    /// Sur un lien asynchrone, bloque jusqu'à un buffer ou une annulation.
    /// Sur un lien synchrone, invoque la boucle de process du stage amont
    /// sur ce thread, puis dépile le buffer produit. Si le format du buffer
    /// diffère du dernier format négocié, `reconfigure_input_format` est
    /// appelé entre le dépilage et le retour.
    pub fn pull(
        &mut self,
        logic: &mut dyn StageLogic,
        sink: &Sink,
    ) -> Result<ManagedBuffer, PullError> {
        let Some(shared) = sink.shared() else {
            debug!(
                stage = self.stage_name,
                sink = sink.name(),
                "pull on an unlinked sink"
            );
            return Err(PullError::BufferQueueEmpty);
        };

        match shared.synchronicity() {
            SynchronicityMode::Asynchronous => shared.wait_not_empty()?,
            SynchronicityMode::Synchronous => {
                if let Some(source) = sink.linked_source() {
                    if let Some(stage) = source.stage.upgrade() {
                        stage.sync_process_loop(self.clock.clone());
                    }
                }
            }
        }

        let buffer = shared.queue.pop().ok_or(PullError::BufferQueueEmpty)?;
        self.negotiate(logic, sink, buffer)
    }

    /// Variante non bloquante de [`pull`](Self::pull)
    ///
    /// N'a de sens que sur un lien asynchrone : sur un lien synchrone, on
    /// ne contrôle pas les pulls amont.
    pub fn try_pull(
        &mut self,
        logic: &mut dyn StageLogic,
        sink: &Sink,
    ) -> Result<ManagedBuffer, PullError> {
        let Some(shared) = sink.shared() else {
            return Err(PullError::BufferQueueEmpty);
        };

        if shared.synchronicity() != SynchronicityMode::Asynchronous {
            return Err(PullError::NotAsynchronous);
        }

        let buffer = shared.queue.pop().ok_or(PullError::BufferQueueEmpty)?;
        self.negotiate(logic, sink, buffer)
    }

    /// Annule le pull en attente sur un sink
    pub fn cancel_pull(&self, sink: &Sink) {
        sink.cancel_pull();
    }

    /// Vide la file d'un port source
    pub fn reset_source(&self, source: &Source) {
        source.inner.shared.queue.clear();
    }

    /// Oublie le format négocié d'un sink
    pub fn reset_sink(&self, sink: &Sink) {
        *sink.inner.negotiated_format.lock().unwrap() = None;
    }

    fn negotiate(
        &self,
        logic: &mut dyn StageLogic,
        sink: &Sink,
        buffer: ManagedBuffer,
    ) -> Result<ManagedBuffer, PullError> {
        let format = buffer.format();
        if sink.negotiated_format() != Some(format) {
            if !logic.reconfigure_input_format(sink, &format) {
                warn!(
                    stage = self.stage_name,
                    sink = sink.name(),
                    %format,
                    "input format refused"
                );
                return Err(PullError::UnsupportedFormat);
            }
            *sink.inner.negotiated_format.lock().unwrap() = Some(format);
        }
        Ok(buffer)
    }
}

/// Un stage du pipeline
///
/// Enveloppe une [`StageLogic`] et lui fournit la machine à états, les
/// ports et l'ordonnancement. Détruire un stage en lecture force un `stop`
/// (avec avertissement) ; le destructeur ne laisse jamais un thread en
/// route.
pub struct Stage {
    shared: Arc<StageShared>,
}

impl Stage {
    pub fn new(name: impl Into<String>, logic: impl StageLogic) -> Self {
        Stage {
            shared: Arc::new(StageShared {
                id: next_stage_id(),
                name: name.into(),
                sources: RwLock::new(Vec::new()),
                sinks: RwLock::new(Vec::new()),
                state: Mutex::new(StageState {
                    status: StageStatus::Deactivated,
                    logic: Box::new(logic),
                    current_clock: None,
                    asynchronous: false,
                    cycle: CycleCounters::default(),
                    bus: None,
                }),
                owned_clock: Mutex::new(None),
                processing_thread: Mutex::new(None),
            }),
        }
    }

    /// Nom du stage
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Identifiant stable du stage
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// État courant
    pub fn status(&self) -> StageStatus {
        self.shared.state.lock().unwrap().status
    }

    /// Vrai si le stage a résolu en asynchrone au dernier `play`
    pub fn is_asynchronous(&self) -> bool {
        self.shared.state.lock().unwrap().asynchronous
    }

    /// Horloge effective du stage (possédée ou cascadée)
    pub fn clock(&self) -> Option<Arc<Clock>> {
        self.shared.state.lock().unwrap().current_clock.clone()
    }

    /// Provider d'horloge exposé par la logique (backends)
    pub fn clock_provider(&self) -> Option<Arc<ClockProvider>> {
        self.shared.state.lock().unwrap().logic.clock_provider()
    }

    /// Ajoute un port source ; seulement à l'état `Deactivated`
    pub fn add_source(&self, name: &str) -> Result<Source, StageError> {
        self.check_deactivated("add_source")?;
        let source = Source::new(Arc::downgrade(&self.shared), name.to_string());
        self.shared.sources.write().unwrap().push(source.clone());
        Ok(source)
    }

    /// Ajoute un port source avec une capacité de file spécifique
    ///
    /// La capacité par défaut est de deux buffers : un en vol pendant que
    /// le producteur remplit le suivant.
    pub fn add_source_with_capacity(
        &self,
        name: &str,
        queue_capacity: usize,
    ) -> Result<Source, StageError> {
        self.check_deactivated("add_source")?;
        let source = Source::with_queue_capacity(
            Arc::downgrade(&self.shared),
            name.to_string(),
            queue_capacity,
        );
        self.shared.sources.write().unwrap().push(source.clone());
        Ok(source)
    }

    /// Ajoute un port sink ; seulement à l'état `Deactivated`
    pub fn add_sink(&self, name: &str) -> Result<Sink, StageError> {
        self.check_deactivated("add_sink")?;
        let sink = Sink::new(Arc::downgrade(&self.shared), name.to_string());
        self.shared.sinks.write().unwrap().push(sink.clone());
        Ok(sink)
    }

    fn check_deactivated(&self, operation: &'static str) -> Result<(), StageError> {
        let status = self.status();
        if status != StageStatus::Deactivated {
            warn!(stage = %self.shared.name, operation, "stage must be deactivated");
            return Err(StageError::InvalidState { operation, status });
        }
        Ok(())
    }

    /// Cherche un port source par nom
    pub fn source(&self, name: &str) -> Option<Source> {
        self.shared
            .sources
            .read()
            .unwrap()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    /// Cherche un port sink par nom
    pub fn sink(&self, name: &str) -> Option<Sink> {
        self.shared
            .sinks
            .read()
            .unwrap()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    /// Nombre de ports source
    pub fn source_count(&self) -> usize {
        self.shared.sources.read().unwrap().len()
    }

    /// Nombre de ports sink
    pub fn sink_count(&self) -> usize {
        self.shared.sinks.read().unwrap().len()
    }

    /// Deactivated → Activated
    ///
    /// Le bus de messages, s'il est fourni, recevra les erreurs de
    /// callbacks du stage.
    pub fn activate(&self, bus: Option<&MessageBus>) -> Result<(), StageError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.status != StageStatus::Deactivated {
            return Err(StageError::InvalidState {
                operation: "activate",
                status: state.status,
            });
        }

        state.bus = bus.map(MessageBus::handle);
        state.status = StageStatus::Activated;
        info!(stage = %self.shared.name, "activated");
        Ok(())
    }

    /// Activated → Playing
    ///
    /// Résout la synchronicité, l'écrit dans l'état partagé des sources,
    /// puis appelle `begin_playback`. En mode asynchrone, crée l'horloge du
    /// stage, l'abonne au provider et démarre le thread de traitement.
    pub fn play(&self, provider: &ClockProvider) -> Result<(), StageError> {
        let sources = self.shared.sources.read().unwrap();
        let mut state = self.shared.state.lock().unwrap();

        if state.status != StageStatus::Activated {
            return Err(StageError::InvalidState {
                operation: "play",
                status: state.status,
            });
        }

        let asynchronous = self.shared.should_run_asynchronous(&sources);
        debug!(
            stage = %self.shared.name,
            "stage will run {}",
            if asynchronous { "asynchronously" } else { "synchronously" }
        );

        let mode = if asynchronous {
            SynchronicityMode::Asynchronous
        } else {
            SynchronicityMode::Synchronous
        };
        for source in sources.iter() {
            source.inner.shared.set_synchronicity(mode);
        }

        let clock = if asynchronous {
            let clock = Arc::new(Clock::new());
            provider.register_clock(&clock);
            state.current_clock = Some(Arc::clone(&clock));
            Some(clock)
        } else {
            None
        };
        state.asynchronous = asynchronous;

        // Callback de début de lecture, avant tout traitement de buffers.
        if !state.logic.begin_playback() {
            error!(stage = %self.shared.name, "begin_playback failed");
            StageShared::post_message(
                &state,
                Message::Error(format!("{}: begin_playback failed", self.shared.name)),
            );
            if let Some(clock) = &clock {
                provider.deregister_clock(clock);
            }
            state.current_clock = None;
            return Err(StageError::CallbackFailed {
                callback: "begin_playback",
            });
        }

        if let Some(clock) = clock {
            *self.shared.owned_clock.lock().unwrap() = Some(Arc::clone(&clock));
            clock.start();

            let shared = Arc::clone(&self.shared);
            let handle = thread::spawn(move || shared.async_process_loop(clock));
            *self.shared.processing_thread.lock().unwrap() = Some(handle);
        }

        state.status = StageStatus::Playing;
        info!(stage = %self.shared.name, "playing");
        Ok(())
    }

    /// Playing → Activated
    ///
    /// Arrête l'horloge possédée (le thread de traitement sort de son
    /// `wait`), annule les pulls en attente, joint le thread, puis invoque
    /// `stopped_playback`. Sans effet si le stage ne joue pas.
    pub fn stop(&self) {
        // Tout ce qui débloque le thread se fait hors du mutex d'état : un
        // thread bloqué dans un pull le tient.
        let clock = self.shared.owned_clock.lock().unwrap().take();
        if let Some(clock) = &clock {
            clock.stop();
        }

        {
            let sinks = self.shared.sinks.read().unwrap();
            for sink in sinks.iter() {
                sink.cancel_pull();
            }
        }

        let handle = self.shared.processing_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            debug!(stage = %self.shared.name, "waiting for processing thread to stop");
            let _ = handle.join();
        }

        // Les annulations non consommées ne doivent pas pré-annuler la
        // prochaine lecture.
        {
            let sinks = self.shared.sinks.read().unwrap();
            for sink in sinks.iter() {
                if let Some(shared) = sink.shared() {
                    shared.clear_cancel();
                }
            }
        }

        let mut state = self.shared.state.lock().unwrap();
        if state.status == StageStatus::Playing {
            state.current_clock = None;

            // Callback d'arrêt, après le dernier buffer traité.
            if !state.logic.stopped_playback() {
                StageShared::post_message(
                    &state,
                    Message::Error(format!("{}: stopped_playback failed", self.shared.name)),
                );
            }

            state.status = StageStatus::Activated;
            info!(stage = %self.shared.name, "stopped");
        }
    }

    /// Retour à `Deactivated` ; arrête d'abord la lecture si besoin
    ///
    /// Vide les files des ports source. Le pipeline doit avoir arrêté les
    /// stages aval avant : vider une file suppose son consommateur à
    /// l'arrêt.
    pub fn deactivate(&self) {
        self.stop();

        let sources: Vec<Source> = self.shared.sources.read().unwrap().clone();
        let mut state = self.shared.state.lock().unwrap();
        if state.status == StageStatus::Activated {
            for source in &sources {
                source.inner.shared.queue.clear();
            }
            state.bus = None;
            state.status = StageStatus::Deactivated;
            info!(stage = %self.shared.name, "deactivated");
        }
    }

    // ========================================================================
    // Opérations de lien
    // ========================================================================

    /// Lie une source à un sink
    ///
    /// Échoue si l'une des extrémités est déjà liée. L'attache se fait sous
    /// les fenêtres de reconfiguration des deux stages, extrémité sink
    /// d'abord.
    pub fn link(source: &Source, sink: &Sink) -> Result<(), LinkError> {
        let source_stage = source.inner.stage.upgrade().ok_or(LinkError::StageDropped)?;
        let sink_stage = sink.inner.stage.upgrade().ok_or(LinkError::StageDropped)?;
        if Arc::ptr_eq(&source_stage, &sink_stage) {
            return Err(LinkError::SameStage);
        }

        if source.is_linked() || sink.is_linked() {
            debug!("link refused: source or sink already linked");
            return Err(LinkError::LinkExists);
        }

        {
            let _sink_window = sink_stage.begin_reconfiguration();
            let _source_window = source_stage.begin_reconfiguration();

            *source.inner.linked_sink.lock().unwrap() = Some(Arc::downgrade(&sink.inner));
            *sink.inner.linked_source.lock().unwrap() = Some(Arc::downgrade(&source.inner));
            *sink.inner.shared.lock().unwrap() = Some(Arc::clone(&source.inner.shared));
        }

        info!(
            "linked: {}:{} +-----> {}:{}",
            source_stage.name,
            source.name(),
            sink_stage.name,
            sink.name()
        );
        Ok(())
    }

    /// Délie une paire source/sink
    ///
    /// Échoue si les deux ports ne sont pas liés l'un à l'autre. Les
    /// buffers en vol sont drainés (la file du lien est vidée sous les
    /// fenêtres de reconfiguration).
    pub fn unlink(source: &Source, sink: &Sink) -> Result<(), LinkError> {
        let source_stage = source.inner.stage.upgrade().ok_or(LinkError::StageDropped)?;
        let sink_stage = sink.inner.stage.upgrade().ok_or(LinkError::StageDropped)?;

        if !mutually_linked(source, sink) {
            debug!("unlink refused: ports not linked to each other");
            return Err(LinkError::NotLinked);
        }

        // Un pull bloqué sur ce lien tient le mutex d'état du stage aval et
        // n'aboutira jamais : l'annuler d'abord pour que la fenêtre de
        // reconfiguration devienne prenable.
        sink.cancel_pull();

        {
            let _sink_window = sink_stage.begin_reconfiguration();
            let _source_window = source_stage.begin_reconfiguration();

            *sink.inner.shared.lock().unwrap() = None;
            *source.inner.linked_sink.lock().unwrap() = None;
            *sink.inner.linked_source.lock().unwrap() = None;

            source.inner.shared.queue.clear();
            // Si l'annulation n'a pas été consommée, elle ne doit pas
            // pré-annuler un futur lien sur cet état partagé.
            source.inner.shared.clear_cancel();
        }

        info!(
            "unlinked: {}:{} +-/ /-> {}:{}",
            source_stage.name,
            source.name(),
            sink_stage.name,
            sink.name()
        );
        Ok(())
    }

    /// Remplace à chaud le producteur d'un sink
    ///
    /// Équivalent à unlink+link mais sous une seule fenêtre de
    /// reconfiguration : aucun `process` ne court sur les trois stages
    /// pendant l'échange. `current` doit être lié à `sink`, `next` doit
    /// être libre.
    pub fn replace(current: &Source, next: &Source, sink: &Sink) -> Result<(), LinkError> {
        if Arc::ptr_eq(&current.inner, &next.inner) {
            debug!("replace: source replaced with itself");
            return Ok(());
        }

        let current_stage = current.inner.stage.upgrade().ok_or(LinkError::StageDropped)?;
        let next_stage = next.inner.stage.upgrade().ok_or(LinkError::StageDropped)?;
        let sink_stage = sink.inner.stage.upgrade().ok_or(LinkError::StageDropped)?;

        if !mutually_linked(current, sink) {
            return Err(LinkError::NotLinked);
        }
        if next.is_linked() {
            return Err(LinkError::LinkExists);
        }

        // Même précaution que pour unlink : un pull bloqué sur l'ancien lien
        // attendrait une condition que le nouveau producteur ne signalera
        // jamais.
        sink.cancel_pull();

        let sink_window = sink_stage.begin_reconfiguration();
        let current_window = current_stage.begin_reconfiguration();
        let next_window = next_stage.begin_reconfiguration();

        // Détache l'ancien producteur.
        *current.inner.linked_sink.lock().unwrap() = None;
        current.inner.shared.clear_cancel();

        // Attache le nouveau.
        *sink.inner.shared.lock().unwrap() = Some(Arc::clone(&next.inner.shared));
        *sink.inner.linked_source.lock().unwrap() = Some(Arc::downgrade(&next.inner));
        *next.inner.linked_sink.lock().unwrap() = Some(Arc::downgrade(&sink.inner));

        drop(next_window);
        drop(sink_window);
        drop(current_window);

        info!(
            "relinked: {}:{} +-----> {}:{} <-/ /-+ {}:{}",
            next_stage.name,
            next.name(),
            sink_stage.name,
            sink.name(),
            current_stage.name,
            current.name()
        );
        Ok(())
    }
}

fn mutually_linked(source: &Source, sink: &Sink) -> bool {
    let source_points_at_sink = source
        .linked_sink()
        .is_some_and(|s| Arc::ptr_eq(&s, &sink.inner));
    let sink_points_at_source = sink
        .linked_source()
        .is_some_and(|s| Arc::ptr_eq(&s, &source.inner));
    source_points_at_sink && sink_points_at_source
}

impl Drop for Stage {
    fn drop(&mut self) {
        if self.status() == StageStatus::Playing {
            warn!(
                stage = %self.shared.name,
                "dropping a playing stage; call stop() first. Force stopping."
            );
        }
        self.deactivate();

        // Défait les liens restants pour que les pairs ne pointent pas vers
        // un stage mort.
        let sources: Vec<Source> = self.shared.sources.read().unwrap().clone();
        for source in sources {
            if let Some(sink_inner) = source.linked_sink() {
                let sink = Sink { inner: sink_inner };
                let _ = Stage::unlink(&source, &sink);
            }
        }
        let sinks: Vec<Sink> = self.shared.sinks.read().unwrap().clone();
        for sink in sinks {
            if let Some(source_inner) = sink.linked_source() {
                let source = Source {
                    inner: source_inner,
                };
                let _ = Stage::unlink(&source, &sink);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
