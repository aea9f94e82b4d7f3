//! Ports source et sink : le couplage un-à-un entre stages
//!
//! Une [`Source`] et un [`Sink`] liés partagent un état commun : la file
//! SPSC de buffers, le mode de synchronicité résolu au `play`, et la porte
//! de pull (mutex + condvar + drapeau d'annulation). L'état partagé est
//! co-possédé par les deux extrémités (compté par référence) ; les renvois
//! croisés entre ports sont des références faibles, validées sous le mutex
//! d'état des stages pendant les fenêtres de reconfiguration.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::buffer_format::BufferFormat;
use crate::queue::{BufferQueue, DEFAULT_QUEUE_CAPACITY};
use crate::stage::StageShared;

/// Mode de synchronicité d'un lien
///
/// Contrôle comment le producteur s'exécute vis-à-vis du consommateur.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SynchronicityMode {
    /// Le producteur s'exécute sur le thread du consommateur, pendant le pull
    Synchronous,
    /// Le producteur s'exécute sur son propre thread et enfile pour le
    /// consommateur
    Asynchronous,
}

/// Contrainte d'ordonnancement posée sur un sink avant le link
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SchedulingMode {
    /// Laisser la résolution de synchronicité décider
    #[default]
    Default,
    /// Forcer le producteur amont en asynchrone
    ForceAsynchronous,
}

/// Échecs de pull sur un sink
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PullError {
    /// Le pull a été annulé par `cancel_pull` ; le drapeau est réarmé
    #[error("pull cancelled")]
    Cancelled,
    /// Le stage a refusé le nouveau format d'entrée
    #[error("unsupported buffer format")]
    UnsupportedFormat,
    /// Aucun buffer disponible
    #[error("buffer queue empty")]
    BufferQueueEmpty,
    /// `try_pull` n'a de sens que sur un lien asynchrone
    #[error("link is not asynchronous")]
    NotAsynchronous,
}

struct PullGate {
    cancelled: bool,
}

/// État partagé entre les deux extrémités d'un lien
pub(crate) struct LinkShared {
    /// Mode résolu au `play` du stage producteur
    sync_mode: AtomicU8,
    pub(crate) queue: BufferQueue,
    gate: Mutex<PullGate>,
    push_notification: Condvar,
}

const MODE_SYNCHRONOUS: u8 = 0;
const MODE_ASYNCHRONOUS: u8 = 1;

impl LinkShared {
    pub(crate) fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        LinkShared {
            sync_mode: AtomicU8::new(MODE_SYNCHRONOUS),
            queue: BufferQueue::new(capacity),
            gate: Mutex::new(PullGate { cancelled: false }),
            push_notification: Condvar::new(),
        }
    }

    pub(crate) fn synchronicity(&self) -> SynchronicityMode {
        match self.sync_mode.load(Ordering::Acquire) {
            MODE_ASYNCHRONOUS => SynchronicityMode::Asynchronous,
            _ => SynchronicityMode::Synchronous,
        }
    }

    pub(crate) fn set_synchronicity(&self, mode: SynchronicityMode) {
        let raw = match mode {
            SynchronicityMode::Synchronous => MODE_SYNCHRONOUS,
            SynchronicityMode::Asynchronous => MODE_ASYNCHRONOUS,
        };
        self.sync_mode.store(raw, Ordering::Release);
    }

    /// Signale un push au consommateur
    ///
    /// Prend la porte pour ne pas perdre le réveil face à un consommateur
    /// entre son test de file vide et son attente.
    pub(crate) fn notify_push(&self) {
        let _gate = self.gate.lock().unwrap();
        self.push_notification.notify_one();
    }

    /// Attend que la file soit non vide, ou qu'un cancel arrive
    ///
    /// Une annulation est consommée en retournant `Cancelled` : le pull
    /// suivant n'est pas pré-annulé.
    pub(crate) fn wait_not_empty(&self) -> Result<(), PullError> {
        let mut gate = self.gate.lock().unwrap();
        loop {
            if gate.cancelled {
                gate.cancelled = false;
                return Err(PullError::Cancelled);
            }
            if !self.queue.empty() {
                return Ok(());
            }
            gate = self.push_notification.wait(gate).unwrap();
        }
    }

    /// Pose le drapeau d'annulation et réveille un pull en attente
    pub(crate) fn cancel(&self) {
        let mut gate = self.gate.lock().unwrap();
        gate.cancelled = true;
        self.push_notification.notify_one();
    }

    /// Réarme le drapeau d'annulation
    ///
    /// Appelé après l'arrêt d'un stage pour qu'une annulation jamais
    /// consommée ne pré-annule pas la lecture suivante.
    pub(crate) fn clear_cancel(&self) {
        self.gate.lock().unwrap().cancelled = false;
    }
}

pub(crate) struct SourceInner {
    pub(crate) stage: Weak<StageShared>,
    pub(crate) name: String,
    /// État de lien, possédé par la source pour toute sa vie
    pub(crate) shared: Arc<LinkShared>,
    pub(crate) linked_sink: Mutex<Option<Weak<SinkInner>>>,
}

pub(crate) struct SinkInner {
    pub(crate) stage: Weak<StageShared>,
    pub(crate) name: String,
    /// Pointe l'état de lien de la source liée ; `None` hors lien
    pub(crate) shared: Mutex<Option<Arc<LinkShared>>>,
    pub(crate) linked_source: Mutex<Option<Weak<SourceInner>>>,
    /// Dernier format accepté par `reconfigure_input_format`
    pub(crate) negotiated_format: Mutex<Option<BufferFormat>>,
    pub(crate) scheduling: Mutex<SchedulingMode>,
}

/// Extrémité productrice d'un lien
///
/// Handle clonable ; toutes les copies désignent le même port.
#[derive(Clone)]
pub struct Source {
    pub(crate) inner: Arc<SourceInner>,
}

impl Source {
    pub(crate) fn new(stage: Weak<StageShared>, name: String) -> Self {
        Self::with_queue_capacity(stage, name, DEFAULT_QUEUE_CAPACITY)
    }

    pub(crate) fn with_queue_capacity(
        stage: Weak<StageShared>,
        name: String,
        capacity: usize,
    ) -> Self {
        Source {
            inner: Arc::new(SourceInner {
                stage,
                name,
                shared: Arc::new(LinkShared::with_capacity(capacity)),
                linked_sink: Mutex::new(None),
            }),
        }
    }

    /// Capacité de la file du lien porté par cette source
    pub fn queue_capacity(&self) -> usize {
        self.inner.shared.queue.capacity()
    }

    /// Nom du port
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Vrai si le port est lié à un sink
    pub fn is_linked(&self) -> bool {
        self.inner.linked_sink.lock().unwrap().is_some()
    }

    /// Synchronicité du lien, résolue au `play`
    pub fn link_synchronicity(&self) -> SynchronicityMode {
        self.inner.shared.synchronicity()
    }

    pub(crate) fn linked_sink(&self) -> Option<Arc<SinkInner>> {
        self.inner
            .linked_sink
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
    }
}

/// Extrémité consommatrice d'un lien
#[derive(Clone)]
pub struct Sink {
    pub(crate) inner: Arc<SinkInner>,
}

impl Sink {
    pub(crate) fn new(stage: Weak<StageShared>, name: String) -> Self {
        Sink {
            inner: Arc::new(SinkInner {
                stage,
                name,
                shared: Mutex::new(None),
                linked_source: Mutex::new(None),
                negotiated_format: Mutex::new(None),
                scheduling: Mutex::new(SchedulingMode::Default),
            }),
        }
    }

    /// Nom du port
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Vrai si le port est lié à une source
    pub fn is_linked(&self) -> bool {
        self.inner.linked_source.lock().unwrap().is_some()
    }

    /// Contrainte d'ordonnancement du sink
    pub fn scheduling(&self) -> SchedulingMode {
        *self.inner.scheduling.lock().unwrap()
    }

    /// Pose la contrainte d'ordonnancement
    ///
    /// À faire avant le link : la résolution de synchronicité la lit au
    /// `play` du stage amont.
    pub fn set_scheduling(&self, mode: SchedulingMode) {
        *self.inner.scheduling.lock().unwrap() = mode;
    }

    /// Dernier format négocié sur ce sink
    pub fn negotiated_format(&self) -> Option<BufferFormat> {
        *self.inner.negotiated_format.lock().unwrap()
    }

    pub(crate) fn shared(&self) -> Option<Arc<LinkShared>> {
        self.inner.shared.lock().unwrap().clone()
    }

    pub(crate) fn linked_source(&self) -> Option<Arc<SourceInner>> {
        self.inner
            .linked_source
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Oublie le format négocié
    ///
    /// Le prochain buffer tiré repassera par `reconfigure_input_format`.
    pub fn reset_format(&self) {
        *self.inner.negotiated_format.lock().unwrap() = None;
    }

    /// Annule un pull bloqué sur ce sink
    ///
    /// Sans effet sur un lien synchrone.
    pub fn cancel_pull(&self) {
        if let Some(shared) = self.shared() {
            if shared.synchronicity() == SynchronicityMode::Asynchronous {
                shared.cancel();
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
