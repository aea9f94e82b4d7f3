//! Bus de messages du pipeline
//!
//! File multi-producteur / consommateur unique : les stages publient sans
//! attente (insertion CAS en tête d'une pile chaînée), un thread de
//! dispatch draine la pile et invoque les handlers abonnés par type de
//! message. Le mutex des abonnés n'est tenu que pendant l'enregistrement
//! et l'invocation des handlers, jamais pendant une publication.

use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

/// Messages émis sur le bus
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Erreur d'un stage ou d'un callback
    Error(String),
    /// Avertissement non fatal
    Warning(String),
    /// Message informatif
    Trace(String),
    /// Changement de durée du flux, en secondes
    Duration(f64),
    /// Position de lecture, en secondes
    Progress(f64),
    /// Fin de flux atteinte sur toutes les sources
    EndOfStream,
    /// L'horloge pilote a été perdue
    ClockLost,
}

/// Discriminant de [`Message`], clé d'abonnement
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Error,
    Warning,
    Trace,
    Duration,
    Progress,
    EndOfStream,
    ClockLost,
}

impl Message {
    /// Type du message
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Error(_) => MessageKind::Error,
            Message::Warning(_) => MessageKind::Warning,
            Message::Trace(_) => MessageKind::Trace,
            Message::Duration(_) => MessageKind::Duration,
            Message::Progress(_) => MessageKind::Progress,
            Message::EndOfStream => MessageKind::EndOfStream,
            Message::ClockLost => MessageKind::ClockLost,
        }
    }
}

/// Handler invoqué par le thread de dispatch
pub type MessageHandler = Box<dyn Fn(&Message) + Send>;

struct QueueNode {
    message: Message,
    next: *mut QueueNode,
}

struct BusShared {
    /// Tête de la pile de publication (LIFO, renversée au drain)
    head: AtomicPtr<QueueNode>,
    /// Abonnés, protégés par le mutex de dispatch
    subscribers: Mutex<HashMap<MessageKind, Vec<MessageHandler>>>,
    notification: Condvar,
    stopping: AtomicBool,
}

// SAFETY: les nœuds de la pile ne sont accessibles qu'à travers `head`,
// transférés en bloc au thread de dispatch par un swap atomique.
unsafe impl Send for BusShared {}
unsafe impl Sync for BusShared {}

impl BusShared {
    fn post(&self, message: Message) {
        let node = Box::into_raw(Box::new(QueueNode {
            message,
            next: ptr::null_mut(),
        }));

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: node vient d'être créé et n'est visible de personne.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        self.notification.notify_one();
    }

    /// Détache toute la pile et la retourne en ordre de publication
    fn flush(&self) -> Vec<Message> {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::Acquire);

        let mut messages = Vec::new();
        while !node.is_null() {
            // SAFETY: la pile détachée nous appartient exclusivement.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
            messages.push(boxed.message);
        }

        // La pile sort du CAS en LIFO : renverser pour dispatcher dans
        // l'ordre de publication.
        messages.reverse();
        messages
    }

    fn dispatch(&self, messages: Vec<Message>) {
        let subscribers = self.subscribers.lock().unwrap();
        for message in &messages {
            if let Some(handlers) = subscribers.get(&message.kind()) {
                for handler in handlers {
                    handler(message);
                }
            }
        }
    }

    fn dispatch_loop(&self) {
        info!("message bus dispatch thread started");

        while !self.stopping.load(Ordering::Acquire) {
            let messages = self.flush();

            if messages.is_empty() {
                // La notification peut précéder l'entrée en attente ; le
                // timeout borne la fenêtre perdue.
                let guard = self.subscribers.lock().unwrap();
                let _ = self
                    .notification
                    .wait_timeout(guard, Duration::from_millis(50))
                    .unwrap();
                continue;
            }

            self.dispatch(messages);
        }

        // Drainage final avant de sortir.
        let remaining = self.flush();
        if !remaining.is_empty() {
            debug!("dispatching {} message(s) at shutdown", remaining.len());
            self.dispatch(remaining);
        }

        info!("message bus dispatch thread exiting");
    }
}

impl Drop for BusShared {
    fn drop(&mut self) {
        // Libère les messages jamais consommés.
        let _ = self.flush();
    }
}

/// Bus de messages du pipeline
///
/// Possède le thread de dispatch ; [`handle`](MessageBus::handle) fournit
/// aux stages un émetteur clonable léger.
pub struct MessageBus {
    shared: Arc<BusShared>,
    dispatch_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        MessageBus {
            shared: Arc::new(BusShared {
                head: AtomicPtr::new(ptr::null_mut()),
                subscribers: Mutex::new(HashMap::new()),
                notification: Condvar::new(),
                stopping: AtomicBool::new(false),
            }),
            dispatch_thread: Mutex::new(None),
        }
    }

    /// Démarre le thread de dispatch
    pub fn start(&self) {
        let mut thread_slot = self.dispatch_thread.lock().unwrap();
        if thread_slot.is_some() {
            return;
        }

        self.shared.stopping.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        *thread_slot = Some(thread::spawn(move || shared.dispatch_loop()));
    }

    /// Arrête le thread de dispatch après un drainage final
    pub fn stop(&self) {
        let handle = {
            let mut thread_slot = self.dispatch_thread.lock().unwrap();
            thread_slot.take()
        };

        if let Some(handle) = handle {
            self.shared.stopping.store(true, Ordering::Release);
            self.shared.notification.notify_one();
            let _ = handle.join();
        }
    }

    /// Vrai si le thread de dispatch tourne
    pub fn is_running(&self) -> bool {
        self.dispatch_thread.lock().unwrap().is_some()
    }

    /// Publie un message (sans attente)
    pub fn publish(&self, message: Message) {
        self.shared.post(message);
    }

    /// Abonne un handler à un type de message
    pub fn subscribe<F>(&self, kind: MessageKind, handler: F)
    where
        F: Fn(&Message) + Send + 'static,
    {
        let mut subscribers = self.shared.subscribers.lock().unwrap();
        subscribers.entry(kind).or_default().push(Box::new(handler));
    }

    /// Désabonne tous les handlers d'un type
    pub fn unsubscribe_all(&self, kind: MessageKind) {
        let mut subscribers = self.shared.subscribers.lock().unwrap();
        subscribers.remove(&kind);
    }

    /// Émetteur léger pour les stages
    pub fn handle(&self) -> MessageBusHandle {
        MessageBusHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Émetteur clonable vers un [`MessageBus`]
#[derive(Clone)]
pub struct MessageBusHandle {
    shared: Arc<BusShared>,
}

impl MessageBusHandle {
    /// Publie un message (sans attente)
    pub fn publish(&self, message: Message) {
        self.shared.post(message);
    }
}

// ============================================================================
// Tests
// ============================================================================
