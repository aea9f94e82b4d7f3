//! Horloge de présentation partagée
//!
//! Une [`Clock`] matérialise le temps du pipeline : un driver externe
//! publie des avancées de temps de présentation, et les threads de
//! traitement se bloquent dans [`wait`](Clock::wait) jusqu'à la prochaine
//! avancée. Toutes les durées sont en secondes (f64).

use std::sync::{Arc, Condvar, Mutex, Weak};

struct ClockState {
    started: bool,
    pipeline_time_sec: f64,
    presentation_time_sec: f64,
    delta_time_sec: f64,
    pending_delta_sec: f64,
}

/// Horloge avancée de façon asynchrone par un driver externe
///
/// Invariants :
/// - `delta_time_sec` reflète le dernier retour réussi de `wait()` ;
/// - `pending_delta_sec` est nul hors d'une fenêtre d'avancée ;
/// - les threads bloqués dans `wait()` se réveillent dès que
///   `pending_delta_sec ≠ 0` ou que l'horloge s'arrête.
pub struct Clock {
    state: Mutex<ClockState>,
    advance_notification: Condvar,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            state: Mutex::new(ClockState {
                started: false,
                pipeline_time_sec: 0.0,
                presentation_time_sec: 0.0,
                delta_time_sec: 0.0,
                pending_delta_sec: 0.0,
            }),
            advance_notification: Condvar::new(),
        }
    }

    /// Temps pipeline courant (timestamp du buffer en cours), en secondes
    pub fn pipeline_time_sec(&self) -> f64 {
        self.state.lock().unwrap().pipeline_time_sec
    }

    /// Temps de présentation courant, en secondes
    pub fn presentation_time_sec(&self) -> f64 {
        self.state.lock().unwrap().presentation_time_sec
    }

    /// Delta entre les deux derniers retours de `wait()`
    pub fn delta_time_sec(&self) -> f64 {
        self.state.lock().unwrap().delta_time_sec
    }

    /// Vrai si l'horloge tourne
    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().started
    }

    /// Démarre l'horloge
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        if state.started {
            return;
        }
        state.started = true;
        self.advance_notification.notify_all();
    }

    /// Arrête l'horloge ; tous les `wait()` en cours retournent `false`
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.started {
            return;
        }
        state.started = false;
        self.advance_notification.notify_all();
    }

    /// Recale l'horloge sur le temps `time_sec`
    ///
    /// Pose `pending_delta = time_sec − presentation_time`. Un delta en
    /// attente non consommé est écrasé ; un `wait()` concourant peut
    /// observer l'un ou l'autre des deltas.
    pub fn reset(&self, time_sec: f64) {
        let mut state = self.state.lock().unwrap();
        state.pending_delta_sec = time_sec - state.presentation_time_sec;
        self.advance_notification.notify_all();
    }

    /// Avance le temps de présentation
    ///
    /// Le prochain `wait()` consommera ce delta. Réveille les threads
    /// bloqués.
    pub fn advance_presentation(&self, delta_sec: f64) {
        let mut state = self.state.lock().unwrap();
        state.pending_delta_sec = delta_sec;
        self.advance_notification.notify_all();
    }

    /// Avance le temps pipeline (aucun réveil)
    pub fn advance_pipeline(&self, delta_sec: f64) {
        let mut state = self.state.lock().unwrap();
        state.pipeline_time_sec += delta_sec;
    }

    /// Attend la prochaine avancée de l'horloge
    ///
    /// Bloque tant que `pending_delta == 0` et que l'horloge tourne, puis
    /// consomme le delta en attente (s'il y en a un) et retourne l'état de
    /// marche de l'horloge.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap();

        while state.pending_delta_sec == 0.0 && state.started {
            state = self.advance_notification.wait(state).unwrap();
        }

        state.delta_time_sec = state.pending_delta_sec;
        state.presentation_time_sec += state.pending_delta_sec;
        state.pending_delta_sec = 0.0;

        state.started
    }

    /// Fabrique un observateur en lecture seule de cette horloge
    pub fn make_observer(self: &Arc<Self>) -> ClockObserver {
        ClockObserver {
            clock: Arc::downgrade(self),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Projection en lecture seule d'une [`Clock`]
///
/// Les opérations de mutation sont des no-ops par contrat ; les lectures
/// retournent 0.0 si l'horloge de référence a disparu.
pub struct ClockObserver {
    clock: Weak<Clock>,
}

impl ClockObserver {
    pub fn pipeline_time_sec(&self) -> f64 {
        self.clock
            .upgrade()
            .map(|c| c.pipeline_time_sec())
            .unwrap_or(0.0)
    }

    pub fn presentation_time_sec(&self) -> f64 {
        self.clock
            .upgrade()
            .map(|c| c.presentation_time_sec())
            .unwrap_or(0.0)
    }

    pub fn delta_time_sec(&self) -> f64 {
        self.clock
            .upgrade()
            .map(|c| c.delta_time_sec())
            .unwrap_or(0.0)
    }

    /// No-op : un observateur ne pilote pas l'horloge
    pub fn start(&self) {}

    /// No-op : un observateur ne pilote pas l'horloge
    pub fn stop(&self) {}

    /// No-op : un observateur ne pilote pas l'horloge
    pub fn advance_presentation(&self, _delta_sec: f64) {}

    /// No-op : un observateur ne pilote pas l'horloge
    pub fn advance_pipeline(&self, _delta_sec: f64) {}
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_consumes_pending_delta() {
        let clock = Clock::new();
        clock.start();
        clock.advance_presentation(0.010);

        assert!(clock.wait());
        assert_eq!(clock.delta_time_sec(), 0.010);
        assert_eq!(clock.presentation_time_sec(), 0.010);
        // Le delta est consommé : pending est nul
        clock.stop();
        assert!(!clock.wait());
        assert_eq!(clock.presentation_time_sec(), 0.010);
    }

    #[test]
    fn test_wait_wakes_on_advance() {
        let clock = Arc::new(Clock::new());
        clock.start();

        let waiter = {
            let clock = Arc::clone(&clock);
            thread::spawn(move || clock.wait())
        };

        thread::sleep(Duration::from_millis(20));
        clock.advance_presentation(0.005);

        assert!(waiter.join().unwrap());
        assert_eq!(clock.delta_time_sec(), 0.005);
    }

    #[test]
    fn test_wait_wakes_on_stop() {
        let clock = Arc::new(Clock::new());
        clock.start();

        let waiter = {
            let clock = Arc::clone(&clock);
            thread::spawn(move || clock.wait())
        };

        thread::sleep(Duration::from_millis(20));
        clock.stop();

        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_wait_does_not_block_when_stopped() {
        let clock = Clock::new();
        assert!(!clock.wait());
    }

    #[test]
    fn test_reset_computes_pending_from_presentation() {
        let clock = Clock::new();
        clock.start();
        clock.advance_presentation(1.0);
        assert!(clock.wait());

        clock.reset(0.25);
        assert!(clock.wait());
        assert_eq!(clock.presentation_time_sec(), 0.25);
        assert_eq!(clock.delta_time_sec(), -0.75);
    }

    #[test]
    fn test_advance_pipeline_no_wake() {
        let clock = Clock::new();
        clock.advance_pipeline(0.5);
        assert_eq!(clock.pipeline_time_sec(), 0.5);
        // Pas de delta de présentation : wait ne consomme rien
        assert!(!clock.wait());
        assert_eq!(clock.presentation_time_sec(), 0.0);
    }

    #[test]
    fn test_observer_reads_and_ignores_mutations() {
        let clock = Arc::new(Clock::new());
        clock.start();
        let observer = clock.make_observer();

        observer.advance_presentation(1.0);
        observer.stop();
        assert!(clock.is_started());

        clock.advance_presentation(0.125);
        clock.wait();
        assert_eq!(observer.presentation_time_sec(), 0.125);

        drop(clock);
        assert_eq!(observer.presentation_time_sec(), 0.0);
    }
}
