//! Source de temps externe et diffusion vers les horloges abonnées

use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::clock::Clock;

/// Plage de périodes de tick supportée par un driver
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClockCapabilities {
    /// Période minimale, en nanosecondes
    pub min_period_ns: u64,
    /// Période maximale, en nanosecondes
    pub max_period_ns: u64,
}

impl ClockCapabilities {
    pub const fn new(min_period_ns: u64, max_period_ns: u64) -> Self {
        ClockCapabilities {
            min_period_ns,
            max_period_ns,
        }
    }

    /// Vrai si la période est dans la plage
    pub const fn supports(&self, period_ns: u64) -> bool {
        period_ns >= self.min_period_ns && period_ns <= self.max_period_ns
    }
}

/// Erreurs d'horloge
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    #[error("clock period {period_ns} ns outside supported range [{min_ns}, {max_ns}] ns")]
    PeriodOutOfRange {
        period_ns: u64,
        min_ns: u64,
        max_ns: u64,
    },
}

struct ProviderState {
    period_ns: u64,
    subscribers: Vec<Weak<Clock>>,
}

/// Diffuseur de ticks d'horloge
///
/// Un backend possède un `ClockProvider` décrivant ses capacités de cadence
/// et y publie le temps écoulé à chaque callback matériel. Les horloges
/// abonnées reçoivent chaque publication par `advance_presentation`, dans
/// l'ordre d'abonnement. Les abonnements sont faibles : une horloge
/// disparue est purgée à la publication suivante.
pub struct ClockProvider {
    capabilities: ClockCapabilities,
    state: Mutex<ProviderState>,
}

impl ClockProvider {
    /// Crée un provider avec ses capacités et sa période par défaut
    pub fn new(capabilities: ClockCapabilities, default_period_ns: u64) -> Self {
        debug_assert!(capabilities.supports(default_period_ns));
        ClockProvider {
            capabilities,
            state: Mutex::new(ProviderState {
                period_ns: default_period_ns,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Capacités de cadence du driver
    pub fn capabilities(&self) -> ClockCapabilities {
        self.capabilities
    }

    /// Période courante, en nanosecondes
    pub fn period_ns(&self) -> u64 {
        self.state.lock().unwrap().period_ns
    }

    /// Période courante, en secondes
    pub fn period_sec(&self) -> f64 {
        self.period_ns() as f64 / 1_000_000_000.0
    }

    /// Change la période de tick
    ///
    /// Échoue si la période sort de la plage des capacités.
    pub fn set_period(&self, period_ns: u64) -> Result<(), ClockError> {
        if !self.capabilities.supports(period_ns) {
            return Err(ClockError::PeriodOutOfRange {
                period_ns,
                min_ns: self.capabilities.min_period_ns,
                max_ns: self.capabilities.max_period_ns,
            });
        }
        self.state.lock().unwrap().period_ns = period_ns;
        Ok(())
    }

    /// Abonne une horloge aux publications
    pub fn register_clock(&self, clock: &Arc<Clock>) {
        let mut state = self.state.lock().unwrap();
        state.subscribers.push(Arc::downgrade(clock));
    }

    /// Désabonne une horloge
    pub fn deregister_clock(&self, clock: &Arc<Clock>) {
        let mut state = self.state.lock().unwrap();
        state
            .subscribers
            .retain(|weak| weak.upgrade().is_some_and(|c| !Arc::ptr_eq(&c, clock)));
    }

    /// Publie une avancée de temps vers toutes les horloges abonnées
    ///
    /// Les horloges mortes sont purgées au passage.
    pub fn publish(&self, delta_sec: f64) {
        let mut state = self.state.lock().unwrap();
        let before = state.subscribers.len();

        state.subscribers.retain(|weak| match weak.upgrade() {
            Some(clock) => {
                clock.advance_presentation(delta_sec);
                true
            }
            None => false,
        });

        if state.subscribers.len() != before {
            debug!(
                "pruned {} dead clock subscription(s)",
                before - state.subscribers.len()
            );
        }
    }

    /// Nombre d'horloges abonnées encore vivantes
    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ClockProvider {
        ClockProvider::new(ClockCapabilities::new(1_000_000, 1_000_000_000), 10_000_000)
    }

    #[test]
    fn test_set_period_validates_range() {
        let provider = provider();
        assert_eq!(provider.period_ns(), 10_000_000);

        provider.set_period(500_000_000).unwrap();
        assert_eq!(provider.period_ns(), 500_000_000);

        let err = provider.set_period(10).unwrap_err();
        assert!(matches!(err, ClockError::PeriodOutOfRange { .. }));
        assert_eq!(provider.period_ns(), 500_000_000);

        assert!(provider.set_period(2_000_000_000).is_err());
    }

    #[test]
    fn test_publish_fans_out() {
        let provider = provider();
        let a = Arc::new(Clock::new());
        let b = Arc::new(Clock::new());
        a.start();
        b.start();

        provider.register_clock(&a);
        provider.register_clock(&b);
        provider.publish(0.010);

        assert!(a.wait());
        assert!(b.wait());
        assert_eq!(a.presentation_time_sec(), 0.010);
        assert_eq!(b.presentation_time_sec(), 0.010);
    }

    #[test]
    fn test_dead_clocks_are_pruned() {
        let provider = provider();
        let a = Arc::new(Clock::new());
        provider.register_clock(&a);
        assert_eq!(provider.subscriber_count(), 1);

        drop(a);
        provider.publish(0.010);
        assert_eq!(provider.subscriber_count(), 0);
    }

    #[test]
    fn test_deregister() {
        let provider = provider();
        let a = Arc::new(Clock::new());
        let b = Arc::new(Clock::new());
        provider.register_clock(&a);
        provider.register_clock(&b);

        provider.deregister_clock(&a);
        assert_eq!(provider.subscriber_count(), 1);

        a.start();
        provider.publish(0.010);
        // a n'est plus abonnée : aucun delta en attente
        a.stop();
        assert!(!a.wait());
        assert_eq!(a.presentation_time_sec(), 0.0);
    }
}
