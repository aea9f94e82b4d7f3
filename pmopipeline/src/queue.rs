//! File SPSC bornée de buffers gérés
//!
//! Anneau à capacité fixe avec indices atomiques tête/queue. Un slot est
//! réservé pour distinguer plein de vide : l'anneau de capacité N possède
//! N+1 slots et est plein quand `(write + 1) % slots == read`.
//!
//! # Contrat
//!
//! Au plus un thread pousse et au plus un thread dépile à la fois. C'est la
//! discipline des liens source→sink : le producteur est l'unique pousseur,
//! le consommateur l'unique dépileur. `clear` s'exécute côté consommateur,
//! pendant une fenêtre de reconfiguration.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::pool::ManagedBuffer;

/// Capacité par défaut d'un lien : un buffer en vol pendant que le
/// producteur remplit le suivant
pub const DEFAULT_QUEUE_CAPACITY: usize = 2;

/// Anneau SPSC de [`ManagedBuffer`]
pub struct BufferQueue {
    slots: Box<[UnsafeCell<Option<ManagedBuffer>>]>,
    write_index: AtomicUsize,
    read_index: AtomicUsize,
}

// SAFETY: l'accès aux slots est partitionné par les indices atomiques :
// le producteur n'écrit que le slot `write`, le consommateur ne lit que le
// slot `read`, et les publications se font en release/acquire.
unsafe impl Send for BufferQueue {}
unsafe impl Sync for BufferQueue {}

impl BufferQueue {
    /// Crée une file de capacité `capacity` (au moins 1)
    pub fn new(capacity: usize) -> Self {
        let slots = capacity.max(1) + 1;
        BufferQueue {
            slots: (0..slots).map(|_| UnsafeCell::new(None)).collect(),
            write_index: AtomicUsize::new(0),
            read_index: AtomicUsize::new(0),
        }
    }

    /// Capacité utile de la file
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Vrai si la file est pleine
    pub fn full(&self) -> bool {
        let write = self.write_index.load(Ordering::Acquire);
        let read = self.read_index.load(Ordering::Acquire);
        (write + 1) % self.slots.len() == read
    }

    /// Vrai si la file est vide
    pub fn empty(&self) -> bool {
        let write = self.write_index.load(Ordering::Acquire);
        let read = self.read_index.load(Ordering::Acquire);
        write == read
    }

    /// Nombre de buffers actuellement en file
    pub fn len(&self) -> usize {
        let write = self.write_index.load(Ordering::Acquire);
        let read = self.read_index.load(Ordering::Acquire);
        (write + self.slots.len() - read) % self.slots.len()
    }

    /// Enfile un buffer (côté producteur)
    ///
    /// Retourne le buffer à l'envoyeur si la file est pleine.
    pub fn push(&self, buffer: ManagedBuffer) -> Result<(), ManagedBuffer> {
        let write = self.write_index.load(Ordering::Relaxed);
        let read = self.read_index.load(Ordering::Acquire);
        let next = (write + 1) % self.slots.len();

        if next == read {
            return Err(buffer);
        }

        // SAFETY: seul le producteur touche le slot `write`, qui est hors de
        // la fenêtre visible du consommateur tant que write_index n'est pas
        // publié.
        unsafe {
            *self.slots[write].get() = Some(buffer);
        }

        self.write_index.store(next, Ordering::Release);
        Ok(())
    }

    /// Dépile un buffer (côté consommateur)
    pub fn pop(&self) -> Option<ManagedBuffer> {
        let read = self.read_index.load(Ordering::Relaxed);
        let write = self.write_index.load(Ordering::Acquire);

        if read == write {
            return None;
        }

        // SAFETY: seul le consommateur touche le slot `read`, publié par le
        // store release du producteur.
        let buffer = unsafe { (*self.slots[read].get()).take() };

        self.read_index
            .store((read + 1) % self.slots.len(), Ordering::Release);
        buffer
    }

    /// Vide la file en lâchant les buffers (retour à leurs pools)
    ///
    /// À n'appeler que côté consommateur, le producteur étant à l'arrêt.
    pub fn clear(&self) {
        while self.pop().is_some() {}
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_format::BufferFormat;
    use crate::buffer_length::BufferLength;
    use crate::channels::ChannelSet;
    use crate::pool::BufferPool;
    use crate::sample_types::SampleFormat;
    use std::sync::Arc;
    use std::thread;

    fn test_pool() -> BufferPool {
        BufferPool::new(
            SampleFormat::F32,
            BufferFormat::new(ChannelSet::STEREO, 48_000),
            BufferLength::Frames(16),
        )
    }

    fn stamped(pool: &BufferPool, stamp: f64) -> ManagedBuffer {
        let mut buffer = pool.acquire();
        buffer.set_timestamp_sec(stamp);
        buffer
    }

    #[test]
    fn test_fifo_order() {
        let pool = test_pool();
        let queue = BufferQueue::new(4);

        for i in 0..3 {
            queue.push(stamped(&pool, i as f64)).unwrap();
        }

        for i in 0..3 {
            let buffer = queue.pop().unwrap();
            assert_eq!(buffer.timestamp_sec(), i as f64);
        }
        assert!(queue.empty());
    }

    #[test]
    fn test_full_and_empty_boundaries() {
        let pool = test_pool();
        let queue = BufferQueue::new(2);

        assert!(queue.empty());
        assert!(!queue.full());

        queue.push(stamped(&pool, 0.0)).unwrap();
        queue.push(stamped(&pool, 1.0)).unwrap();
        assert!(queue.full());
        assert_eq!(queue.len(), 2);

        // Plein : le buffer est rendu à l'envoyeur
        let rejected = queue.push(stamped(&pool, 2.0));
        assert!(rejected.is_err());

        queue.pop().unwrap();
        assert!(!queue.full());
        queue.push(stamped(&pool, 3.0)).unwrap();
        assert!(queue.full());
    }

    #[test]
    fn test_clear_returns_buffers_to_pool() {
        let pool = BufferPool::with_capacity(
            SampleFormat::F32,
            BufferFormat::new(ChannelSet::STEREO, 48_000),
            BufferLength::Frames(16),
            4,
        );
        let queue = BufferQueue::new(4);

        queue.push(pool.acquire()).unwrap();
        queue.push(pool.acquire()).unwrap();
        assert_eq!(pool.free_count(), 2);

        queue.clear();
        assert!(queue.empty());
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_spsc_order_across_threads() {
        // Loi SPSC : les buffers sortent dans l'ordre d'entrée, sans perte
        let pool = test_pool();
        let queue = Arc::new(BufferQueue::new(4));
        const COUNT: usize = 1_000;

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..COUNT {
                    let mut buffer = stamped(&pool, i as f64);
                    loop {
                        match queue.push(buffer) {
                            Ok(()) => break,
                            Err(back) => {
                                buffer = back;
                                thread::yield_now();
                            }
                        }
                    }
                }
            })
        };

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut next = 0usize;
                while next < COUNT {
                    match queue.pop() {
                        Some(buffer) => {
                            assert_eq!(buffer.timestamp_sec(), next as f64);
                            next += 1;
                        }
                        None => thread::yield_now(),
                    }
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
        assert!(queue.empty());
    }
}
