//! Pool de buffers recyclés
//!
//! Élimine l'allocation sur le chemin audio : un pool construit des buffers
//! identiques d'après un template `(type de sample, format, longueur)` et
//! les recycle à leur retour. Le handle [`ManagedBuffer`] rend le buffer à
//! son pool d'origine quand il est lâché ; si le pool a disparu entre
//! temps, le buffer est simplement détruit (référence arrière faible).

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

use crate::buffer::Buffer;
use crate::buffer_format::BufferFormat;
use crate::buffer_length::BufferLength;
use crate::sample_types::SampleFormat;

struct PoolState {
    free: Vec<Buffer>,
    sample_format: SampleFormat,
    format: BufferFormat,
    length: BufferLength,
}

impl PoolState {
    fn matches_template(&self, buffer: &Buffer) -> bool {
        buffer.sample_format() == self.sample_format
            && buffer.format() == self.format
            && buffer.length() == self.length
    }

    fn make_buffer(&self) -> Buffer {
        Buffer::new(self.sample_format, self.format, self.length)
    }
}

pub(crate) struct PoolInner {
    state: Mutex<PoolState>,
}

impl PoolInner {
    /// Reprend un buffer rendu par un handle
    ///
    /// Un buffer dont la forme ne correspond plus au template courant est
    /// détruit au lieu d'être réinséré : le pool ne ressort jamais un
    /// buffer d'une autre forme que son template.
    fn reclaim(&self, mut buffer: Buffer) {
        let mut state = self.state.lock().unwrap();
        if state.matches_template(&buffer) {
            buffer.reset();
            state.free.push(buffer);
        } else {
            trace!("dropping returned buffer with stale template");
        }
    }
}

/// Pool à template fixe de buffers PCM
///
/// Cloner le handle partage le même pool. Le mutex interne n'est tenu que
/// le temps d'un push/pop de pile ou d'un échange de template.
///
/// # Exemples
///
/// ```
/// use pmopipeline::{BufferFormat, BufferLength, BufferPool, ChannelSet, SampleFormat};
///
/// let format = BufferFormat::new(ChannelSet::STEREO, 48_000);
/// let pool = BufferPool::with_capacity(SampleFormat::F32, format, BufferLength::Frames(512), 4);
///
/// let buffer = pool.acquire();
/// assert_eq!(buffer.frames(), 512);
/// drop(buffer); // retourne au pool
/// ```
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Crée un pool vide pour le template donné
    pub fn new(
        sample_format: SampleFormat,
        format: BufferFormat,
        length: BufferLength,
    ) -> Self {
        BufferPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    sample_format,
                    format,
                    length,
                }),
            }),
        }
    }

    /// Crée un pool pré-peuplé de `count` buffers
    pub fn with_capacity(
        sample_format: SampleFormat,
        format: BufferFormat,
        length: BufferLength,
        count: usize,
    ) -> Self {
        let pool = Self::new(sample_format, format, length);
        {
            let mut state = pool.inner.state.lock().unwrap();
            for _ in 0..count {
                let buffer = state.make_buffer();
                state.free.push(buffer);
            }
        }
        pool
    }

    /// Sort un buffer du pool, en allouant si le pool est vide
    ///
    /// Ne bloque jamais au-delà du mutex de pile. Le handle retourné est
    /// détenu exclusivement par le caller.
    pub fn acquire(&self) -> ManagedBuffer {
        let mut state = self.inner.state.lock().unwrap();
        let buffer = match state.free.pop() {
            Some(buffer) => buffer,
            None => state.make_buffer(),
        };

        ManagedBuffer {
            buffer: Some(buffer),
            owner: Arc::downgrade(&self.inner),
        }
    }

    /// Remplace le template du pool
    ///
    /// Vide le pool : les acquisitions suivantes produisent la nouvelle
    /// forme. Les buffers déjà sortis gardent leur forme d'origine et
    /// seront détruits à leur retour.
    pub fn set_template(
        &self,
        sample_format: SampleFormat,
        format: BufferFormat,
        length: BufferLength,
    ) {
        let mut state = self.inner.state.lock().unwrap();
        state.sample_format = sample_format;
        state.format = format;
        state.length = length;
        state.free.clear();
    }

    /// Nombre de buffers libres dans le pool
    pub fn free_count(&self) -> usize {
        self.inner.state.lock().unwrap().free.len()
    }
}

/// Handle possédant d'un buffer sorti d'un pool
///
/// Se déréférence vers [`Buffer`]. Au drop, le buffer retourne à son pool
/// d'origine s'il existe encore, sinon il est détruit sur place.
pub struct ManagedBuffer {
    buffer: Option<Buffer>,
    owner: Weak<PoolInner>,
}

impl Deref for ManagedBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        self.buffer.as_ref().expect("buffer taken")
    }
}

impl DerefMut for ManagedBuffer {
    fn deref_mut(&mut self) -> &mut Buffer {
        self.buffer.as_mut().expect("buffer taken")
    }
}

impl Drop for ManagedBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            if let Some(pool) = self.owner.upgrade() {
                pool.reclaim(buffer);
            }
            // Pool disparu : le buffer est détruit ici.
        }
    }
}

impl std::fmt::Debug for ManagedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.buffer {
            Some(buffer) => write!(
                f,
                "ManagedBuffer({} frames, {})",
                buffer.frames(),
                buffer.format()
            ),
            None => f.write_str("ManagedBuffer(taken)"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
