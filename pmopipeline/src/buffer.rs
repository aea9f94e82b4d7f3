//! Buffer PCM possédé, avec curseurs de lecture/écriture
//!
//! Un [`Buffer`] possède un stockage typé dimensionné à la construction
//! (`frames × canaux` samples d'un seul type) et n'alloue plus jamais
//! ensuite. Les stages écrivent côté production et lisent côté
//! consommation à travers deux curseurs exprimés en frames, avec
//! l'invariant `0 ≤ read ≤ write ≤ capacité`.
//!
//! Le stockage est une énumération sur les types de samples concrets, à la
//! manière des chunks typés : le type est fixé par le template du pool qui
//! a créé le buffer, et les conversions n'interviennent qu'aux frontières
//! ([`RawBuffer`](crate::RawBuffer)).

use crate::buffer_format::BufferFormat;
use crate::buffer_length::BufferLength;
use crate::conversions::convert_slice;
use crate::sample_types::{Sample, SampleFormat, I24};

/// Stockage PCM typé d'un buffer
#[derive(Debug)]
pub enum SampleStore {
    U8(Vec<u8>),
    I16(Vec<i16>),
    I24(Vec<I24>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl SampleStore {
    fn with_capacity(format: SampleFormat, samples: usize) -> Self {
        match format {
            SampleFormat::U8 => SampleStore::U8(vec![u8::SILENCE; samples]),
            SampleFormat::I16 => SampleStore::I16(vec![0; samples]),
            SampleFormat::I24 => SampleStore::I24(vec![I24::ZERO; samples]),
            SampleFormat::I32 => SampleStore::I32(vec![0; samples]),
            SampleFormat::F32 => SampleStore::F32(vec![0.0; samples]),
            SampleFormat::F64 => SampleStore::F64(vec![0.0; samples]),
        }
    }

    /// Format de samples du stockage
    pub fn sample_format(&self) -> SampleFormat {
        match self {
            SampleStore::U8(_) => SampleFormat::U8,
            SampleStore::I16(_) => SampleFormat::I16,
            SampleStore::I24(_) => SampleFormat::I24,
            SampleStore::I32(_) => SampleFormat::I32,
            SampleStore::F32(_) => SampleFormat::F32,
            SampleStore::F64(_) => SampleFormat::F64,
        }
    }
}

/// Dispatch sur le stockage typé d'un buffer
///
/// Lie le slice typé du store à `$slice` et exécute `$body` pour la
/// variante active.
macro_rules! with_store {
    ($store:expr, $slice:ident => $body:expr) => {
        match $store {
            $crate::buffer::SampleStore::U8($slice) => $body,
            $crate::buffer::SampleStore::I16($slice) => $body,
            $crate::buffer::SampleStore::I24($slice) => $body,
            $crate::buffer::SampleStore::I32($slice) => $body,
            $crate::buffer::SampleStore::F32($slice) => $body,
            $crate::buffer::SampleStore::F64($slice) => $body,
        }
    };
}

pub(crate) use with_store;

/// Buffer PCM entrelacé à capacité fixe
///
/// Créé par un [`BufferPool`](crate::BufferPool) et recyclé à son retour.
/// Un buffer est détenu exclusivement par un holder à la fois ; écrire
/// dedans n'est observable par personne d'autre.
#[derive(Debug)]
pub struct Buffer {
    store: SampleStore,
    format: BufferFormat,
    length: BufferLength,
    capacity_frames: u32,
    timestamp_sec: f64,
    flags: u32,
    write_index: u32,
    read_index: u32,
}

impl Buffer {
    /// Drapeau : dernier buffer du flux
    pub const END_OF_STREAM: u32 = 1 << 0;

    /// Construit un buffer pour le triple (type de sample, format, longueur)
    pub fn new(sample_format: SampleFormat, format: BufferFormat, length: BufferLength) -> Self {
        let capacity_frames = length.frames(format.sample_rate());
        let samples = capacity_frames as usize * format.channel_count() as usize;

        Buffer {
            store: SampleStore::with_capacity(sample_format, samples),
            format,
            length,
            capacity_frames,
            timestamp_sec: 0.0,
            flags: 0,
            write_index: 0,
            read_index: 0,
        }
    }

    /// Format de samples du stockage
    #[inline]
    pub fn sample_format(&self) -> SampleFormat {
        self.store.sample_format()
    }

    /// Format du buffer (canaux, taux)
    #[inline]
    pub fn format(&self) -> BufferFormat {
        self.format
    }

    /// Longueur nominale du buffer
    #[inline]
    pub fn length(&self) -> BufferLength {
        self.length
    }

    /// Capacité totale en frames
    #[inline]
    pub fn frames(&self) -> u32 {
        self.capacity_frames
    }

    /// Frames disponibles en lecture
    #[inline]
    pub fn available(&self) -> u32 {
        self.write_index - self.read_index
    }

    /// Frames restant à écrire
    #[inline]
    pub fn space(&self) -> u32 {
        self.capacity_frames - self.write_index
    }

    /// Curseur d'écriture, en frames
    #[inline]
    pub fn write_index(&self) -> u32 {
        self.write_index
    }

    /// Curseur de lecture, en frames
    #[inline]
    pub fn read_index(&self) -> u32 {
        self.read_index
    }

    /// Timestamp de présentation, en secondes
    #[inline]
    pub fn timestamp_sec(&self) -> f64 {
        self.timestamp_sec
    }

    pub fn set_timestamp_sec(&mut self, timestamp_sec: f64) {
        self.timestamp_sec = timestamp_sec;
    }

    /// Durée des frames disponibles, en secondes
    pub fn duration_sec(&self) -> f64 {
        if self.format.sample_rate() == 0 {
            return 0.0;
        }
        self.available() as f64 / self.format.sample_rate() as f64
    }

    /// Mot de drapeaux du flux
    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    #[inline]
    pub fn has_flag(&self, flag: u32) -> bool {
        (self.flags & flag) != 0
    }

    /// Remet les curseurs, drapeaux et timestamp à zéro
    ///
    /// Le contenu PCM n'est pas effacé : il sera réécrit avant toute
    /// lecture puisque `available()` repart de zéro.
    pub fn reset(&mut self) {
        self.write_index = 0;
        self.read_index = 0;
        self.flags = 0;
        self.timestamp_sec = 0.0;
    }

    /// Remplace le contenu par celui de `source`
    ///
    /// Échoue (retourne `false`) si le format de buffer ou le type de
    /// samples diffèrent. Si la source contient plus de frames que la
    /// capacité, la copie est tronquée.
    pub fn copy(&mut self, source: &Buffer) -> bool {
        if self.format != source.format || self.sample_format() != source.sample_format() {
            return false;
        }

        self.reset();

        let frames = source.available().min(self.capacity_frames);
        let channels = self.format.channel_count() as usize;
        let src_start = source.read_index as usize * channels;
        let count = frames as usize * channels;

        match (&mut self.store, &source.store) {
            (SampleStore::U8(d), SampleStore::U8(s)) => {
                d[..count].copy_from_slice(&s[src_start..src_start + count]);
            }
            (SampleStore::I16(d), SampleStore::I16(s)) => {
                d[..count].copy_from_slice(&s[src_start..src_start + count]);
            }
            (SampleStore::I24(d), SampleStore::I24(s)) => {
                d[..count].copy_from_slice(&s[src_start..src_start + count]);
            }
            (SampleStore::I32(d), SampleStore::I32(s)) => {
                d[..count].copy_from_slice(&s[src_start..src_start + count]);
            }
            (SampleStore::F32(d), SampleStore::F32(s)) => {
                d[..count].copy_from_slice(&s[src_start..src_start + count]);
            }
            (SampleStore::F64(d), SampleStore::F64(s)) => {
                d[..count].copy_from_slice(&s[src_start..src_start + count]);
            }
            _ => return false,
        }

        self.write_index = frames;
        self.timestamp_sec = source.timestamp_sec;
        self.flags = source.flags;
        true
    }

    /// Écrit des frames entrelacées en convertissant depuis `T`
    ///
    /// `frames.len()` doit être un multiple du nombre de canaux. Retourne le
    /// nombre de frames effectivement écrites (borné par `space()`).
    pub fn write_interleaved<T: Sample>(&mut self, frames: &[T]) -> u32 {
        let channels = self.format.channel_count() as usize;
        if channels == 0 {
            return 0;
        }
        debug_assert_eq!(frames.len() % channels, 0);

        let count = ((frames.len() / channels) as u32).min(self.space());
        let samples = count as usize * channels;
        let start = self.write_index as usize * channels;

        with_store!(&mut self.store, data => {
            convert_slice(&frames[..samples], &mut data[start..start + samples]);
        });

        self.write_index += count;
        count
    }

    /// Lit des frames entrelacées en convertissant vers `T`
    ///
    /// Retourne le nombre de frames lues (borné par `available()` et par la
    /// capacité de `out`). Avance le curseur de lecture.
    pub fn read_interleaved<T: Sample>(&mut self, out: &mut [T]) -> u32 {
        let channels = self.format.channel_count() as usize;
        if channels == 0 {
            return 0;
        }

        let count = ((out.len() / channels) as u32).min(self.available());
        let samples = count as usize * channels;
        let start = self.read_index as usize * channels;

        with_store!(&self.store, data => {
            convert_slice(&data[start..start + samples], &mut out[..samples]);
        });

        self.read_index += count;
        count
    }

    /// Écrit `frames` frames de silence
    ///
    /// Responsabilité du producteur en cas d'underrun : le consommateur
    /// reçoit un buffer plein de silence plutôt que rien.
    pub fn fill_silence(&mut self, frames: u32) -> u32 {
        let channels = self.format.channel_count() as usize;
        let count = frames.min(self.space());
        let start = self.write_index as usize * channels;
        let samples = count as usize * channels;

        with_store!(&mut self.store, data => {
            fill_silence_samples(&mut data[start..start + samples]);
        });

        self.write_index += count;
        count
    }

    /// Vue typée sur la région lisible, si `T` est le type du stockage
    pub fn samples<T: Sample>(&self) -> Option<&[T]> {
        if T::FORMAT != self.sample_format() {
            return None;
        }
        let channels = self.format.channel_count() as usize;
        let start = self.read_index as usize * channels;
        let end = self.write_index as usize * channels;
        with_store!(&self.store, data => {
            Some(&bytemuck::cast_slice(data.as_slice())[start..end])
        })
    }

    /// Vue typée mutable sur la région lisible
    pub fn samples_mut<T: Sample>(&mut self) -> Option<&mut [T]> {
        if T::FORMAT != self.sample_format() {
            return None;
        }
        let channels = self.format.channel_count() as usize;
        let start = self.read_index as usize * channels;
        let end = self.write_index as usize * channels;
        with_store!(&mut self.store, data => {
            Some(&mut bytemuck::cast_slice_mut(data.as_mut_slice())[start..end])
        })
    }

    pub(crate) fn store(&self) -> &SampleStore {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut SampleStore {
        &mut self.store
    }

    pub(crate) fn advance_write(&mut self, frames: u32) {
        self.write_index = (self.write_index + frames).min(self.capacity_frames);
    }

    pub(crate) fn advance_read(&mut self, frames: u32) {
        self.read_index = (self.read_index + frames).min(self.write_index);
    }
}

fn fill_silence_samples<T: Sample>(samples: &mut [T]) {
    for sample in samples {
        *sample = T::SILENCE;
    }
}

// ============================================================================
// Tests
// ============================================================================
