//! Vue empruntée sur de la mémoire PCM externe
//!
//! [`RawBuffer`] annote une mémoire fournie par l'extérieur (typiquement le
//! buffer de sortie d'un backend matériel) avec un format de samples, une
//! liste de canaux et le même modèle de curseurs que
//! [`Buffer`](crate::Buffer). Le pont vers les buffers internes fait
//! exactement une copie, qui porte la conversion de format et le
//! réordonnancement de canaux.

use tracing::warn;

use crate::buffer::{with_store, Buffer};
use crate::channels::Channel;
use crate::conversions::convert_strided;
use crate::sample_types::{Sample, SampleFormat};

/// Stockage externe, entrelacé ou planaire par canal
pub enum RawStorage<'a> {
    /// Un seul bloc de samples entrelacés
    Interleaved(&'a mut [u8]),
    /// Un bloc par canal
    Planar(Vec<&'a mut [u8]>),
}

/// Dispatch sur un [`SampleFormat`] dynamique
///
/// Lie `$T` au type de sample concret et exécute `$body`.
macro_rules! with_sample_format {
    ($fmt:expr, $T:ident => $body:expr) => {
        match $fmt {
            SampleFormat::U8 => {
                type $T = u8;
                $body
            }
            SampleFormat::I16 => {
                type $T = i16;
                $body
            }
            SampleFormat::I24 => {
                type $T = crate::sample_types::I24;
                $body
            }
            SampleFormat::I32 => {
                type $T = i32;
                $body
            }
            SampleFormat::F32 => {
                type $T = f32;
                $body
            }
            SampleFormat::F64 => {
                type $T = f64;
                $body
            }
        }
    };
}

/// Vue format-annotée sur une mémoire PCM externe
///
/// La mémoire doit être alignée pour le format de samples annoncé (c'est le
/// cas de tout buffer obtenu d'un slice typé). Les curseurs comptent en
/// frames, avec l'invariant `0 ≤ read ≤ write ≤ capacité`.
pub struct RawBuffer<'a> {
    storage: RawStorage<'a>,
    sample_format: SampleFormat,
    channels: Vec<Channel>,
    frames: u32,
    write_index: u32,
    read_index: u32,
}

impl<'a> RawBuffer<'a> {
    /// Vue entrelacée sur un bloc d'octets
    ///
    /// # Panics
    ///
    /// Si le bloc n'est pas aligné pour `sample_format` ou si sa taille
    /// n'est pas un multiple de la taille d'une frame.
    pub fn interleaved(
        bytes: &'a mut [u8],
        sample_format: SampleFormat,
        channels: &[Channel],
    ) -> Self {
        let stride = sample_format.stride();
        let frame_bytes = stride * channels.len().max(1);
        assert_eq!(bytes.len() % frame_bytes, 0, "partial frame in raw storage");
        assert_eq!(
            bytes.as_ptr() as usize % stride,
            0,
            "raw storage not aligned for {sample_format}"
        );

        let frames = (bytes.len() / frame_bytes) as u32;
        RawBuffer {
            storage: RawStorage::Interleaved(bytes),
            sample_format,
            channels: channels.to_vec(),
            frames,
            write_index: 0,
            read_index: 0,
        }
    }

    /// Vue entrelacée sur un slice de samples typés
    pub fn from_typed<T: Sample>(samples: &'a mut [T], channels: &[Channel]) -> Self {
        Self::interleaved(bytemuck::cast_slice_mut(samples), T::FORMAT, channels)
    }

    /// Vue planaire : un bloc d'octets par canal
    ///
    /// # Panics
    ///
    /// Si le nombre de plans ne correspond pas au nombre de canaux, ou si un
    /// plan est mal aligné ou d'une taille différente des autres.
    pub fn planar(
        planes: Vec<&'a mut [u8]>,
        sample_format: SampleFormat,
        channels: &[Channel],
    ) -> Self {
        assert_eq!(planes.len(), channels.len(), "one plane per channel");
        let stride = sample_format.stride();

        let mut frames = u32::MAX;
        for plane in &planes {
            assert_eq!(plane.len() % stride, 0, "partial sample in raw plane");
            assert_eq!(
                plane.as_ptr() as usize % stride,
                0,
                "raw plane not aligned for {sample_format}"
            );
            frames = frames.min((plane.len() / stride) as u32);
        }
        if planes.is_empty() {
            frames = 0;
        }

        RawBuffer {
            storage: RawStorage::Planar(planes),
            sample_format,
            channels: channels.to_vec(),
            frames,
            write_index: 0,
            read_index: 0,
        }
    }

    /// Format de samples de la mémoire
    #[inline]
    pub fn sample_format(&self) -> SampleFormat {
        self.sample_format
    }

    /// Canaux portés, dans l'ordre du stockage
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Capacité en frames
    #[inline]
    pub fn frames(&self) -> u32 {
        self.frames
    }

    /// Frames disponibles en lecture
    #[inline]
    pub fn available(&self) -> u32 {
        self.write_index - self.read_index
    }

    /// Frames restant à écrire
    #[inline]
    pub fn space(&self) -> u32 {
        self.frames - self.write_index
    }

    /// Remet les curseurs à zéro
    pub fn reset(&mut self) {
        self.write_index = 0;
        self.read_index = 0;
    }

    /// Marque `frames` frames comme déjà écrites (mémoire pré-remplie)
    pub fn assume_filled(&mut self, frames: u32) {
        self.write_index = frames.min(self.frames);
    }

    /// Transfère des frames du buffer interne vers la mémoire externe
    ///
    /// Convertit le type de samples et réordonne les canaux d'après les
    /// tags ; un canal absent de la source est rempli de silence. Retourne
    /// le nombre de frames transférées (min de l'espace libre et du
    /// disponible de la source). Avance les deux curseurs.
    pub fn write_from_buffer(&mut self, source: &mut Buffer) -> u32 {
        let count = self.space().min(source.available());
        if count == 0 {
            return 0;
        }

        let src_channels = source.format().channels();
        let src_width = src_channels.count() as usize;
        let src_base = source.read_index() as usize * src_width;
        let raw_width = self.channels.len();

        for (ci, channel) in self.channels.iter().enumerate() {
            let src_slot = src_channels.index_of(*channel);

            match &mut self.storage {
                RawStorage::Interleaved(bytes) => {
                    with_sample_format!(self.sample_format, T => {
                        let dst: &mut [T] = bytemuck::cast_slice_mut(&mut bytes[..]);
                        let dst_base = self.write_index as usize * raw_width + ci;
                        match src_slot {
                            Some(slot) => with_store!(source.store(), data => {
                                convert_strided(
                                    &data[src_base + slot as usize..],
                                    src_width,
                                    &mut dst[dst_base..],
                                    raw_width,
                                    count as usize,
                                );
                            }),
                            None => fill_silence_strided::<T>(
                                &mut dst[dst_base..],
                                raw_width,
                                count as usize,
                            ),
                        }
                    });
                }
                RawStorage::Planar(planes) => {
                    let plane = &mut planes[ci];
                    with_sample_format!(self.sample_format, T => {
                        let dst: &mut [T] = bytemuck::cast_slice_mut(&mut plane[..]);
                        let dst_base = self.write_index as usize;
                        match src_slot {
                            Some(slot) => with_store!(source.store(), data => {
                                convert_strided(
                                    &data[src_base + slot as usize..],
                                    src_width,
                                    &mut dst[dst_base..],
                                    1,
                                    count as usize,
                                );
                            }),
                            None => fill_silence_strided::<T>(
                                &mut dst[dst_base..],
                                1,
                                count as usize,
                            ),
                        }
                    });
                }
            }

            if src_slot.is_none() {
                warn!("channel {channel} absent from source format, writing silence");
            }
        }

        self.write_index += count;
        source.advance_read(count);
        count
    }

    /// Transfère des frames de la mémoire externe vers un buffer interne
    ///
    /// Les canaux du buffer absents de la vue reçoivent du silence.
    /// Retourne le nombre de frames transférées. Avance les deux curseurs.
    pub fn read_into_buffer(&mut self, dest: &mut Buffer) -> u32 {
        let count = self.available().min(dest.space());
        if count == 0 {
            return 0;
        }

        let dst_channels = dest.format().channels();
        let dst_width = dst_channels.count() as usize;
        let dst_base = dest.write_index() as usize * dst_width;
        let raw_width = self.channels.len();

        for (slot, channel) in dst_channels.iter().enumerate() {
            let raw_slot = self.channels.iter().position(|c| *c == channel);

            match (&self.storage, raw_slot) {
                (RawStorage::Interleaved(bytes), Some(ci)) => {
                    with_sample_format!(self.sample_format, T => {
                        let src: &[T] = bytemuck::cast_slice(&bytes[..]);
                        let src_base = self.read_index as usize * raw_width + ci;
                        with_store!(dest.store_mut(), data => {
                            convert_strided(
                                &src[src_base..],
                                raw_width,
                                &mut data[dst_base + slot..],
                                dst_width,
                                count as usize,
                            );
                        });
                    });
                }
                (RawStorage::Planar(planes), Some(ci)) => {
                    with_sample_format!(self.sample_format, T => {
                        let src: &[T] = bytemuck::cast_slice(&planes[ci][..]);
                        let src_base = self.read_index as usize;
                        with_store!(dest.store_mut(), data => {
                            convert_strided(
                                &src[src_base..],
                                1,
                                &mut data[dst_base + slot..],
                                dst_width,
                                count as usize,
                            );
                        });
                    });
                }
                (_, None) => {
                    with_store!(dest.store_mut(), data => {
                        fill_silence_strided(
                            &mut data[dst_base + slot..],
                            dst_width,
                            count as usize,
                        );
                    });
                }
            }
        }

        self.read_index += count;
        dest.advance_write(count);
        count
    }
}

fn fill_silence_strided<T: Sample>(dst: &mut [T], stride: usize, count: usize) {
    let mut di = 0;
    for _ in 0..count {
        dst[di] = T::SILENCE;
        di += stride;
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

    fn stereo_buffer(sample_format: SampleFormat) -> Buffer {
        Buffer::new(
            sample_format,
            BufferFormat::new(ChannelSet::STEREO, 48_000),
            BufferLength::Frames(64),
        )
    }

    #[test]
    fn test_write_from_buffer_interleaved() {
        let mut source = stereo_buffer(SampleFormat::F32);
        source.write_interleaved(&[0.5f32, -0.5, 0.25, -0.25]);

        let mut device = vec![0i16; 8];
        let mut raw = RawBuffer::from_typed(
            &mut device,
            &[Channel::FrontLeft, Channel::FrontRight],
        );

        assert_eq!(raw.write_from_buffer(&mut source), 2);
        assert_eq!(source.available(), 0);
        drop(raw);
        assert_eq!(&device[..4], &[16_384, -16_384, 8_192, -8_192]);
    }

    #[test]
    fn test_channel_reorder() {
        let mut source = stereo_buffer(SampleFormat::I16);
        source.write_interleaved(&[100i16, -100]);

        // La vue expose droite puis gauche
        let mut device = vec![0i16; 2];
        let mut raw = RawBuffer::from_typed(
            &mut device,
            &[Channel::FrontRight, Channel::FrontLeft],
        );

        assert_eq!(raw.write_from_buffer(&mut source), 1);
        drop(raw);
        assert_eq!(device, vec![-100, 100]);
    }

    #[test]
    fn test_missing_channel_gets_silence() {
        let mut source = Buffer::new(
            SampleFormat::I16,
            BufferFormat::new(ChannelSet::MONO, 48_000),
            BufferLength::Frames(4),
        );
        source.write_interleaved(&[1_000i16, 2_000]);

        let mut device = vec![9i16; 4];
        let mut raw = RawBuffer::from_typed(
            &mut device,
            &[Channel::FrontCenter, Channel::FrontLeft],
        );

        assert_eq!(raw.write_from_buffer(&mut source), 2);
        drop(raw);
        assert_eq!(device, vec![1_000, 0, 2_000, 0]);
    }

    #[test]
    fn test_planar_read_into_buffer() {
        let mut left = [0.5f32, 0.25];
        let mut right = [-0.5f32, -0.25];
        let planes = vec![
            bytemuck::cast_slice_mut::<f32, u8>(&mut left),
            bytemuck::cast_slice_mut::<f32, u8>(&mut right),
        ];
        let mut raw = RawBuffer::planar(
            planes,
            SampleFormat::F32,
            &[Channel::FrontLeft, Channel::FrontRight],
        );
        raw.assume_filled(2);

        let mut dest = stereo_buffer(SampleFormat::F32);
        assert_eq!(raw.read_into_buffer(&mut dest), 2);

        let mut out = vec![0.0f32; 4];
        dest.read_interleaved(&mut out);
        assert_eq!(out, vec![0.5, -0.5, 0.25, -0.25]);
    }

    #[test]
    fn test_cursor_model() {
        let mut device = vec![0i16; 8];
        let raw = RawBuffer::from_typed(
            &mut device,
            &[Channel::FrontLeft, Channel::FrontRight],
        );
        assert_eq!(raw.frames(), 4);
        assert_eq!(raw.available(), 0);
        assert_eq!(raw.space(), 4);
    }
}
