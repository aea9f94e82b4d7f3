//! Conversions entre formats de samples
//!
//! Les conversions entier↔entier passent par le domaine 32-bit pleine
//! échelle (décalages arithmétiques, exacts). Dès qu'un flottant est
//! impliqué, la conversion passe par f64 normalisé avec arrondi au plus
//! proche (moitié vers le pair) et saturation.

use crate::sample_types::{Sample, SampleFormat};

impl SampleFormat {
    /// Vrai pour les formats entiers
    #[inline]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            SampleFormat::U8 | SampleFormat::I16 | SampleFormat::I24 | SampleFormat::I32
        )
    }
}

/// Convertit un sample d'un type vers un autre
///
/// Le choix du domaine pivot est résolu à la monomorphisation.
#[inline]
pub fn convert_sample<Src: Sample, Dst: Sample>(sample: Src) -> Dst {
    if Src::FORMAT.is_integer() && Dst::FORMAT.is_integer() {
        Dst::from_i32_full(sample.to_i32_full())
    } else {
        Dst::from_f64(sample.to_f64())
    }
}

/// Convertit un slice de samples élément par élément
///
/// Les deux slices doivent avoir la même longueur.
pub fn convert_slice<Src: Sample, Dst: Sample>(src: &[Src], dst: &mut [Dst]) {
    debug_assert_eq!(src.len(), dst.len());
    for (s, d) in src.iter().zip(dst.iter_mut()) {
        *d = convert_sample(*s);
    }
}

/// Convertit `count` samples en lisant et écrivant avec un pas
///
/// Sert aux copies entrelacé↔entrelacé avec réordonnancement de canaux
/// (pas = nombre de canaux) et aux copies entrelacé↔planaire (pas = 1 d'un
/// côté). Les offsets de départ sont appliqués par le caller en découpant
/// les slices.
pub fn convert_strided<Src: Sample, Dst: Sample>(
    src: &[Src],
    src_stride: usize,
    dst: &mut [Dst],
    dst_stride: usize,
    count: usize,
) {
    debug_assert!(src_stride >= 1 && dst_stride >= 1);
    debug_assert!(count == 0 || (count - 1) * src_stride < src.len());
    debug_assert!(count == 0 || (count - 1) * dst_stride < dst.len());

    let mut si = 0;
    let mut di = 0;
    for _ in 0..count {
        dst[di] = convert_sample(src[si]);
        si += src_stride;
        di += dst_stride;
    }
}

// ============================================================================
// Tests
// ============================================================================
