//! Types de samples audio et descripteurs de formats
//!
//! Ce module définit l'énumération [`SampleFormat`] des formats de samples
//! transportés par le pipeline, le trait [`Sample`] qui permet d'écrire du
//! code générique sur les types concrets, et le type [`I24`] pour les
//! échantillons 24-bit stockés sur 32 bits.

use std::fmt;

/// Formats de samples supportés
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// Entier non signé 8-bit, silence à 0x80
    U8,
    /// Entier signé 16-bit
    I16,
    /// Entier signé 24-bit, stocké sur 32 bits avec extension de signe
    I24,
    /// Entier signé 32-bit
    I32,
    /// Flottant 32-bit normalisé [-1.0, 1.0]
    F32,
    /// Flottant 64-bit normalisé [-1.0, 1.0]
    F64,
}

impl SampleFormat {
    /// Taille en mémoire d'un sample, en octets
    ///
    /// Les samples 24-bit occupent 4 octets en mémoire.
    #[inline]
    pub const fn stride(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::I16 => 2,
            SampleFormat::I24 => 4,
            SampleFormat::I32 => 4,
            SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }

    /// Taille d'un sample une fois sérialisé, en octets
    #[inline]
    pub const fn packed_size(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::I16 => 2,
            SampleFormat::I24 => 3,
            SampleFormat::I32 => 4,
            SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }

    /// Résolution effective en bits
    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            SampleFormat::U8 => 8,
            SampleFormat::I16 => 16,
            SampleFormat::I24 => 24,
            SampleFormat::I32 => 32,
            SampleFormat::F32 => 32,
            SampleFormat::F64 => 64,
        }
    }

    /// Nom court du format
    pub const fn name(self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::I16 => "i16",
            SampleFormat::I24 => "i24",
            SampleFormat::I32 => "i32",
            SampleFormat::F32 => "f32",
            SampleFormat::F64 => "f64",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Type I24 : échantillon audio 24-bit stocké dans un i32
// ============================================================================

/// Échantillon audio 24-bit signé, stocké dans un i32
///
/// Plage valide : [-8_388_608, 8_388_607] (±2^23). Les constructeurs
/// garantissent l'extension de signe correcte dans le stockage 32 bits.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct I24(i32);

impl I24 {
    /// Valeur minimale : -2^23
    pub const MIN_VALUE: i32 = -8_388_608;

    /// Valeur maximale : 2^23 - 1
    pub const MAX_VALUE: i32 = 8_388_607;

    /// Valeur zéro
    pub const ZERO: I24 = I24(0);

    /// Valeur minimale
    pub const MIN: I24 = I24(Self::MIN_VALUE);

    /// Valeur maximale
    pub const MAX: I24 = I24(Self::MAX_VALUE);

    /// Crée un I24 depuis un i32, en vérifiant la plage valide
    #[inline]
    pub const fn new(value: i32) -> Option<Self> {
        if value >= Self::MIN_VALUE && value <= Self::MAX_VALUE {
            Some(I24(value))
        } else {
            None
        }
    }

    /// Crée un I24 depuis un i32, en clampant à la plage valide
    #[inline]
    pub const fn new_clamped(value: i32) -> Self {
        let clamped = if value < Self::MIN_VALUE {
            Self::MIN_VALUE
        } else if value > Self::MAX_VALUE {
            Self::MAX_VALUE
        } else {
            value
        };
        I24(clamped)
    }

    /// Retourne la valeur i32 interne
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self.0
    }
}

impl fmt::Debug for I24 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I24({})", self.0)
    }
}

impl fmt::Display for I24 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<I24> for i32 {
    #[inline]
    fn from(sample: I24) -> i32 {
        sample.0
    }
}

impl TryFrom<i32> for I24 {
    type Error = &'static str;

    #[inline]
    fn try_from(value: i32) -> Result<Self, Self::Error> {
        I24::new(value).ok_or("i32 value out of I24 range")
    }
}

// SAFETY: I24 est repr(transparent) sur i32, tout motif de bits est permis
// par le stockage (la plage 24-bit est une invariante logique, pas mémoire).
unsafe impl bytemuck::Zeroable for I24 {}
unsafe impl bytemuck::Pod for I24 {}

// ============================================================================
// Trait Sample
// ============================================================================

/// Trait pour tous les types de samples audio supportés
///
/// Les conversions passent par deux domaines pivots :
/// - le domaine entier 32-bit pleine échelle (`to_i32_full`/`from_i32_full`),
///   où les élargissements et rétrécissements sont des décalages
///   arithmétiques exacts ;
/// - le domaine flottant f64 normalisé (`to_f64`/`from_f64`), où la
///   quantification arrondit au plus proche, moitié vers le pair, avec
///   saturation.
pub trait Sample:
    Copy + Clone + Default + Send + Sync + PartialEq + fmt::Debug + bytemuck::Pod + 'static
{
    /// Format correspondant au type
    const FORMAT: SampleFormat;

    /// Valeur de silence du type
    const SILENCE: Self;

    /// Élargit le sample à l'échelle 32-bit complète
    fn to_i32_full(self) -> i32;

    /// Construit un sample depuis l'échelle 32-bit complète
    fn from_i32_full(value: i32) -> Self;

    /// Convertit le sample en f64 normalisé
    fn to_f64(self) -> f64;

    /// Quantifie un f64 normalisé vers le type, avec saturation
    fn from_f64(value: f64) -> Self;
}

impl Sample for u8 {
    const FORMAT: SampleFormat = SampleFormat::U8;
    const SILENCE: u8 = 0x80;

    #[inline]
    fn to_i32_full(self) -> i32 {
        ((self as i32) - 0x80) << 24
    }

    #[inline]
    fn from_i32_full(value: i32) -> u8 {
        ((value >> 24) + 0x80) as u8
    }

    #[inline]
    fn to_f64(self) -> f64 {
        ((self as i32) - 0x80) as f64 / 128.0
    }

    #[inline]
    fn from_f64(value: f64) -> u8 {
        let scaled = (value * 128.0).round_ties_even().clamp(-128.0, 127.0);
        (scaled as i32 + 0x80) as u8
    }
}

impl Sample for i16 {
    const FORMAT: SampleFormat = SampleFormat::I16;
    const SILENCE: i16 = 0;

    #[inline]
    fn to_i32_full(self) -> i32 {
        (self as i32) << 16
    }

    #[inline]
    fn from_i32_full(value: i32) -> i16 {
        (value >> 16) as i16
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64 / 32_768.0
    }

    #[inline]
    fn from_f64(value: f64) -> i16 {
        (value * 32_768.0)
            .round_ties_even()
            .clamp(-32_768.0, 32_767.0) as i16
    }
}

impl Sample for I24 {
    const FORMAT: SampleFormat = SampleFormat::I24;
    const SILENCE: I24 = I24::ZERO;

    #[inline]
    fn to_i32_full(self) -> i32 {
        self.0 << 8
    }

    #[inline]
    fn from_i32_full(value: i32) -> I24 {
        I24(value >> 8)
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self.0 as f64 / 8_388_608.0
    }

    #[inline]
    fn from_f64(value: f64) -> I24 {
        let scaled = (value * 8_388_608.0)
            .round_ties_even()
            .clamp(-8_388_608.0, 8_388_607.0);
        I24(scaled as i32)
    }
}

impl Sample for i32 {
    const FORMAT: SampleFormat = SampleFormat::I32;
    const SILENCE: i32 = 0;

    #[inline]
    fn to_i32_full(self) -> i32 {
        self
    }

    #[inline]
    fn from_i32_full(value: i32) -> i32 {
        value
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64 / 2_147_483_648.0
    }

    #[inline]
    fn from_f64(value: f64) -> i32 {
        (value * 2_147_483_648.0)
            .round_ties_even()
            .clamp(-2_147_483_648.0, 2_147_483_647.0) as i32
    }
}

impl Sample for f32 {
    const FORMAT: SampleFormat = SampleFormat::F32;
    const SILENCE: f32 = 0.0;

    #[inline]
    fn to_i32_full(self) -> i32 {
        i32::from_f64(self as f64)
    }

    #[inline]
    fn from_i32_full(value: i32) -> f32 {
        (value as f64 / 2_147_483_648.0) as f32
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64(value: f64) -> f32 {
        value as f32
    }
}

impl Sample for f64 {
    const FORMAT: SampleFormat = SampleFormat::F64;
    const SILENCE: f64 = 0.0;

    #[inline]
    fn to_i32_full(self) -> i32 {
        i32::from_f64(self)
    }

    #[inline]
    fn from_i32_full(value: i32) -> f64 {
        value as f64 / 2_147_483_648.0
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn from_f64(value: f64) -> f64 {
        value
    }
}

// ============================================================================
// Tests
// ============================================================================
