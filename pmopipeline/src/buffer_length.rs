//! Longueur de buffer exprimée en frames ou en durée

/// Longueur d'un buffer audio, en frames ou en secondes
///
/// La conversion vers l'autre unité dépend du taux d'échantillonnage ; si
/// l'unité stockée est celle demandée, le taux passé est ignoré.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BufferLength {
    /// Longueur en nombre de frames
    Frames(u32),
    /// Longueur en secondes
    Time(f64),
}

impl BufferLength {
    /// Longueur en frames au taux donné
    pub fn frames(&self, sample_rate: u32) -> u32 {
        match *self {
            BufferLength::Frames(frames) => frames,
            BufferLength::Time(seconds) => (seconds * sample_rate as f64) as u32,
        }
    }

    /// Longueur en secondes au taux donné
    ///
    /// Retourne 0.0 pour une longueur en frames avec un taux nul.
    pub fn duration(&self, sample_rate: u32) -> f64 {
        match *self {
            BufferLength::Frames(frames) => {
                if sample_rate == 0 {
                    0.0
                } else {
                    frames as f64 / sample_rate as f64
                }
            }
            BufferLength::Time(seconds) => seconds,
        }
    }

    /// Vrai si la longueur est nulle
    pub fn is_nil(&self) -> bool {
        match *self {
            BufferLength::Frames(frames) => frames == 0,
            BufferLength::Time(seconds) => seconds <= 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_ignores_rate() {
        let len = BufferLength::Frames(512);
        assert_eq!(len.frames(48_000), 512);
        assert_eq!(len.frames(0), 512);
    }

    #[test]
    fn test_time_to_frames() {
        let len = BufferLength::Time(0.5);
        assert_eq!(len.frames(48_000), 24_000);
        assert!((len.duration(0) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_frames_to_duration() {
        let len = BufferLength::Frames(24_000);
        assert!((len.duration(48_000) - 0.5).abs() < f64::EPSILON);
        assert_eq!(len.duration(0), 0.0);
    }

    #[test]
    fn test_nil() {
        assert!(BufferLength::Frames(0).is_nil());
        assert!(BufferLength::Time(0.0).is_nil());
        assert!(!BufferLength::Frames(1).is_nil());
    }
}
