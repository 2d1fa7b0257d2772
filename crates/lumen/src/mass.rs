use serde::{Deserialize, Serialize};
use std::iter::Sum;

pub const PROTON: f64 = 1.007276466812;
/// Mass difference between carbon-13 and carbon-12
pub const C13_C12: f64 = 1.0033548378;

#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum Tolerance {
    Ppm(f64, f64),
    Da(f64, f64),
}

impl Tolerance {
    /// Symmetric ppm tolerance
    pub fn ppm(ppm: f64) -> Self {
        Tolerance::Ppm(-ppm.abs(), ppm.abs())
    }

    /// Compute the (`lower`, `upper`) window (in Da) for for a monoisotopic
    /// mass and a given tolerance
    pub fn bounds(&self, center: f64) -> (f64, f64) {
        match self {
            Tolerance::Ppm(lo, hi) => {
                let delta_lo = center * lo / 1_000_000.0;
                let delta_hi = center * hi / 1_000_000.0;
                (center + delta_lo, center + delta_hi)
            }
            Tolerance::Da(lo, hi) => (center + lo, center + hi),
        }
    }

    pub fn contains(&self, center: f64, rhs: f64) -> bool {
        let (lo, hi) = self.bounds(center);
        rhs >= lo && rhs <= hi
    }
}

/// Convert a neutral mass to the m/z of a protonated ion
#[inline]
pub fn to_mz(mass: f64, charge: u8) -> f64 {
    mass / charge as f64 + PROTON
}

/// Convert the m/z of a protonated ion back to its neutral mass
#[inline]
pub fn to_mass(mz: f64, charge: u8) -> f64 {
    (mz - PROTON) * charge as f64
}

/// Signed mass error of `observed` relative to `theoretical`, in ppm
#[inline]
pub fn ppm_error(observed: f64, theoretical: f64) -> f64 {
    (observed - theoretical) / theoretical * 1e6
}

/// Elemental composition restricted to the elements that make up peptides
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Composition {
    pub carbon: i32,
    pub hydrogen: i32,
    pub nitrogen: i32,
    pub oxygen: i32,
    pub sulfur: i32,
}

impl Composition {
    pub const fn new(carbon: i32, hydrogen: i32, nitrogen: i32, oxygen: i32, sulfur: i32) -> Self {
        Self {
            carbon,
            hydrogen,
            nitrogen,
            oxygen,
            sulfur,
        }
    }

    pub const WATER: Composition = Composition::new(0, 2, 0, 1, 0);

    /// Composition of an unmodified peptide: residues plus one water.
    /// Returns `None` if the sequence contains a residue we don't know the
    /// formula for
    pub fn peptide(sequence: &str) -> Option<Self> {
        let mut comp = sequence
            .bytes()
            .map(residue_composition)
            .sum::<Option<Composition>>()?;
        comp += Composition::WATER;
        Some(comp)
    }
}

impl std::ops::AddAssign for Composition {
    fn add_assign(&mut self, rhs: Self) {
        self.carbon += rhs.carbon;
        self.hydrogen += rhs.hydrogen;
        self.nitrogen += rhs.nitrogen;
        self.oxygen += rhs.oxygen;
        self.sulfur += rhs.sulfur;
    }
}

impl Sum for Composition {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        let mut comp = Composition::default();
        for i in iter {
            comp += i;
        }
        comp
    }
}

/// Elemental composition of an amino acid residue (i.e. minus water)
pub fn residue_composition(residue: u8) -> Option<Composition> {
    let comp = match residue {
        b'G' => Composition::new(2, 3, 1, 1, 0),
        b'A' => Composition::new(3, 5, 1, 1, 0),
        b'S' => Composition::new(3, 5, 1, 2, 0),
        b'P' => Composition::new(5, 7, 1, 1, 0),
        b'V' => Composition::new(5, 9, 1, 1, 0),
        b'T' => Composition::new(4, 7, 1, 2, 0),
        b'C' => Composition::new(3, 5, 1, 1, 1),
        b'L' | b'I' => Composition::new(6, 11, 1, 1, 0),
        b'N' => Composition::new(4, 6, 2, 2, 0),
        b'D' => Composition::new(4, 5, 1, 3, 0),
        b'Q' => Composition::new(5, 8, 2, 2, 0),
        b'K' => Composition::new(6, 12, 2, 1, 0),
        b'E' => Composition::new(5, 7, 1, 3, 0),
        b'M' => Composition::new(5, 9, 1, 1, 1),
        b'H' => Composition::new(6, 7, 3, 1, 0),
        b'F' => Composition::new(9, 9, 1, 1, 0),
        b'R' => Composition::new(6, 12, 4, 1, 0),
        b'Y' => Composition::new(9, 9, 1, 2, 0),
        b'W' => Composition::new(11, 10, 2, 1, 0),
        _ => return None,
    };
    Some(comp)
}
