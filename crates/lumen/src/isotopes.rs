//! Theoretical isotope envelopes.
//!
//! Isotope abundances are computed by convolving per-element isotope patterns
//! at nominal mass offsets, tracking the abundance-weighted mean mass at each
//! offset. Element data is supplied as an [`ElementTable`] value rather than
//! read from global state, so that different tables can coexist (e.g. labeled
//! media, test fixtures).

use crate::mass::Composition;
use serde::{Deserialize, Serialize};

/// Isotopes contributing less than this (relative to the total) are dropped
const PRUNE: f64 = 1e-8;
/// Hard cap on the number of nominal offsets tracked
const MAX_OFFSETS: usize = 64;
/// Isotopes beyond the minimum required are kept if their normalized abundance exceeds this
const MIN_NORMALIZED_ABUNDANCE: f64 = 0.1;
/// Unknown mass deltas (e.g. unlisted modifications) above this are filled with averagine
const AVERAGINE_FILL_THRESHOLD: f64 = 20.0;

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Isotope {
    pub mass: f64,
    pub abundance: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Element {
    C,
    H,
    N,
    O,
    S,
}

impl Element {
    const ALL: [Element; 5] = [Element::C, Element::H, Element::N, Element::O, Element::S];

    fn count(self, comp: &Composition) -> i32 {
        match self {
            Element::C => comp.carbon,
            Element::H => comp.hydrogen,
            Element::N => comp.nitrogen,
            Element::O => comp.oxygen,
            Element::S => comp.sulfur,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementData {
    /// Isotopes, lightest first
    pub isotopes: Vec<Isotope>,
    pub average_mass: f64,
}

/// Immutable table of isotope masses and natural abundances
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementTable {
    pub carbon: ElementData,
    pub hydrogen: ElementData,
    pub nitrogen: ElementData,
    pub oxygen: ElementData,
    pub sulfur: ElementData,
}

impl ElementTable {
    /// IUPAC natural isotope abundances
    pub fn natural() -> Self {
        let iso = |mass, abundance| Isotope { mass, abundance };
        Self {
            carbon: ElementData {
                isotopes: vec![iso(12.0, 0.9893), iso(13.0033548378, 0.0107)],
                average_mass: 12.0107,
            },
            hydrogen: ElementData {
                isotopes: vec![iso(1.00782503207, 0.999885), iso(2.0141017778, 0.000115)],
                average_mass: 1.00794,
            },
            nitrogen: ElementData {
                isotopes: vec![iso(14.0030740048, 0.99636), iso(15.0001088982, 0.00364)],
                average_mass: 14.0067,
            },
            oxygen: ElementData {
                isotopes: vec![
                    iso(15.99491461956, 0.99757),
                    iso(16.99913170, 0.00038),
                    iso(17.9991610, 0.00205),
                ],
                average_mass: 15.9994,
            },
            sulfur: ElementData {
                isotopes: vec![
                    iso(31.97207100, 0.9499),
                    iso(32.97145876, 0.0075),
                    iso(33.96786690, 0.0425),
                    iso(35.96708076, 0.0001),
                ],
                average_mass: 32.065,
            },
        }
    }

    pub fn element(&self, element: Element) -> &ElementData {
        match element {
            Element::C => &self.carbon,
            Element::H => &self.hydrogen,
            Element::N => &self.nitrogen,
            Element::O => &self.oxygen,
            Element::S => &self.sulfur,
        }
    }

    pub fn monoisotopic_mass(&self, comp: &Composition) -> f64 {
        Element::ALL
            .iter()
            .map(|&e| e.count(comp) as f64 * self.element(e).isotopes[0].mass)
            .sum()
    }
}

impl Default for ElementTable {
    fn default() -> Self {
        Self::natural()
    }
}

/// Average elemental composition of one amino acid residue
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Averagine {
    pub carbon: f64,
    pub hydrogen: f64,
    pub nitrogen: f64,
    pub oxygen: f64,
    pub sulfur: f64,
}

impl Default for Averagine {
    fn default() -> Self {
        Self {
            carbon: 4.9384,
            hydrogen: 7.7583,
            nitrogen: 1.3577,
            oxygen: 1.4773,
            sulfur: 0.0417,
        }
    }
}

impl Averagine {
    pub fn residue_mass(&self, table: &ElementTable) -> f64 {
        table.carbon.average_mass * self.carbon
            + table.hydrogen.average_mass * self.hydrogen
            + table.nitrogen.average_mass * self.nitrogen
            + table.oxygen.average_mass * self.oxygen
            + table.sulfur.average_mass * self.sulfur
    }

    /// Closest whole-atom averagine composition for `mass`. Negative masses
    /// produce negative counts, which callers use to subtract atoms
    pub fn composition(&self, table: &ElementTable, mass: f64) -> Composition {
        let n = mass / self.residue_mass(table);
        Composition::new(
            (n * self.carbon).round() as i32,
            (n * self.hydrogen).round() as i32,
            (n * self.nitrogen).round() as i32,
            (n * self.oxygen).round() as i32,
            (n * self.sulfur).round() as i32,
        )
    }
}

/// Abundance and mean mass at each nominal mass offset from the monoisotopic peak
#[derive(Clone, Debug, PartialEq)]
pub struct IsotopeDistribution {
    pub peaks: Vec<Isotope>,
}

impl IsotopeDistribution {
    pub fn new(table: &ElementTable, comp: &Composition) -> Self {
        let mut peaks = vec![Isotope {
            mass: 0.0,
            abundance: 1.0,
        }];

        for element in Element::ALL {
            let data = table.element(element);
            let base = data.isotopes[0].mass;
            let atom = data
                .isotopes
                .iter()
                .map(|iso| ((iso.mass - base).round() as usize, *iso))
                .collect::<Vec<_>>();

            for _ in 0..element.count(comp).max(0) {
                peaks = convolve(&peaks, &atom);
            }
        }

        Self { peaks }
    }
}

fn convolve(dist: &[Isotope], atom: &[(usize, Isotope)]) -> Vec<Isotope> {
    let width = atom.iter().map(|(offset, _)| *offset).max().unwrap_or(0);
    let mut abundance = vec![0.0; dist.len() + width];
    let mut mass = vec![0.0; dist.len() + width];

    for (k, a) in dist.iter().enumerate() {
        for (offset, b) in atom {
            let w = a.abundance * b.abundance;
            abundance[k + offset] += w;
            mass[k + offset] += w * (a.mass + b.mass);
        }
    }

    let total = abundance.iter().sum::<f64>();
    let mut out = abundance
        .into_iter()
        .zip(mass)
        .map(|(abundance, mass)| Isotope {
            mass: if abundance > 0.0 { mass / abundance } else { 0.0 },
            abundance,
        })
        .collect::<Vec<_>>();

    while out.len() > 1
        && out
            .last()
            .map(|iso| iso.abundance / total < PRUNE)
            .unwrap_or(false)
    {
        out.pop();
    }
    out.truncate(MAX_OFFSETS);
    out
}

/// The isotopes we expect to observe for one analyte, as mass shifts from
/// the monoisotopic mass and abundances normalized to the most abundant isotope
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TheoreticalEnvelope {
    pub shifts: Vec<f64>,
    pub abundances: Vec<f64>,
    /// Index of the most abundant isotope, which is used for peakfinding
    pub peakfinding_index: usize,
}

impl TheoreticalEnvelope {
    /// Build the envelope for an analyte of `monoisotopic_mass`. An explicit
    /// `formula` takes precedence; otherwise the composition is derived from
    /// `base_sequence` and any large unexplained mass delta is filled with
    /// averagine. Without a usable sequence, pure averagine is used.
    pub fn new(
        table: &ElementTable,
        averagine: &Averagine,
        monoisotopic_mass: f64,
        formula: Option<&Composition>,
        base_sequence: &str,
        num_isotopes_required: usize,
    ) -> Self {
        let formula = match formula {
            Some(formula) => *formula,
            None => match Composition::peptide(base_sequence) {
                Some(mut comp) if !base_sequence.is_empty() => {
                    let delta = monoisotopic_mass - table.monoisotopic_mass(&comp);
                    if delta.abs() > AVERAGINE_FILL_THRESHOLD {
                        comp += averagine.composition(table, delta);
                        comp = clamp_non_negative(comp);
                    }
                    comp
                }
                _ => clamp_non_negative(averagine.composition(table, monoisotopic_mass)),
            },
        };

        let formula_mass = table.monoisotopic_mass(&formula);
        let distribution = IsotopeDistribution::new(table, &formula);

        let max = distribution
            .peaks
            .iter()
            .map(|iso| iso.abundance)
            .fold(0.0, f64::max);

        let mut shifts = Vec::new();
        let mut abundances = Vec::new();
        let mut peakfinding_index = 0;
        for iso in &distribution.peaks {
            let normalized = iso.abundance / max;
            if shifts.len() < num_isotopes_required || normalized > MIN_NORMALIZED_ABUNDANCE {
                if iso.abundance == max {
                    peakfinding_index = shifts.len();
                }
                // `iso.mass` is the mean mass of the whole molecule at this offset
                shifts.push(iso.mass - formula_mass);
                abundances.push(normalized);
            }
        }

        Self {
            shifts,
            abundances,
            peakfinding_index,
        }
    }

    /// Mass shift of the most abundant isotope relative to the monoisotopic mass
    pub fn peakfinding_shift(&self) -> f64 {
        self.shifts
            .get(self.peakfinding_index)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.shifts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shifts.is_empty()
    }
}

fn clamp_non_negative(comp: Composition) -> Composition {
    Composition::new(
        comp.carbon.max(0),
        comp.hydrogen.max(0),
        comp.nitrogen.max(0),
        comp.oxygen.max(0),
        comp.sulfur.max(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoke_isotopes() {
        let table = ElementTable::natural();
        let comp = Composition::peptide("PEPTIDE").unwrap();
        let mass = table.monoisotopic_mass(&comp);
        assert!((mass - 799.359964).abs() < 1e-4, "{}", mass);

        let env = TheoreticalEnvelope::new(&table, &Averagine::default(), mass, None, "PEPTIDE", 2);
        assert_eq!(env.peakfinding_index, 0);
        assert_eq!(env.abundances[0], 1.0);
        assert!(env.abundances[1] > 0.38 && env.abundances[1] < 0.43, "{:?}", env);
        assert!(env.abundances[2] > 0.09 && env.abundances[2] < 0.13, "{:?}", env);
        assert!(env.shifts[0].abs() < 1e-9);
        assert!((env.shifts[1] - 1.0031).abs() < 0.003, "{:?}", env.shifts);
    }

    #[test]
    fn averagine_fills_unknown_mass() {
        let table = ElementTable::natural();
        let avg = Averagine::default();

        // No sequence at all: everything is averagine
        let env = TheoreticalEnvelope::new(&table, &avg, 2000.0, None, "", 2);
        assert_eq!(env.peakfinding_index, 1);
        assert!((env.peakfinding_shift() - 1.003).abs() < 0.01);

        // A modification larger than the fill threshold shifts the envelope
        // towards heavier isotopes
        let comp = Composition::peptide("PEPTIDE").unwrap();
        let base = table.monoisotopic_mass(&comp);
        let plain = TheoreticalEnvelope::new(&table, &avg, base, None, "PEPTIDE", 2);
        let modified = TheoreticalEnvelope::new(&table, &avg, base + 500.0, None, "PEPTIDE", 2);
        assert!(modified.abundances[1] > plain.abundances[1]);
    }

    #[test]
    fn explicit_formula_wins() {
        let table = ElementTable::natural();
        let formula = Composition::new(2, 0, 0, 0, 0);
        let env =
            TheoreticalEnvelope::new(&table, &Averagine::default(), 24.0, Some(&formula), "PEPTIDE", 1);
        // C2: only the monoisotopic isotope has > 10% relative abundance
        assert_eq!(env.len(), 1);
        assert_eq!(env.peakfinding_index, 0);
    }

    #[test]
    fn custom_table_changes_distribution() {
        let mut table = ElementTable::natural();
        // Fully 13C-labeled carbon
        table.carbon.isotopes = vec![
            Isotope {
                mass: 12.0,
                abundance: 0.0,
            },
            Isotope {
                mass: 13.0033548378,
                abundance: 1.0,
            },
        ];
        let dist = IsotopeDistribution::new(&table, &Composition::new(3, 0, 0, 0, 0));
        let apex = dist
            .peaks
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abundance.total_cmp(&b.1.abundance))
            .map(|(i, _)| i);
        assert_eq!(apex, Some(3));
    }
}
