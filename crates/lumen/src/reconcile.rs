//! Resolve peaks within one run that claim the same apex signal

use crate::engine::Identification;
use crate::index::PeakIx;
use crate::peak::ChromatographicPeak;
use fnv::FnvHashMap;

/// Whether an MS2 peak is a real quantification target
fn is_quantifiable(peak: &ChromatographicPeak, ids: &[Identification]) -> bool {
    peak.first_identification(ids)
        .map(|id| !id.decoy && id.use_for_quant)
        .unwrap_or(false)
}

fn same_sequence(a: &ChromatographicPeak, b: &ChromatographicPeak, ids: &[Identification]) -> bool {
    match (a.first_identification(ids), b.first_identification(ids)) {
        (Some(a), Some(b)) => a.modified_sequence == b.modified_sequence,
        _ => false,
    }
}

/// Drop peaks without envelopes, then arbitrate between peaks sharing an
/// apex:
///
/// * MS2 peaks are merged with each other
/// * An MBR peak loses to an MS2 peak, unless the MS2 peak is a decoy or not
///   a quantification target, in which case it replaces it
/// * MBR peaks for the same sequence are merged, otherwise the higher score
///   wins
///
/// MS2 peaks are visited before MBR peaks; otherwise, input order is kept.
pub fn reconcile(
    peaks: Vec<ChromatographicPeak>,
    integrate: bool,
    ids: &[Identification],
) -> Vec<ChromatographicPeak> {
    let total = peaks.len();
    let mut peaks = peaks
        .into_iter()
        .filter(|p| !p.envelopes.is_empty())
        .collect::<Vec<_>>();
    // Stable, so that ties keep their input order
    peaks.sort_by_key(|p| p.is_mbr());

    let mut slots: Vec<ChromatographicPeak> = Vec::with_capacity(peaks.len());
    let mut by_apex: FnvHashMap<PeakIx, usize> = FnvHashMap::default();

    for mut peak in peaks {
        peak.resolve_identifications(ids);
        peak.calculate_intensity(integrate, ids);
        let apex = match peak.apex {
            Some(apex) => apex.ix,
            None => continue,
        };

        let slot = match by_apex.get(&apex) {
            Some(&slot) => slot,
            None => {
                by_apex.insert(apex, slots.len());
                slots.push(peak);
                continue;
            }
        };

        let stored = &mut slots[slot];
        match (stored.is_mbr(), peak.is_mbr()) {
            (false, false) => stored.merge(peak, integrate, ids),
            (false, true) => {
                if !is_quantifiable(stored, ids) {
                    *stored = peak;
                }
            }
            (true, true) => {
                if same_sequence(stored, &peak, ids) {
                    stored.merge(peak, integrate, ids);
                } else if peak.score() > stored.score() {
                    *stored = peak;
                }
            }
            // Not reached, since MS2 peaks are all visited first
            (true, false) => *stored = peak,
        }

        // A merge can move the apex
        if let Some(moved) = slots[slot].apex.map(|a| a.ix) {
            if moved != apex {
                by_apex.entry(moved).or_insert(slot);
            }
        }
    }

    log::trace!("reconciled {} peaks into {}", total, slots.len());
    slots
}
