//! Per-run index over MS1 peaks.
//!
//! Peaks are stored once, in an arena ordered by scan, and referenced
//! everywhere else through [`PeakIx`] handles. Handles remain valid across
//! [`PeakIndex::spill`] and [`PeakIndex::restore`], since the arena is written
//! and read back in the same order.
//!
//! Lookup bins the arena by m/z ([`BINS_PER_DALTON`] bins per Dalton); within a
//! bin, handles are sorted by scan index, so a tolerance query touches a
//! handful of bins and binary-searches each one for the requested scan.

use crate::mass::{to_mz, Tolerance};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

pub const BINS_PER_DALTON: f64 = 100.0;

/// Peaks above this m/z are not indexed
pub const MAX_MZ: f64 = 20_000.0;

static SPILL_SERIAL: AtomicUsize = AtomicUsize::new(0);

/// Handle to an [`IndexedPeak`] inside a [`PeakIndex`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeakIx(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexedPeak {
    pub mz: f64,
    pub intensity: f64,
    /// Zero-based MS1 scan index
    pub scan: u32,
    pub retention_time: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanInfo {
    /// Native (one-based) scan number
    pub scan_number: u32,
    /// Zero-based index among MS1 scans
    pub index: usize,
    pub retention_time: f64,
}

/// A centroided MS1 spectrum, as handed to us by a raw-file reader
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ms1Scan {
    pub scan_number: u32,
    /// Retention time, in minutes
    pub retention_time: f64,
    pub mz: Vec<f64>,
    pub intensity: Vec<f64>,
}

pub struct PeakIndex {
    name: String,
    peaks: Vec<IndexedPeak>,
    bins: Vec<Vec<PeakIx>>,
    scans: Vec<ScanInfo>,
    spilled: Option<PathBuf>,
}

impl PeakIndex {
    /// Index all peaks of `scans`, which must be ordered by retention time.
    pub fn build(name: &str, scans: &[Ms1Scan]) -> Result<Self> {
        let mut peaks = Vec::new();
        let mut infos = Vec::with_capacity(scans.len());
        let mut out_of_range = 0;

        for (index, scan) in scans.iter().enumerate() {
            infos.push(ScanInfo {
                scan_number: scan.scan_number,
                index,
                retention_time: scan.retention_time,
            });
            for (&mz, &intensity) in scan.mz.iter().zip(scan.intensity.iter()) {
                if mz > MAX_MZ {
                    out_of_range += 1;
                    continue;
                }
                if mz > 0.0 && mz.is_finite() && intensity.is_finite() && intensity >= 0.0 {
                    peaks.push(IndexedPeak {
                        mz,
                        intensity,
                        scan: index as u32,
                        retention_time: scan.retention_time,
                    });
                }
            }
        }

        if out_of_range > 0 {
            log::warn!("{}: ignored {} peaks above {} m/z", name, out_of_range, MAX_MZ);
        }
        if peaks.is_empty() {
            return Err(Error::EmptyRun { file: name.into() });
        }

        let mut index = PeakIndex {
            name: name.into(),
            peaks,
            bins: Vec::new(),
            scans: infos,
            spilled: None,
        };
        index.bin();
        log::debug!(
            "{}: indexed {} peaks across {} MS1 scans",
            index.name,
            index.peaks.len(),
            index.scans.len()
        );
        Ok(index)
    }

    fn bin(&mut self) {
        let max_mz = self.peaks.iter().map(|p| p.mz).fold(0.0, f64::max);
        let mut bins = vec![Vec::new(); (max_mz * BINS_PER_DALTON).ceil() as usize + 1];
        // Arena is ordered by scan, so each bin ends up ordered by scan too
        for (ix, peak) in self.peaks.iter().enumerate() {
            let bin = (peak.mz * BINS_PER_DALTON).round() as usize;
            bins[bin].push(PeakIx(ix as u32));
        }
        self.bins = bins;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scans(&self) -> &[ScanInfo] {
        &self.scans
    }

    pub fn is_loaded(&self) -> bool {
        !self.bins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub fn peak(&self, ix: PeakIx) -> &IndexedPeak {
        &self.peaks[ix.0 as usize]
    }

    /// Zero-based index of the last scan eluting strictly before `rt`
    pub fn scan_before(&self, rt: f64) -> Option<usize> {
        self.scans
            .partition_point(|s| s.retention_time < rt)
            .checked_sub(1)
    }

    /// Inclusive range of scan indices covering [`lo`, `hi`]: from the last
    /// scan at or before `lo`, to the first scan at or after `hi`
    pub fn scans_covering(&self, lo: f64, hi: f64) -> Option<(usize, usize)> {
        if self.scans.is_empty() {
            return None;
        }
        let (left, right) = binary_search_slice(
            &self.scans,
            |s, rt| s.retention_time.total_cmp(rt),
            lo,
            hi,
        );
        let start = (left..right.min(self.scans.len()))
            .take_while(|&i| self.scans[i].retention_time <= lo)
            .last()
            .unwrap_or(left);
        let end = (start..self.scans.len())
            .find(|&i| self.scans[i].retention_time >= hi)
            .unwrap_or(self.scans.len() - 1);
        Some((start, end))
    }

    fn bins_in_range(&self, mz: f64, tolerance: Tolerance) -> impl Iterator<Item = &[PeakIx]> {
        let (lo, hi) = tolerance.bounds(mz);
        let lo = ((lo * BINS_PER_DALTON).floor().max(0.0)) as usize;
        let hi = ((hi * BINS_PER_DALTON).ceil().max(0.0)) as usize;
        let hi = hi.min(self.bins.len().saturating_sub(1));
        self.bins
            .get(lo..=hi)
            .unwrap_or(&[])
            .iter()
            .map(|bin| bin.as_slice())
    }

    /// Closest peak (in m/z) to `mz` at exactly `scan`, within `tolerance`.
    pub fn get(&self, mz: f64, scan: usize, tolerance: Tolerance) -> Option<PeakIx> {
        let mut best: Option<(PeakIx, f64)> = None;
        for bin in self.bins_in_range(mz, tolerance) {
            let start = bin.partition_point(|&ix| (self.peak(ix).scan as usize) < scan);
            for &ix in &bin[start..] {
                let peak = self.peak(ix);
                if peak.scan as usize != scan {
                    break;
                }
                if !tolerance.contains(mz, peak.mz) {
                    continue;
                }
                let delta = (peak.mz - mz).abs();
                if best.map(|(_, d)| delta < d).unwrap_or(true) {
                    best = Some((ix, delta));
                }
            }
        }
        best.map(|(ix, _)| ix)
    }

    /// Lookup by neutral mass for an ion of `charge`
    pub fn get_mass(
        &self,
        mass: f64,
        charge: u8,
        scan: usize,
        tolerance: Tolerance,
    ) -> Option<PeakIx> {
        self.get(to_mz(mass, charge), scan, tolerance)
    }

    /// Extracted ion chromatogram starting at `start`. The walk goes forward
    /// (including `start`), then backward from `start - 1`, following the m/z
    /// of the most recent match. A direction stops once more than
    /// `missed_scans_allowed` consecutive scans lack a match; scans without a
    /// match at the start of the forward walk count against the backward
    /// walk too, so no gap in the result exceeds the allowance. If the
    /// forward walk finds nothing, the backward walk starts afresh.
    /// Returned peaks are ordered by retention time.
    pub fn xic(
        &self,
        mz: f64,
        start: usize,
        tolerance: Tolerance,
        missed_scans_allowed: usize,
    ) -> Vec<PeakIx> {
        let mut xic = Vec::new();
        if start >= self.scans.len() {
            return xic;
        }

        let mut center = mz;
        let mut missed = 0;
        let mut leading_misses = None;
        for scan in start..self.scans.len() {
            match self.get(center, scan, tolerance) {
                Some(ix) => {
                    leading_misses.get_or_insert(missed);
                    missed = 0;
                    center = self.peak(ix).mz;
                    xic.push(ix);
                }
                None => missed += 1,
            }
            if missed > missed_scans_allowed {
                break;
            }
        }

        let mut center = mz;
        let mut missed = leading_misses.unwrap_or(0);
        for scan in (0..start).rev() {
            match self.get(center, scan, tolerance) {
                Some(ix) => {
                    missed = 0;
                    center = self.peak(ix).mz;
                    xic.push(ix);
                }
                None => missed += 1,
            }
            if missed > missed_scans_allowed {
                break;
            }
        }

        xic.sort_by(|a, b| {
            self.peak(*a)
                .retention_time
                .total_cmp(&self.peak(*b).retention_time)
        });
        xic
    }

    /// Drop all peaks and bins. Scan metadata is retained.
    pub fn clear(&mut self) {
        self.peaks = Vec::new();
        self.bins = Vec::new();
    }

    /// Write the peak arena to a run-scoped file under `directory`, then clear
    /// the in-memory index. The file is deleted by [`PeakIndex::restore`].
    pub fn spill<P: AsRef<Path>>(&mut self, directory: P, run: usize) -> Result<PathBuf> {
        let stem = self
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect::<String>();
        // Several engines may spill the same run concurrently
        let serial = SPILL_SERIAL.fetch_add(1, AtomicOrdering::Relaxed);
        let path = directory.as_ref().join(format!(
            "lumen_{}_{}_{}_{}.ind",
            std::process::id(),
            serial,
            run,
            stem
        ));

        let mut wtr = BufWriter::new(std::fs::File::create(&path)?);
        bincode::serialize_into(&mut wtr, &self.peaks)?;
        wtr.flush()?;

        self.clear();
        self.spilled = Some(path.clone());
        Ok(path)
    }

    /// Rehydrate a spilled index and delete the spill file. A no-op if the
    /// index is already loaded.
    pub fn restore(&mut self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        let path = self.spilled.clone().ok_or(Error::IndexNotLoaded)?;

        let rdr = BufReader::new(std::fs::File::open(&path)?);
        let peaks: Vec<IndexedPeak> = bincode::deserialize_from(rdr)?;

        let consistent = peaks.iter().all(|p| {
            self.scans
                .get(p.scan as usize)
                .map(|s| s.retention_time == p.retention_time)
                .unwrap_or(false)
        });
        if peaks.is_empty() || !consistent {
            return Err(Error::CorruptIndex { path });
        }
        self.peaks = peaks;
        self.bin();
        self.spilled = None;
        std::fs::remove_file(&path)?;
        Ok(())
    }
}

impl std::ops::Index<PeakIx> for PeakIndex {
    type Output = IndexedPeak;

    fn index(&self, index: PeakIx) -> &Self::Output {
        self.peak(index)
    }
}

impl Drop for PeakIndex {
    fn drop(&mut self) {
        if let Some(path) = self.spilled.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Return the widest `left` and `right` indices into a `slice` (sorted by the
/// function `key`) such that all values between `low` and `high` are
/// contained in `slice[left..right]`
///
/// # Invariants
///
/// * `slice[left] <= low || left == 0`
/// * `slice[right] <= high && (slice[right+1] > high || right == slice.len())`
/// * `0 <= left <= right <= slice.len()`
#[inline]
pub fn binary_search_slice<T, F, S>(slice: &[T], key: F, low: S, high: S) -> (usize, usize)
where
    F: Fn(&T, &S) -> Ordering,
{
    let left_idx = match slice.binary_search_by(|a| key(a, &low)) {
        Ok(idx) | Err(idx) => {
            let mut idx = idx.saturating_sub(1);
            while idx > 0 && key(&slice[idx], &low) != Ordering::Less {
                idx -= 1;
            }
            idx
        }
    };

    let right_idx = match slice[left_idx..].binary_search_by(|a| key(a, &high)) {
        Ok(idx) | Err(idx) => {
            let mut idx = idx + left_idx;
            while idx < slice.len() && key(&slice[idx], &high) != Ordering::Greater {
                idx = idx.saturating_add(1);
            }
            idx.min(slice.len())
        }
    };
    (left_idx, right_idx)
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn scans(n: usize, present: impl Fn(usize) -> bool) -> Vec<Ms1Scan> {
        (0..n)
            .map(|i| {
                let (mz, intensity) = if present(i) {
                    (vec![500.0, 500.004, 750.0], vec![100.0, 50.0, 10.0])
                } else {
                    (vec![750.0], vec![10.0])
                };
                Ms1Scan {
                    scan_number: i as u32 + 1,
                    retention_time: 1.0 + i as f64 * 0.1,
                    mz,
                    intensity,
                }
            })
            .collect()
    }

    #[test]
    fn binary_search_slice_smoke() {
        // Make sure that our query returns the maximal set of indices
        let data = [1.0, 1.5, 2.0, 2.5, 3.0, 3.5, 4.0];
        let bounds = binary_search_slice(&data, |a: &f64, b| a.total_cmp(b), 1.75, 3.5);
        assert_eq!(bounds, (1, 6));
        assert!(data[bounds.0] <= 1.75);
        assert_eq!(&data[bounds.0..bounds.1], &[1.5, 2.0, 2.5, 3.0, 3.5]);

        let bounds = binary_search_slice(&data, |a: &f64, b| a.total_cmp(b), 0.0, 5.0);
        assert_eq!(bounds, (0, data.len()));
    }

    #[test]
    fn empty_run() {
        let err = PeakIndex::build("empty", &[Ms1Scan::default()]);
        assert!(matches!(err, Err(Error::EmptyRun { .. })));
    }

    #[test]
    fn closest_peak_at_scan() {
        let index = PeakIndex::build("run", &scans(5, |_| true)).unwrap();
        let ix = index.get(500.003, 2, Tolerance::ppm(10.0)).unwrap();
        assert_eq!(index[ix].mz, 500.004);
        assert_eq!(index[ix].scan, 2);
        assert_eq!(index[ix].retention_time, 1.2);

        let ix = index.get(500.001, 4, Tolerance::ppm(10.0)).unwrap();
        assert_eq!(index[ix].mz, 500.0);

        assert!(index.get(500.1, 2, Tolerance::ppm(10.0)).is_none());
        assert!(index.get(500.0, 10, Tolerance::ppm(10.0)).is_none());
        assert!(index.get(10_000.0, 0, Tolerance::ppm(10.0)).is_none());
    }

    #[test]
    fn scan_lookup_by_rt() {
        let index = PeakIndex::build("run", &scans(5, |_| true)).unwrap();
        assert_eq!(index.scan_before(1.0), None);
        assert_eq!(index.scan_before(1.001), Some(0));
        assert_eq!(index.scan_before(1.25), Some(2));
        assert_eq!(index.scan_before(9.0), Some(4));

        assert_eq!(index.scans_covering(1.15, 1.25), Some((1, 3)));
        assert_eq!(index.scans_covering(0.0, 9.0), Some((0, 4)));
    }

    #[test]
    fn xic_respects_missed_scans() {
        // Present at 0..=3, absent at 4 & 5, present again at 6..=9
        let index = PeakIndex::build("run", &scans(10, |i| i != 4 && i != 5)).unwrap();
        let xic = index.xic(500.0, 2, Tolerance::ppm(10.0), 1);
        let found = xic.iter().map(|&ix| index[ix].scan).collect::<Vec<_>>();
        assert_eq!(found, vec![0, 1, 2, 3]);

        let xic = index.xic(500.0, 2, Tolerance::ppm(10.0), 2);
        assert_eq!(xic.len(), 8);

        // Start scan is empty: the forward walk's misses count backwards too
        let index = PeakIndex::build("run", &scans(10, |i| i != 4 && i != 3)).unwrap();
        let xic = index.xic(500.0, 4, Tolerance::ppm(10.0), 1);
        let found = xic.iter().map(|&ix| index[ix].scan).collect::<Vec<_>>();
        assert_eq!(found, vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn xic_walks_back_from_empty_start() {
        // Signal ends one scan before the start
        let index = PeakIndex::build("run", &scans(10, |i| i <= 4)).unwrap();
        let xic = index.xic(500.0, 5, Tolerance::ppm(10.0), 1);
        let found = xic.iter().map(|&ix| index[ix].scan).collect::<Vec<_>>();
        assert_eq!(found, vec![0, 1, 2, 3, 4]);

        // Two empty scans before the signal is still within reach backwards
        let xic = index.xic(500.0, 6, Tolerance::ppm(10.0), 1);
        assert_eq!(xic.len(), 5);
        let xic = index.xic(500.0, 7, Tolerance::ppm(10.0), 1);
        assert!(xic.is_empty());
    }

    #[test]
    fn unusable_peaks_are_not_indexed() {
        let mut raw = scans(3, |_| true);
        raw[1].mz.push(1e9);
        raw[1].intensity.push(10.0);
        raw[2].mz.push(600.0);
        raw[2].intensity.push(-5.0);
        let index = PeakIndex::build("run", &raw).unwrap();
        assert_eq!(index.len(), 9);
        assert!(index.get(600.0, 2, Tolerance::ppm(10.0)).is_none());
        assert!(index.get(1e9, 1, Tolerance::ppm(10.0)).is_none());
        assert!((0..index.len()).all(|i| index[PeakIx(i as u32)].intensity >= 0.0));
    }

    #[test]
    fn spill_and_restore() {
        let mut index = PeakIndex::build("run/with:odd name", &scans(5, |_| true)).unwrap();
        let before = index.get(500.0, 3, Tolerance::ppm(10.0)).unwrap();

        let path = index.spill(std::env::temp_dir(), 7).unwrap();
        assert!(path.exists());
        assert!(!index.is_loaded());
        assert!(index.get(500.0, 3, Tolerance::ppm(10.0)).is_none());
        assert_eq!(index.scans().len(), 5);

        index.restore().unwrap();
        assert!(!path.exists());
        let after = index.get(500.0, 3, Tolerance::ppm(10.0)).unwrap();
        assert_eq!(before, after);
        assert_eq!(index[after].retention_time, 1.3);

        // Restoring twice is fine, restoring a cleared index is not
        index.restore().unwrap();
        index.clear();
        assert!(matches!(index.restore(), Err(Error::IndexNotLoaded)));
    }

    #[test]
    fn damaged_spill_files_are_rejected() {
        let mut index = PeakIndex::build("damaged", &scans(5, |_| true)).unwrap();
        let path = index.spill(std::env::temp_dir(), 0).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(matches!(index.restore(), Err(Error::Bincode(_))));

        // Well-formed, but pointing at a scan the run doesn't have
        let stray = vec![IndexedPeak {
            mz: 500.0,
            intensity: 1.0,
            scan: 99,
            retention_time: 1.0,
        }];
        std::fs::write(&path, bincode::serialize(&stray).unwrap()).unwrap();
        assert!(matches!(index.restore(), Err(Error::CorruptIndex { .. })));
        assert!(!index.is_loaded());
    }

    #[quickcheck]
    fn lookup_within_tolerance(offset: u16, ppm: u8) -> bool {
        let ppm = (ppm % 50) as f64 + 1.0;
        let query = 499.99 + (offset % 2000) as f64 * 0.00001;
        let index = PeakIndex::build("run", &scans(3, |_| true)).unwrap();
        let tolerance = Tolerance::ppm(ppm);
        match index.get(query, 1, tolerance) {
            Some(ix) => tolerance.contains(query, index[ix].mz),
            None => [500.0, 500.004]
                .iter()
                .all(|&mz| !tolerance.contains(query, mz)),
        }
    }

    #[quickcheck]
    fn xic_gaps_bounded(mask: u32, start: u8, allowed: u8) -> bool {
        let allowed = (allowed % 3) as usize;
        let index = match PeakIndex::build("run", &scans(32, |i| mask & (1 << i) != 0)) {
            Ok(index) => index,
            Err(_) => return true,
        };
        let xic = index.xic(500.0, (start % 32) as usize, Tolerance::ppm(5.0), allowed);
        xic.windows(2)
            .all(|w| (index[w[1]].scan - index[w[0]].scan) as usize <= allowed + 1)
    }
}
