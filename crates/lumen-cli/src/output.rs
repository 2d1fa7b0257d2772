use lumen_core::engine::Identification;
use lumen_core::mass::to_mz;
use lumen_core::peak::ChromatographicPeak;
use lumen_core::results::LfqResults;
use rayon::prelude::*;

use crate::runner::Runner;

fn push_float(record: &mut csv::ByteRecord, value: f64) {
    record.push_field(ryu::Buffer::new().format(value).as_bytes());
}

fn push_optional(record: &mut csv::ByteRecord, value: Option<f64>) {
    match value {
        Some(value) => push_float(record, value),
        None => record.push_field(b""),
    }
}

/// Distinct values of `f` over the peak's identifications, `|`-separated
fn joined<'a, F>(peak: &ChromatographicPeak, ids: &'a [Identification], f: F) -> String
where
    F: Fn(&'a Identification) -> &'a str,
{
    let mut values = peak
        .identifications
        .iter()
        .filter_map(|ix| ids.get(ix.0 as usize))
        .map(f)
        .collect::<Vec<_>>();
    values.sort_unstable();
    values.dedup();
    values.join("|")
}

impl Runner {
    pub fn serialize_peak(
        &self,
        peak: &ChromatographicPeak,
        ids: &[Identification],
        filenames: &[&str],
    ) -> csv::ByteRecord {
        let mut record = csv::ByteRecord::new();
        let first = peak.first_identification(ids);

        record.push_field(filenames.get(peak.file).copied().unwrap_or_default().as_bytes());
        record.push_field(joined(peak, ids, |id| id.base_sequence.as_str()).as_bytes());
        record.push_field(joined(peak, ids, |id| id.modified_sequence.as_str()).as_bytes());
        let mut groups = peak
            .identifications
            .iter()
            .filter_map(|ix| ids.get(ix.0 as usize))
            .flat_map(|id| id.protein_groups.iter().map(String::as_str))
            .collect::<Vec<_>>();
        groups.sort_unstable();
        groups.dedup();
        record.push_field(groups.join(";").as_bytes());

        match first {
            Some(id) => {
                push_float(&mut record, id.monoisotopic_mass);
                push_float(&mut record, id.ms2_retention_time);
                record.push_field(itoa::Buffer::new().format(id.precursor_charge).as_bytes());
                push_float(&mut record, to_mz(id.monoisotopic_mass, id.precursor_charge));
            }
            None => {
                for _ in 0..4 {
                    record.push_field(b"");
                }
            }
        }

        push_float(&mut record, peak.intensity);
        let span = peak.rt_span();
        push_optional(&mut record, span.map(|s| s.0));
        push_optional(&mut record, peak.apex_rt());
        push_optional(&mut record, span.map(|s| s.1));
        push_optional(&mut record, peak.apex.map(|a| a.peak.mz));
        match peak.apex {
            Some(apex) => record.push_field(itoa::Buffer::new().format(apex.charge).as_bytes()),
            None => record.push_field(b""),
        }
        record.push_field(itoa::Buffer::new().format(peak.num_charge_states).as_bytes());
        record.push_field(peak.detection_type().as_str().as_bytes());
        push_optional(&mut record, peak.mbr.as_ref().map(|m| m.score));
        record.push_field(itoa::Buffer::new().format(peak.identifications.len()).as_bytes());
        record.push_field(itoa::Buffer::new().format(peak.unique_base_sequences).as_bytes());
        record.push_field(itoa::Buffer::new().format(peak.unique_full_sequences).as_bytes());
        push_optional(&mut record, peak.split_rt);
        push_float(&mut record, peak.mass_error);
        record.push_field(itoa::Buffer::new().format(first.map(|id| id.decoy as u8).unwrap_or(0)).as_bytes());
        record.push_field(
            itoa::Buffer::new()
                .format(peak.mbr.as_ref().map(|m| m.random_rt as u8).unwrap_or(0))
                .as_bytes(),
        );
        push_optional(&mut record, peak.mbr.as_ref().and_then(|m| m.pep));
        push_optional(&mut record, peak.mbr.as_ref().map(|m| m.q_value));
        record
    }

    /// Every reconciled peak, followed by the randomized retention time
    /// hypotheses used for FDR
    pub fn write_peaks(&self, results: &LfqResults) -> anyhow::Result<String> {
        let path = self.make_path("peaks.lumen.tsv");

        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(vec![]);

        let headers = csv::ByteRecord::from(vec![
            "file",
            "base_sequences",
            "full_sequences",
            "protein_groups",
            "monoisotopic_mass",
            "ms2_rt",
            "precursor_charge",
            "theoretical_mz",
            "intensity",
            "rt_start",
            "rt_apex",
            "rt_end",
            "apex_mz",
            "apex_charge",
            "num_charge_states",
            "detection_type",
            "mbr_score",
            "psms_mapped",
            "base_sequences_mapped",
            "full_sequences_mapped",
            "split_rt",
            "ppm_error",
            "decoy_peptide",
            "random_rt",
            "posterior_error",
            "q_value",
        ]);

        let filenames = results.files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
        wtr.write_byte_record(&headers)?;
        for record in results
            .peaks
            .par_iter()
            .chain(results.decoys.par_iter())
            .flat_map_iter(|run| run.iter())
            .map(|peak| self.serialize_peak(peak, &results.identifications, &filenames))
            .collect::<Vec<_>>()
        {
            wtr.write_byte_record(&record)?;
        }

        wtr.flush()?;
        let bytes = wtr.into_inner()?;
        std::fs::write(&path, bytes)?;
        Ok(path.display().to_string())
    }

    /// One row per peptide: intensity and detection type in every run
    pub fn write_quant(&self, results: &LfqResults) -> anyhow::Result<String> {
        let path = self.make_path("quant.lumen.tsv");

        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(vec![]);
        let mut headers = csv::ByteRecord::from(vec!["peptide", "base_sequence", "protein_groups"]);
        for file in &results.files {
            headers.push_field(format!("intensity_{}", file.name).as_bytes());
        }
        for file in &results.files {
            headers.push_field(format!("detection_type_{}", file.name).as_bytes());
        }
        wtr.write_byte_record(&headers)?;

        let records = results
            .peptides
            .par_iter()
            .map(|peptide| {
                let mut record = csv::ByteRecord::new();
                record.push_field(peptide.modified_sequence.as_bytes());
                record.push_field(peptide.base_sequence.as_bytes());
                record.push_field(peptide.protein_groups.join(";").as_bytes());
                for x in &peptide.intensities {
                    push_float(&mut record, *x);
                }
                for detection in &peptide.detections {
                    record.push_field(detection.as_str().as_bytes());
                }
                record
            })
            .collect::<Vec<csv::ByteRecord>>();

        for record in records {
            wtr.write_byte_record(&record)?;
        }
        wtr.flush()?;

        let bytes = wtr.into_inner()?;
        std::fs::write(&path, bytes)?;
        Ok(path.display().to_string())
    }
}
