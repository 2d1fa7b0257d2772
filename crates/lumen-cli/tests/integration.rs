use lumen_cli::input::Input;
use lumen_cli::runner::Runner;
use lumen_core::index::Ms1Scan;
use lumen_core::isotopes::{Averagine, ElementTable, TheoreticalEnvelope};
use lumen_core::mass::{to_mz, Composition};
use std::path::PathBuf;

const PEPTIDES: [&str; 3] = ["PEPTIDE", "PEPTIDEV", "PEPTIDEVV"];

fn workspace(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("lumen_cli_{}_{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn mass(sequence: &str) -> f64 {
    ElementTable::natural().monoisotopic_mass(&Composition::peptide(sequence).unwrap())
}

/// Each peptide elutes over five scans, 0.01 minutes apart, peaking at the
/// third
fn scans(offset: f64) -> Vec<Ms1Scan> {
    let table = ElementTable::natural();
    (0..15)
        .map(|i| {
            let rt = 1.0 + offset + i as f64 / 100.0;
            let mut peaks = Vec::new();
            for (p, sequence) in PEPTIDES.iter().enumerate() {
                let step = i as i64 - (p as i64 * 5 + 2);
                if step.abs() > 2 {
                    continue;
                }
                let height = 1e6 * (3 - step.abs()) as f64;
                let m = mass(sequence);
                let envelope = TheoreticalEnvelope::new(&table, &Averagine::default(), m, None, sequence, 2);
                for (shift, abundance) in envelope.shifts.iter().zip(&envelope.abundances) {
                    peaks.push((to_mz(m + shift, 2), abundance * height));
                }
            }
            peaks.sort_by(|a, b| a.0.total_cmp(&b.0));
            Ms1Scan {
                scan_number: i + 1,
                retention_time: rt,
                mz: peaks.iter().map(|p| p.0).collect(),
                intensity: peaks.iter().map(|p| p.1).collect(),
            }
        })
        .collect()
}

fn write_inputs(dir: &PathBuf) -> PathBuf {
    for (name, offset) in [("one", 0.0), ("two", 0.002)] {
        let bytes = serde_json::to_vec(&scans(offset)).unwrap();
        std::fs::write(dir.join(format!("{}.json", name)), bytes).unwrap();
    }

    let mut table = String::from(
        "file\tbase_sequence\tmodified_sequence\tmonoisotopic_mass\tms2_retention_time\t\
         precursor_charge\tprotein_groups\tscore\tq_value\n",
    );
    for (run, offset) in [("one", 0.0), ("two", 0.002)] {
        for (p, sequence) in PEPTIDES.iter().enumerate() {
            // The last peptide is only identified in the first run
            if run == "two" && p == 2 {
                continue;
            }
            let rt = 1.0 + offset + (p * 5 + 2) as f64 / 100.0 + 0.001;
            table.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\t2\tP1;P2\t10.0\t0.001\n",
                run,
                sequence,
                sequence,
                mass(sequence),
                rt
            ));
        }
    }
    // Rows for runs that are not listed are ignored
    table.push_str(&format!("three\tPEPTIDE\tPEPTIDE\t{}\t1.0\t2\tP1\t10.0\t0.001\n", mass("PEPTIDE")));
    let ids = dir.join("ids.tsv");
    std::fs::write(&ids, table).unwrap();

    let parameters = serde_json::json!({
        "runs": [
            { "path": dir.join("one.json"), "condition": "a" },
            { "path": dir.join("two.json"), "condition": "a" },
        ],
        "identifications": ids,
        "output_directory": dir.join("out"),
        "workers": 2,
        "lfq_settings": {
            "mbr_settings": { "enabled": true }
        }
    });
    let path = dir.join("parameters.json");
    std::fs::write(&path, serde_json::to_vec(&parameters).unwrap()).unwrap();
    path
}

#[test]
fn parameters_are_resolved() -> anyhow::Result<()> {
    let dir = workspace("parameters");
    let path = write_inputs(&dir);

    let quant = Input::load(path.to_string_lossy())?.build()?;
    assert_eq!(quant.files.len(), 2);
    assert_eq!(quant.files[0].name, "one");
    assert_eq!(quant.files[1].condition, "a");
    assert_eq!(quant.settings.workers, 2);
    assert!(quant.settings.mbr.enabled);
    assert_eq!(quant.settings.ppm_tolerance, 10.0);
    assert!(quant.output_directory.exists());

    std::fs::remove_dir_all(dir)?;
    Ok(())
}

#[test]
fn quantify_and_write() -> anyhow::Result<()> {
    let dir = workspace("quantify");
    let path = write_inputs(&dir);

    let quant = Input::load(path.to_string_lossy())?.build()?;
    let quant = Runner::new(quant)?.run()?;
    assert_eq!(quant.output_paths.len(), 3);

    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(dir.join("out").join("quant.lumen.tsv"))?;
    let headers = rdr.headers()?.clone();
    assert_eq!(&headers[0], "peptide");
    assert_eq!(&headers[3], "intensity_one");
    assert_eq!(&headers[6], "detection_type_two");

    let rows = rdr.records().collect::<Result<Vec<_>, _>>()?;
    assert_eq!(rows.len(), 3);
    assert_eq!(&rows[0][0], "PEPTIDE");
    assert_eq!(&rows[0][2], "P1;P2");
    assert_eq!(&rows[0][5], "MSMS");
    assert_eq!(&rows[0][6], "MSMS");
    assert!(rows[0][3].parse::<f64>()? > 0.0);
    assert_eq!(&rows[2][5], "MSMS");

    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(dir.join("out").join("peaks.lumen.tsv"))?;
    assert_eq!(rdr.headers()?.len(), 26);
    let peaks = rdr.records().collect::<Result<Vec<_>, _>>()?;
    assert!(peaks.iter().filter(|r| &r[15] == "MSMS").count() >= 5);

    let written: serde_json::Value = serde_json::from_slice(&std::fs::read(dir.join("out").join("results.json"))?)?;
    assert_eq!(written["files"].as_array().map(|f| f.len()), Some(2));

    std::fs::remove_dir_all(dir)?;
    Ok(())
}
