use std::fs;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use cell_metrics::config::ProjectSettings;
use cell_metrics::{
    find_cycle_idx, process_cell, CellData, CellDataVdf, CellOutputs, CycleMetrics,
    EngineConfig, TestRecord, VdfRecord,
};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Battery cycle detection and health-metrics CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full engine over one or more cell bundles and write the output tables
    Process(ProcessArgs),
    /// Run only the cycle segmenter and report boundaries per record
    Segment(SegmentArgs),
}

#[derive(Parser, Debug)]
struct ProcessArgs {
    /// Cell bundle JSON files
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Directory receiving the CSV (and JSON) outputs
    #[arg(short, long, default_value = ".", value_hint = ValueHint::DirPath)]
    output_dir: PathBuf,

    /// Engine configuration JSON (any subset of the defaults)
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Project name overriding the bundle's own
    #[arg(long)]
    project: Option<String>,

    /// Also write the full outputs as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct SegmentArgs {
    /// Cell bundle JSON files
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Report path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Engine configuration JSON (any subset of the defaults)
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

/// One physical cell as handed over by the upstream parsers.
#[derive(Debug, Serialize, Deserialize)]
struct CellBundle {
    cell_name: String,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    cycler: Vec<TestRecord>,
    #[serde(default)]
    vdf: Vec<VdfRecord>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Process(args) => args.verbose,
        Command::Segment(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Process(args) => handle_process(args),
        Command::Segment(args) => handle_segment(args),
    }
}

fn read_bundle(path: &Path) -> Result<CellBundle> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse cell bundle {}", path.display()))
}

fn load_base_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(p) => EngineConfig::from_path(p)
            .with_context(|| format!("failed to load config {}", p.display())),
        None => Ok(EngineConfig::default()),
    }
}

/// `--project` wins over the bundle's project, which wins over the config file.
fn config_for_bundle(
    base: &EngineConfig,
    cli_project: Option<&str>,
    bundle: &CellBundle,
) -> EngineConfig {
    let mut config = base.clone();
    if let Some(name) = cli_project.or(bundle.project.as_deref()) {
        if !ProjectSettings::is_known(name) {
            warn!(
                "{}: unknown project '{}', using {} settings",
                bundle.cell_name,
                name,
                cell_metrics::config::DEFAULT_PROJECT
            );
        }
        config.project = ProjectSettings::for_project(name);
    }
    config
}

fn handle_process(args: ProcessArgs) -> Result<()> {
    let base = load_base_config(args.config.as_deref())?;
    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("failed to create {}", args.output_dir.display()))?;

    let t_start = Instant::now();
    let (written, failed) = process_bundles(
        &args.inputs,
        &base,
        args.project.as_deref(),
        &args.output_dir,
        args.json,
    );
    info!(
        "Processed {} cells in {:.1} s",
        written.len(),
        t_start.elapsed().as_secs_f64()
    );
    if failed > 0 {
        bail!("{failed} of {} cells failed", args.inputs.len());
    }
    Ok(())
}

/// Process every bundle; a failing cell is logged and does not stop the
/// others. Returns the written cell names and the failure count.
fn process_bundles(
    inputs: &[PathBuf],
    base: &EngineConfig,
    project: Option<&str>,
    output_dir: &Path,
    json: bool,
) -> (Vec<String>, usize) {
    let results: Vec<Result<String>> = inputs
        .par_iter()
        .map(|path| -> Result<String> {
            let bundle = read_bundle(path)?;
            let config = config_for_bundle(base, project, &bundle);
            info!(
                "{}: {} cycler and {} VDF records (project {})",
                bundle.cell_name,
                bundle.cycler.len(),
                bundle.vdf.len(),
                config.project.name
            );
            let outputs = process_cell(&bundle.cycler, &bundle.vdf, &config)
                .with_context(|| format!("failed to process cell {}", bundle.cell_name))?;
            write_outputs(output_dir, &bundle.cell_name, &outputs, json)?;
            Ok(bundle.cell_name)
        })
        .collect();

    let mut written = Vec::with_capacity(results.len());
    let mut failed = 0usize;
    for (path, result) in inputs.iter().zip(results) {
        match result {
            Ok(name) => written.push(name),
            Err(e) => {
                warn!("{}: {e:#}", path.display());
                failed += 1;
            }
        }
    }
    (written, failed)
}

fn write_outputs(dir: &Path, cell: &str, outputs: &CellOutputs, json: bool) -> Result<()> {
    let path = dir.join(format!("{cell}_cell_data.csv"));
    write_csv(&path, |w| write_cell_data_rows(&outputs.cell_data, w))?;
    let path = dir.join(format!("{cell}_cycle_metrics.csv"));
    write_csv(&path, |w| write_cycle_metrics_rows(&outputs.cycle_metrics, w))?;
    let path = dir.join(format!("{cell}_cell_data_vdf.csv"));
    write_csv(&path, |w| write_vdf_rows(&outputs.cell_data_vdf, w))?;
    if json {
        let path = dir.join(format!("{cell}_outputs.json"));
        let file =
            File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer(BufWriter::new(file), outputs)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("Wrote {}", path.display());
    }
    for (name, err) in &outputs.record_errors {
        warn!("{cell}: record {name} has no cycles ({err})");
    }
    Ok(())
}

fn write_csv<F>(path: &Path, rows: F) -> Result<()>
where
    F: FnOnce(&mut csv::Writer<BufWriter<File>>) -> Result<()>,
{
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(BufWriter::new(file));
    rows(&mut writer).with_context(|| format!("failed to write {}", path.display()))?;
    writer.flush()?;
    info!("Wrote {}", path.display());
    Ok(())
}

fn num(v: f64) -> String {
    if v.is_nan() {
        "NaN".into()
    } else {
        v.to_string()
    }
}

fn opt(v: Option<f64>) -> String {
    v.map(num).unwrap_or_default()
}

fn joined<I: Iterator<Item = f64>>(values: I) -> String {
    values.map(num).collect::<Vec<_>>().join(";")
}

fn write_cell_data_rows<W: Write>(cell: &CellData, writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record([
        "time",
        "timestamp",
        "current(a)",
        "voltage(v)",
        "temperature (c)",
        "capacity(ah)",
        "step index",
        "discharge cycle indicator",
        "charge cycle indicator",
        "capacity check indicator",
        "cycle indicator",
        "cycle type",
        "protocol",
        "test name",
    ])?;
    for k in 0..cell.len() {
        writer.write_record([
            num(cell.time[k]),
            cell.timestamp[k].map(|t| t.to_rfc3339()).unwrap_or_default(),
            num(cell.current[k]),
            num(cell.voltage[k]),
            num(cell.temperature[k]),
            num(cell.aht[k]),
            cell.step_index[k].to_string(),
            cell.is_discharge_start[k].to_string(),
            cell.is_charge_start[k].to_string(),
            cell.is_capacity_check[k].to_string(),
            cell.is_cycle_start[k].to_string(),
            cell.cycle_type[k].map(|c| c.as_str().to_string()).unwrap_or_default(),
            cell.protocol[k].map(|p| p.as_str().to_string()).unwrap_or_default(),
            cell.test_name[k].clone().unwrap_or_default(),
        ])?;
    }
    Ok(())
}

const CYCLE_METRICS_HEADER: [&str; 45] = [
    "time",
    "timestamp",
    "capacity(ah)",
    "cycle type",
    "protocol",
    "discharge cycle indicator",
    "charge cycle indicator",
    "capacity check indicator",
    "cycle indicator",
    "test name",
    "chg. cap.(ah)",
    "dchg. cap.(ah)",
    "min cycle voltage (v)",
    "max cycle voltage (v)",
    "min cycle temperature (c)",
    "max cycle temperature (c)",
    "avg cycle charge current (a)",
    "avg cycle discharge current (a)",
    "time vdf (s)",
    "min expansion (counts)",
    "max expansion (counts)",
    "reversible expansion (counts)",
    "min expansion (um)",
    "max expansion (um)",
    "reversible expansion (um)",
    "drive current",
    "expansion stddev (cnt)",
    "ref stddev (cnt)",
    "pulse current",
    "pulse duration",
    "pulse q",
    "R_s",
    "R_l",
    "C",
    "Cn",
    "X0",
    "X100",
    "Cp",
    "Y0",
    "Y100",
    "RMSE_V",
    "RMSE_dVdQ",
    "P1_err",
    "P2_err",
    "P12_err",
];

fn write_cycle_metrics_rows<W: Write>(
    metrics: &CycleMetrics,
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record(CYCLE_METRICS_HEADER)?;
    for row in &metrics.rows {
        let c = &row.cycler;
        let e = &row.expansion;
        let mut record = vec![
            num(row.time),
            row.timestamp.map(|t| t.to_rfc3339()).unwrap_or_default(),
            num(row.aht),
            row.cycle_type.map(|t| t.as_str().to_string()).unwrap_or_default(),
            row.protocol.map(|p| p.as_str().to_string()).unwrap_or_default(),
            row.is_discharge_start.to_string(),
            row.is_charge_start.to_string(),
            row.is_capacity_check.to_string(),
            row.is_cycle_start.to_string(),
            row.test_name.clone(),
            opt(c.charge_capacity),
            opt(c.discharge_capacity),
            opt(c.min_cycle_voltage),
            opt(c.max_cycle_voltage),
            opt(c.min_cycle_temperature),
            opt(c.max_cycle_temperature),
            opt(c.avg_charge_current),
            opt(c.avg_discharge_current),
            opt(e.time_vdf),
            opt(e.min_expansion),
            opt(e.max_expansion),
            opt(e.reversible_expansion),
            opt(e.min_expansion_um),
            opt(e.max_expansion_um),
            opt(e.reversible_expansion_um),
            opt(e.drive_current),
            opt(e.expansion_stddev),
            opt(e.ref_stddev),
            joined(row.hppc.iter().map(|p| p.current)),
            joined(row.hppc.iter().map(|p| p.duration)),
            joined(row.hppc.iter().map(|p| p.q)),
            joined(row.hppc.iter().map(|p| p.r_s)),
            joined(row.hppc.iter().map(|p| p.r_l)),
        ];
        match &row.esoh {
            Some(s) => record.extend(
                [
                    s.cap,
                    s.cn,
                    s.x0,
                    s.x100,
                    s.cp,
                    s.y0,
                    s.y100,
                    s.err_v,
                    s.err_dvdq,
                    s.peak1_err,
                    s.peak2_err,
                    s.peak_gap_err,
                ]
                .into_iter()
                .map(num),
            ),
            None => record.extend(std::iter::repeat(String::new()).take(12)),
        }
        writer.write_record(&record)?;
    }
    Ok(())
}

fn write_vdf_rows<W: Write>(vdf: &CellDataVdf, writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record([
        "time",
        "expansion (counts)",
        "expansion (um)",
        "expansion ref (counts)",
        "temperature (c)",
        "drive current",
        "expansion stddev (cnt)",
        "ref stddev (cnt)",
        "cycle indicator",
        "test name",
    ])?;
    for k in 0..vdf.len() {
        let test_name = vdf
            .test_names
            .get(vdf.record[k])
            .cloned()
            .unwrap_or_default();
        writer.write_record([
            num(vdf.time[k]),
            num(vdf.expansion[k]),
            num(vdf.expansion_um[k]),
            num(vdf.expansion_ref[k]),
            num(vdf.temperature[k]),
            num(vdf.drive_current[k]),
            num(vdf.expansion_stddev[k]),
            num(vdf.ref_stddev[k]),
            vdf.is_cycle_start[k].to_string(),
            test_name,
        ])?;
    }
    Ok(())
}

fn handle_segment(args: SegmentArgs) -> Result<()> {
    let config = load_base_config(args.config.as_deref())?;
    let mut report = String::new();

    for path in &args.inputs {
        let bundle = read_bundle(path)?;
        report.push_str(&format!("CELL: {} ({})\n", bundle.cell_name, path.display()));
        for record in &bundle.cycler {
            report.push_str(&segment_report(record, &config));
        }
    }

    if args.output.as_os_str() == "-" {
        io::stdout().lock().write_all(report.as_bytes())?;
    } else {
        fs::write(&args.output, report)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Segmentation report written: {}", args.output.display());
    }
    Ok(())
}

fn segment_report(record: &TestRecord, config: &EngineConfig) -> String {
    let mut out = String::new();
    let cycle_type = record.cycle_type();
    out.push_str(&format!("  RECORD: {}\n", record.test_name));
    out.push_str(&format!(
        "    cycle_type: {}  rpt: {}  format: {}\n",
        cycle_type.as_str(),
        record.is_rpt(),
        record.is_format()
    ));
    out.push_str(&format!("    samples: {}\n", record.samples.len()));
    if let (Some(first), Some(last)) = (record.samples.first(), record.samples.last()) {
        out.push_str(&format!("    timespan_s: {:.1}\n", last.time - first.time));
    }
    let times = record.times();
    let currents = record.currents();
    match find_cycle_idx(
        &times,
        &currents,
        &config.limits_for(cycle_type),
        &config.segmenter,
    ) {
        Ok(seg) => {
            out.push_str(&format!(
                "    turning_points: {}  rainflow_cycles: {:.1}  leading: {:?}\n",
                seg.turning_points, seg.rainflow_cycles, seg.leading
            ));
            out.push_str(&format!(
                "    charge_starts: {}  discharge_starts: {}\n",
                seg.boundaries.charge_start.len(),
                seg.boundaries.discharge_start.len()
            ));
            for (c, d) in seg
                .boundaries
                .charge_start
                .iter()
                .zip(&seg.boundaries.discharge_start)
                .take(5)
            {
                out.push_str(&format!(
                    "      - charge t={:.1}  discharge t={:.1}\n",
                    times[*c], times[*d]
                ));
            }
        }
        Err(err) => {
            out.push_str(&format!("    no cycles: {err}\n"));
        }
    }
    out
}
