mod config;

use anyhow::{bail, Context, Result};
use beamline_core::bunch::Bunch;
use beamline_core::coordinates::to_normalized_momentum;
use beamline_core::lattice::xml_to_madx;
use beamline_core::magnets::{CoefficientTable, Conversion, MagnetConverter, Setpoints};
use beamline_core::units::EnergyUnit;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "beamline", version, about = "Lattice translation and bunch conversion")]
struct Cli {
    /// JSON file with reference particle, bunch format and translator settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Translate an XML beamline layout into a MAD-X lattice file
    Translate {
        xml: PathBuf,
        /// Directory that receives `<xml stem>.madx`
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        /// Live magnet settings to apply to quadrupoles
        #[arg(long, conflicts_with = "design_setpoints")]
        mstate: Option<PathBuf>,
        /// mstate attribute holding the value
        #[arg(long, default_value = "setpoint")]
        param: String,
        /// Apply the matched-design BTF currents
        #[arg(long)]
        design_setpoints: bool,
        /// Magnet calibration table (required with setpoints)
        #[arg(long)]
        coefficients: Option<PathBuf>,
    },
    /// Convert a time-of-flight bunch dump to normalized-momentum CSV
    ConvertBunch {
        input: PathBuf,
        output: PathBuf,
        /// Header lines to skip (overrides the config)
        #[arg(long)]
        header_lines: Option<usize>,
        /// Unit of the energy-deviation column: ev, kev, mev or gev
        #[arg(long, value_parser = parse_energy_unit)]
        energy_unit: Option<EnergyUnit>,
    },
    /// Convert between magnet current and integrated gradient
    Magnet {
        #[command(subcommand)]
        direction: MagnetDirection,
        #[arg(long, global = true)]
        coefficients: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum MagnetDirection {
    /// Current [A] to integrated gradient [T]
    C2gl { name: String, current: f64 },
    /// Integrated gradient [T] to current [A]
    Gl2c { name: String, gradient: f64 },
}

fn parse_energy_unit(raw: &str) -> Result<EnergyUnit, String> {
    EnergyUnit::parse(raw).ok_or_else(|| format!("unknown energy unit '{}'", raw))
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_converter(path: Option<&PathBuf>) -> Result<MagnetConverter> {
    let Some(path) = path else {
        bail!("--coefficients is required for magnet conversions");
    };
    let table = CoefficientTable::load(path)?;
    info!(
        "Using {} calibration entries from {}",
        table.len(),
        path.display()
    );
    Ok(MagnetConverter::new(table))
}

fn run(cli: Cli) -> Result<()> {
    let config = CliConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Translate {
            xml,
            out_dir,
            mstate,
            param,
            design_setpoints,
            coefficients,
        } => {
            let setpoints = match (mstate, design_setpoints) {
                (Some(path), _) => Some(Setpoints::load_mstate(&path, &param)?),
                (None, true) => Some(Setpoints::btf_design()),
                (None, false) => None,
            };
            let converter = match &setpoints {
                Some(_) => Some(load_converter(coefficients.as_ref())?),
                None => None,
            };
            let live = setpoints.as_ref().zip(converter.as_ref());

            let (path, report) =
                xml_to_madx(&xml, &out_dir, &config.reference, live, &config.translator)?;
            for name in &report.unresolved {
                warn!("{}: setpoint not applied", name);
            }
            println!("{}", path.display());
        }
        Command::ConvertBunch {
            input,
            output,
            header_lines,
            energy_unit,
        } => {
            let mut format = config.bunch_format;
            if let Some(lines) = header_lines {
                format.header_lines = lines;
            }
            if let Some(unit) = energy_unit {
                format.energy_unit = unit;
            }
            let bunch = Bunch::read_time_of_flight(&input, &format, config.reference)?;
            info!("N particles in bunch: {}", bunch.len());
            let converted = to_normalized_momentum(&bunch)
                .with_context(|| format!("Failed to convert {}", input.display()))?;
            if !converted.is_empty() {
                let moments = converted.moments()?;
                let [sx, sy, st] = moments.rms_sizes();
                let [ex, ey, et] = moments.rms_emittances();
                info!("rms sizes [m]: x = {:.4e}, y = {:.4e}, t = {:.4e}", sx, sy, st);
                info!("rms emittances: x = {:.4e}, y = {:.4e}, t = {:.4e}", ex, ey, et);
            }
            converted.write_csv(&output)?;
            println!("{}", output.display());
        }
        Command::Magnet {
            direction,
            coefficients,
        } => {
            let converter = load_converter(coefficients.as_ref())?;
            let (name, result, unit) = match direction {
                MagnetDirection::C2gl { name, current } => {
                    let result = converter.c2gl(&name, current);
                    (name, result, "T")
                }
                MagnetDirection::Gl2c { name, gradient } => {
                    let result = converter.gl2c(&name, gradient);
                    (name, result, "A")
                }
            };
            match result {
                Conversion::Known(value) => println!("{} {}", value, unit),
                Conversion::Unknown => bail!("No calibration available for {}", name),
            }
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(err) = run(cli) {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command, MagnetDirection};
    use beamline_core::units::EnergyUnit;
    use clap::Parser;

    #[test]
    fn translate_flags_are_parsed() {
        let cli = Cli::try_parse_from([
            "beamline",
            "translate",
            "btf.xml",
            "--out-dir",
            "inputs",
            "--design-setpoints",
            "--coefficients",
            "coeffs.csv",
        ])
        .expect("arguments should parse");
        match cli.command {
            Command::Translate {
                design_setpoints,
                mstate,
                param,
                ..
            } => {
                assert!(design_setpoints);
                assert!(mstate.is_none());
                assert_eq!(param, "setpoint");
            }
            _ => panic!("expected translate"),
        }
    }

    #[test]
    fn mstate_and_design_setpoints_conflict() {
        let result = Cli::try_parse_from([
            "beamline",
            "translate",
            "btf.xml",
            "--mstate",
            "live.mstate",
            "--design-setpoints",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn energy_unit_is_validated() {
        let cli = Cli::try_parse_from([
            "beamline",
            "convert-bunch",
            "in.dat",
            "out.csv",
            "--energy-unit",
            "GeV",
        ])
        .expect("arguments should parse");
        match cli.command {
            Command::ConvertBunch { energy_unit, .. } => {
                assert_eq!(energy_unit, Some(EnergyUnit::Gev))
            }
            _ => panic!("expected convert-bunch"),
        }
        assert!(Cli::try_parse_from([
            "beamline",
            "convert-bunch",
            "in.dat",
            "out.csv",
            "--energy-unit",
            "joules",
        ])
        .is_err());
    }

    #[test]
    fn magnet_subcommand_takes_name_and_value() {
        let cli = Cli::try_parse_from([
            "beamline",
            "magnet",
            "gl2c",
            "QH01",
            "0.75",
            "--coefficients",
            "coeffs.csv",
        ])
        .expect("arguments should parse");
        match cli.command {
            Command::Magnet {
                direction: MagnetDirection::Gl2c { name, gradient },
                coefficients,
            } => {
                assert_eq!(name, "QH01");
                assert_eq!(gradient, 0.75);
                assert!(coefficients.is_some());
            }
            _ => panic!("expected magnet gl2c"),
        }
    }
}
