/// Example: sid2sf2_tool convert .\HVSC\MUSICIANS\L\Laxity\*.sid -o converted
/// Example: sid2sf2_tool to-xml .\tunes\*.sid -o unpack

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, command, Subcommand, ValueEnum};
use colored::Colorize;

use sid2sf2::dtype::ConvError;
use sid2sf2::opinionated_translators::np21sf2::{convert, decode_model, ConvertOptions, DriverChoice};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(author = "sid2sf2", version = VERSION, about = "Converts Laxity NewPlayer v21 SID files into SID Factory II projects", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DriverArg {
    /// Trust the player fingerprint.
    Auto,
    /// Force the Laxity conversion even if the fingerprint disagrees.
    Legacy,
    /// Pass files already carrying the target driver through unchanged.
    Target
}

#[derive(Subcommand)]
enum Commands {
    /// Convert .sid files into .sf2 project files
    Convert {
        /// Sets the path of the SID files to be converted
        #[arg(value_name = "INPUT")]
        input_glob: String,

        /// Sets the folder to output the converted files
        #[arg(short = 'o', long, value_name = "OUTPUT")]
        output_folder: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "auto")]
        driver: DriverArg
    },
    /// Decode .sid files and dump the reconstructed music model as XML
    ToXml {
        /// Sets the path of the SID files to be decoded
        #[arg(value_name = "INPUT")]
        input_glob: String,

        /// Sets the folder to output the XML dumps
        #[arg(short = 'o', long, value_name = "OUTPUT")]
        output_folder: Option<PathBuf>
    }
}

/// Expands the input glob into per-file jobs: every `.sid` file paired with
/// its destination path under the output folder (current directory when no
/// folder is given). Non-SID matches are skipped with a note, unreadable
/// glob entries with a warning.
fn conversion_jobs(input_glob: &str, output_folder: &Option<PathBuf>, out_ext: &str) -> Result<Vec<(PathBuf, PathBuf)>, ConvError> {
    let folder = match output_folder {
        Some(folder) if folder.is_dir() => folder.clone(),
        Some(folder) => return Err(ConvError::Invalid(format!("output folder {} is not a directory", folder.display()))),
        None => std::env::current_dir()?
    };

    let mut jobs = Vec::new();
    for entry in glob::glob(input_glob)? {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                println!("{}{}", "Warning: ".yellow(), e);
                continue;
            }
        };
        let is_sid = path.is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .map_or(false, |ext| ext.eq_ignore_ascii_case("sid"));
        if !is_sid {
            println!("Skipping {}!", path.display());
            continue;
        }
        let Some(file_name) = path.file_name() else { continue };
        let mut destination = folder.join(file_name);
        destination.set_extension(out_ext);
        jobs.push((path, destination));
    }
    Ok(jobs)
}

/// Exit codes promised to batch callers: 2 container, 3 player, 4 locator,
/// 1 anything else.
fn exit_code_for(err: &ConvError) -> u8 {
    match err {
        ConvError::UnrecognisedContainer(_) => 2,
        ConvError::UnsupportedPlayer(_) => 3,
        ConvError::TableNotLocated(_) => 4,
        _ => 1
    }
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        println!("{}{}", "Warning: ".yellow(), warning);
    }
}

fn run() -> Result<(), (ConvError, Option<PathBuf>)> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Convert { input_glob, output_folder, driver } => {
            let jobs = conversion_jobs(input_glob, output_folder, "sf2").map_err(|e| (e, None))?;

            let options = ConvertOptions {
                driver: match driver {
                    DriverArg::Auto => DriverChoice::Auto,
                    DriverArg::Legacy => DriverChoice::Legacy,
                    DriverArg::Target => DriverChoice::Target
                },
                ..ConvertOptions::default()
            };

            for (input_file_path, output_file_path) in jobs {
                print!("Converting {}... ", input_file_path.display());
                let raw = fs::read(&input_file_path).map_err(|e| (e.into(), Some(input_file_path.clone())))?;

                if options.driver == DriverChoice::Target {
                    // already in the target format; the conversion core has
                    // nothing to do here
                    fs::write(&output_file_path, &raw).map_err(|e| (e.into(), Some(input_file_path.clone())))?;
                    println!("passed through!");
                    continue;
                }

                match convert(&raw, &options) {
                    Ok(output) => {
                        fs::write(&output_file_path, &output.bytes).map_err(|e| (e.into(), Some(input_file_path.clone())))?;
                        println!("done! ({})", output.player);
                        print_warnings(&output.warnings);
                    },
                    Err(err @ ConvError::UnsupportedPlayer(_)) => {
                        println!("{}", "failed!".red());
                        eprintln!("{}{}", "Error: ".red(), err);
                        eprintln!("If this file was exported by SID Factory II itself, pick --driver target instead.");
                        return Err((err, Some(input_file_path)));
                    },
                    Err(err) => {
                        println!("{}", "failed!".red());
                        return Err((err, Some(input_file_path)));
                    }
                }
            }

            println!("\nAll files successfully processed.");
        },
        Commands::ToXml { input_glob, output_folder } => {
            let jobs = conversion_jobs(input_glob, output_folder, "sid.xml").map_err(|e| (e, None))?;

            for (input_file_path, output_file_path) in jobs {
                print!("Decoding {}... ", input_file_path.display());
                let raw = fs::read(&input_file_path).map_err(|e| (e.into(), Some(input_file_path.clone())))?;
                let (model, warnings) = decode_model(&raw).map_err(|e| (e, Some(input_file_path.clone())))?;

                let st = quick_xml::se::to_string(&model)
                    .map_err(|e| (ConvError::Invalid(format!("XML serialisation failed: {}", e)), Some(input_file_path.clone())))?;
                fs::write(&output_file_path, st.as_bytes()).map_err(|e| (e.into(), Some(input_file_path.clone())))?;
                println!("done!");
                print_warnings(&warnings);
            }

            println!("\nAll files successfully processed.");
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err((err, path)) => {
            match path {
                Some(path) => eprintln!("{}{} ({})", "Error: ".red(), err, path.display()),
                None => eprintln!("{}{}", "Error: ".red(), err)
            }
            ExitCode::from(exit_code_for(&err))
        }
    }
}
