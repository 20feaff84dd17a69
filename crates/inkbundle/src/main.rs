use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use inkbundle::{
    aliases::resolution_aliases,
    config::{Config, Mode},
    entry::synthesize,
    orchestrator::{BuildOutcome, Orchestrator},
};
use log::{LevelFilter, debug};

#[derive(Parser, Debug)]
#[command(name = "inkbundle", version, about = "Prebundle React development runtimes for production")]
struct Cli {
    /// Project root containing node_modules
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Extra configuration file, applied after inkbundle.toml
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile every runtime entry and publish the artifact set
    Build {
        #[arg(long, value_enum)]
        mode: Option<Mode>,

        #[arg(long, value_name = "DIR")]
        out_dir: Option<PathBuf>,

        /// Keep whitespace and comments in the output
        #[arg(long)]
        no_minify: bool,
    },
    /// Print the resolution aliases for the dev server
    Aliases {
        #[arg(long, value_enum)]
        mode: Option<Mode>,

        /// Print as JSON instead of `package -> path` lines
        #[arg(long)]
        json: bool,
    },
    /// Print the synthesized source of one entry
    Entry {
        /// Logical entry name, e.g. `dom`
        name: String,
    },
}

#[allow(clippy::print_stdout, clippy::print_stderr)]
fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::new();
    if std::env::var_os("RUST_LOG").is_some() {
        builder.parse_default_env();
    } else {
        builder.filter_level(level);
    }
    builder.format_timestamp(None).init();
}

fn load_config(root: Option<&Path>, explicit: Option<&Path>) -> Result<Config> {
    let root = match root {
        Some(root) => root.to_path_buf(),
        None => std::env::current_dir().context("Failed to determine the current directory")?,
    };
    let root = root
        .canonicalize()
        .with_context(|| format!("Project root {} does not exist", root.display()))?;
    debug!("Using project root {}", root.display());
    Config::load(&root, explicit)
}

#[allow(clippy::print_stdout)]
fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.root.as_deref(), cli.config.as_deref())?;

    match cli.command {
        Command::Build {
            mode,
            out_dir,
            no_minify,
        } => {
            if let Some(mode) = mode {
                config.mode = mode;
            }
            if let Some(out_dir) = out_dir {
                config.out_dir = out_dir;
            }
            if no_minify {
                config.minify = false;
            }

            let orchestrator = Orchestrator::new(config)?;
            match orchestrator.run()? {
                BuildOutcome::Skipped => {
                    println!("Development mode: runtime bundling skipped");
                }
                BuildOutcome::Built(report) => {
                    for artifact in &report.artifacts {
                        println!(
                            "{:<16} {:>9} bytes  {}",
                            artifact.name,
                            artifact.bytes,
                            artifact.path.display()
                        );
                    }
                    println!("Manifest written to {}", report.manifest.display());
                }
            }
        }
        Command::Aliases { mode, json } => {
            if let Some(mode) = mode {
                config.mode = mode;
            }
            let aliases = resolution_aliases(&config);
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&aliases).context("Failed to encode aliases")?
                );
            } else {
                for (package, path) in &aliases {
                    println!("{package} -> {}", path.display());
                }
            }
        }
        Command::Entry { name } => {
            let entry = config
                .entries
                .iter()
                .find(|entry| entry.name == name)
                .ok_or_else(|| {
                    let known: Vec<&str> = config.entries.iter().map(|e| e.name.as_str()).collect();
                    anyhow!("unknown entry '{name}' (known: {})", known.join(", "))
                })?;
            print!("{}", synthesize(entry)?);
        }
    }
    Ok(())
}
