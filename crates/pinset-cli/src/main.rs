mod commands;

use clap::{Parser, Subcommand};
use commands::resolve::ConfigOverrides;
use pinset_core::install_signal_handler;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "pinset",
    version,
    about = "Pin every external input a source checkout needs to build"
)]
struct Cli {
    /// Resolver configuration file (TOML). Flags override its fields.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve the root checkout and write the manifest.
    Resolve {
        #[command(flatten)]
        overrides: ConfigOverrides,
        /// Write the manifest here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Summarize a manifest written by `resolve`.
    Inspect {
        /// Path to the manifest JSON file.
        manifest: PathBuf,
    },
    /// Export the package pins of a manifest as a resolved-versions file.
    Versions {
        /// Path to the manifest JSON file.
        manifest: PathBuf,
        /// Write the versions file here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Check tools, configuration and the cache directory.
    Doctor {
        #[command(flatten)]
        overrides: ConfigOverrides,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("PINSET_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();

    let config_path = cli.config.as_deref();
    let result = match cli.command {
        Commands::Resolve { overrides, output } => {
            commands::resolve::load_config(config_path, overrides)
                .and_then(|config| commands::resolve::run(config, output.as_deref()))
        }
        Commands::Inspect { manifest } => commands::inspect::run(&manifest, cli.json),
        Commands::Versions { manifest, output } => {
            commands::versions::run(&manifest, output.as_deref())
        }
        Commands::Doctor { overrides } => commands::resolve::load_config(config_path, overrides)
            .and_then(|config| commands::doctor::run(&config, cli.json)),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(failure) => {
            eprintln!("error: {failure}");
            ExitCode::from(failure.code)
        }
    }
}
