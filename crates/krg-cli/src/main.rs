//! krg CLI - compose Kubernetes resources into new APIs

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;
mod error;
mod exit_codes;

use commands::controller::ControllerArgs;
use commands::generate::OutputFormat;

#[derive(Parser)]
#[command(name = "krg")]
#[command(author = "krg Contributors")]
#[command(version)]
#[command(about = "Compose Kubernetes resources into new APIs", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate artifacts from a ResourceGraphDefinition
    Generate {
        #[command(subcommand)]
        target: GenerateTarget,
    },

    /// Compile a ResourceGraphDefinition and print its resources in order
    Graph {
        /// ResourceGraphDefinition file
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },

    /// Run the controller against the current kubeconfig context
    Controller {
        /// Controller configuration file (YAML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Workers per composite type (overrides the config file)
        #[arg(long)]
        workers: Option<usize>,

        /// Delete generated CRDs along with their definition
        #[arg(long)]
        allow_crd_deletion: bool,

        /// Log as JSON lines
        #[arg(long)]
        log_json: bool,
    },
}

#[derive(Subcommand)]
enum GenerateTarget {
    /// Print the CustomResourceDefinition of the new type
    Crd {
        /// ResourceGraphDefinition file
        #[arg(short = 'f', long = "file")]
        file: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "yaml")]
        output: OutputFormat,
    },

    /// Print an example instance with every field filled in
    Instance {
        /// ResourceGraphDefinition file
        #[arg(short = 'f', long = "file")]
        file: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "yaml")]
        output: OutputFormat,
    },
}

fn main() {
    // Setup miette for nice error display
    miette::set_panic_hook();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Generate { target } => match target {
            GenerateTarget::Crd { file, output } => commands::generate::crd(&file, output),
            GenerateTarget::Instance { file, output } => {
                commands::generate::instance(&file, output)
            }
        },

        Commands::Graph { file } => commands::graph::run(&file),

        Commands::Controller {
            config,
            workers,
            allow_crd_deletion,
            log_json,
        } => commands::controller::run(&ControllerArgs {
            config,
            workers,
            allow_crd_deletion,
            log_json,
        }),
    };

    if let Err(err) = result {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}
