mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "logtap", version, about = "Scriptable streaming log processor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the processing pipeline with a script
    Run {
        /// Path to the processing script
        script: PathBuf,

        /// File to read data from
        #[arg(short = 'f', long, default_value = "/dev/stdin")]
        file: PathBuf,

        /// Monitor a directory recursively, ingesting all new data written
        /// to files under it; repeatable, overrides --file
        #[arg(short = 'r', long = "dir")]
        dirs: Vec<PathBuf>,
    },
    /// Benchmark script hook dispatch over pre-parsed input
    BenchScript {
        /// Path to the processing script
        script: PathBuf,

        /// File to read data from
        #[arg(short = 'f', long, default_value = "/dev/stdin")]
        file: PathBuf,
    },
    /// Benchmark the full pipeline (parsing plus hook dispatch)
    BenchPipeline {
        /// Path to the processing script
        script: PathBuf,

        /// File to read data from
        #[arg(short = 'f', long, default_value = "/dev/stdin")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run { script, file, dirs } => commands::run::execute(script, file, dirs).await,
        Commands::BenchScript { script, file } => {
            commands::bench::execute(script, file, commands::bench::Mode::ScriptOnly).await
        }
        Commands::BenchPipeline { script, file } => {
            commands::bench::execute(script, file, commands::bench::Mode::FullPipeline).await
        }
    }
}
