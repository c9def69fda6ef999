use clap::{Parser, Subcommand};
use shared::SyncConfig;
use std::path::PathBuf;
use timer_sim::{simulate, verify};

#[derive(Parser)]
#[command(name = "timer-sim")]
#[command(about = "Simulate and verify multi-window meeting timer sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an owner and a late mirror over in-memory transports
    Simulate {
        #[arg(long, default_value = "60")]
        duration_secs: u32,

        #[arg(long, default_value = "2000")]
        mirror_at_ms: i64,

        #[arg(long, default_value = "10")]
        steps: usize,

        #[arg(long, default_value = "500")]
        step_ms: i64,

        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Run the sync protocol scenario suite
    Verify {
        #[arg(long, short)]
        config: Option<PathBuf>,

        #[arg(long, short)]
        verbose: bool,
    },
    /// Show configuration
    Config {
        #[arg(long)]
        print_default: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            duration_secs,
            mirror_at_ms,
            steps,
            step_ms,
            config,
        } => {
            let config = match config.as_deref().map(verify::config::load_config) {
                Some(Ok(config)) => config,
                Some(Err(e)) => {
                    eprintln!("Error: {:#}", e);
                    std::process::exit(2);
                }
                None => SyncConfig::default(),
            };
            let options = simulate::SimulateOptions {
                duration_secs,
                mirror_at_ms,
                steps,
                step_ms,
            };
            let rows = simulate::run_simulation(&options, config);
            simulate::print_rows(&rows);
        }
        Commands::Verify { config, verbose } => {
            let options = verify::VerifyOptions { config, verbose };

            match verify::run_verify(options) {
                Ok(true) => std::process::exit(0),
                Ok(false) => std::process::exit(1),
                Err(e) => {
                    eprintln!("Error: {:#}", e);
                    std::process::exit(2);
                }
            }
        }
        Commands::Config { print_default } => {
            if !print_default {
                eprintln!("Nothing to do. Try: timer-sim config --print-default");
                std::process::exit(2);
            }
            match SyncConfig::default().to_toml_string() {
                Ok(text) => print!("{}", text),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(2);
                }
            }
        }
    }
}
