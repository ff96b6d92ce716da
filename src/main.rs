use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use crate::app::App;
use crate::config::{DisplayMode, Overrides};
use crate::persist::OutputFormat;

pub mod app;
pub mod config;
pub mod event;
pub mod monitor;
pub mod persist;

#[derive(Parser, Debug)]
#[command(about)]
struct Cli {
    #[arg(short, long, value_name = "FILE", default_value = config::DEFAULT_FILE)]
    config: PathBuf,
    /// Seconds of samples averaged into each displayed row
    #[arg(short, long, value_name = "SECONDS")]
    sampling_rate: Option<f64>,
    /// Print each row the moment it exists
    #[arg(long, conflicts_with = "buffered")]
    realtime: bool,
    /// Hold rows back and print them in batches
    #[arg(long)]
    buffered: bool,
    /// Save as CSV
    #[arg(long, conflicts_with = "excel")]
    csv: bool,
    /// Save as XLSX
    #[arg(long)]
    excel: bool,
    /// File stem for saves, extension added from the format
    #[arg(short, long, value_name = "NAME")]
    name: Option<String>,
    /// Exact save path, wins over --name
    #[arg(long, value_name = "FILE")]
    autosave: Option<PathBuf>,
    /// Monitor this pid instead of searching for one
    #[arg(long, value_name = "PID")]
    pid: Option<u32>,
    /// Exit after the first monitored process ends
    #[arg(long)]
    once: bool,
    /// Write everything displayed to this file on exit
    #[arg(long, value_name = "FILE")]
    export: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            sampling_rate: self.sampling_rate,
            display: match (self.realtime, self.buffered) {
                (true, _) => Some(DisplayMode::Realtime),
                (_, true) => Some(DisplayMode::Buffered),
                _ => None,
            },
            format: match (self.csv, self.excel) {
                (true, _) => Some(OutputFormat::Csv),
                (_, true) => Some(OutputFormat::Xlsx),
                _ => None,
            },
            name: self.name.clone(),
            autosave_path: self.autosave.clone(),
            pid: self.pid,
            once: self.once,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Find a training process and monitor it
    Run,
    /// Validate the configuration file and print the effective config
    Validate,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    match &cli.command {
        Some(Commands::Validate) => {
            let mut config = config::load(cli.config.clone())?;
            cli.overrides().apply(&mut config);
            config.validate()?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Commands::Run) | None => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .init();
            info!("Logging started");
            let mut app = App::new(cli.config.clone(), cli.overrides(), cli.export.clone())?;
            app.run().await
        }
    }
}
