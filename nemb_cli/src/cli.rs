use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(author, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show detected providers and clock source, then exit.
    Info,

    /// Poll the meter continuously and print aggregate energy/power.
    Poll {
        /// Measurement mode: accuracy (1ms), balanced (10ms), or low (100ms).
        #[arg(short, long, value_enum, default_value = "balanced")]
        mode: Mode,

        /// How many samples to print before exiting. 0 means run until interrupted.
        #[arg(short, long, default_value_t = 0)]
        count: u64,
    },

    /// Start a session, sleep for the given duration, then print the energy difference.
    Session {
        /// Session label.
        #[arg(short, long, default_value = "session")]
        label: String,

        /// Duration to measure, in seconds.
        #[arg(short, long, default_value_t = 1.0)]
        duration_seconds: f64,

        #[arg(short, long, value_enum, default_value = "balanced")]
        mode: Mode,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Mode {
    Accuracy,
    Balanced,
    Low,
}

impl Mode {
    pub fn to_config(self) -> nemb_core::MeterConfig {
        match self {
            Mode::Accuracy => nemb_core::MeterConfig::accuracy(),
            Mode::Balanced => nemb_core::MeterConfig::balanced(),
            Mode::Low => nemb_core::MeterConfig::low_overhead(),
        }
    }
}
