use anyhow::Context;
use clap::Parser;
use log::info;

use cli::{Cli, Commands};

mod cli;

#[tokio::main(worker_threads = 1)]
async fn main() -> Result<(), anyhow::Error> {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    let cli = Cli::parse();

    match cli.command {
        Commands::Info => run_info()?,
        Commands::Poll { mode, count } => run_poll(mode, count).await?,
        Commands::Session { label, duration_seconds, mode } => run_session(label, duration_seconds, mode).await?,
    }

    Ok(())
}

fn run_info() -> anyhow::Result<()> {
    let meter = nemb_core::new_meter(nemb_core::MeterConfig::balanced()).context("no energy sensors detected on this host")?;
    println!("Clock source and providers:");
    for (key, value) in meter.diagnostics() {
        println!("  {key} = {value}");
    }
    println!("Providers: {}", meter.providers().join(", "));
    Ok(())
}

async fn run_poll(mode: cli::Mode, count: u64) -> anyhow::Result<()> {
    let config = mode.to_config();
    let poll_period = config.sample_interval();
    let meter = nemb_core::new_meter(config).context("no energy sensors detected on this host")?;
    info!("polling providers: {}", meter.providers().join(", "));

    let mut n = 0u64;
    let mut interval = tokio::time::interval(poll_period);
    loop {
        interval.tick().await;
        let reading = meter.read_instant();
        println!("{:.3} J, {:.3} W (confidence {:.2})", reading.aggregate_energy_joules, reading.aggregate_power_watts, reading.confidence);
        n += 1;
        if count != 0 && n >= count {
            break;
        }
    }
    Ok(())
}

async fn run_session(label: String, duration_seconds: f64, mode: cli::Mode) -> anyhow::Result<()> {
    let meter = nemb_core::new_meter(mode.to_config()).context("no energy sensors detected on this host")?;
    let session_id = meter.start_session(label);
    tokio::time::sleep(std::time::Duration::from_secs_f64(duration_seconds)).await;
    let diff = meter.end_session(session_id);
    println!(
        "{:.3} J over {:.3} s ({:.3} W average, valid={})",
        diff.energy_joules, diff.duration_seconds, diff.average_power_watts, diff.valid
    );
    for (component, joules) in diff.per_component_energy {
        println!("  {component}: {joules:.3} J");
    }
    Ok(())
}
