mod cli;
mod logging;

use anyhow::Context;
use clap::Parser;
use cli::{AlignArgs, Cli, Commands, CountArgs, SliceArgs};
use dotenv::dotenv;
use physioseg::metadata::ScanningSheet;
use physioseg::{AppConfig, Engine};
use tracing::error;

fn main() {
    dotenv().ok();

    let _guard = logging::init_logger();

    let args = Cli::parse();

    let result = match args.command {
        Commands::Count(args) => run_count(args),
        Commands::Align(args) => run_align(args),
        Commands::Slice(args) => run_slice(args),
        Commands::PrintConfig => print_config(),
    };

    if let Err(err) = result {
        error!("Error: {:#}", err);
        std::process::exit(1);
    }
}

fn load_engine() -> anyhow::Result<Engine> {
    let config = AppConfig::load().context("loading configuration")?;
    Ok(Engine::new(config))
}

fn run_count(args: CountArgs) -> anyhow::Result<()> {
    let engine = load_engine()?;
    let sheet = args
        .scanning_sheet
        .as_deref()
        .map(ScanningSheet::load)
        .transpose()
        .context("loading scanning sheet")?;
    let save = args.save.clone().unwrap_or_else(|| args.root.clone());

    let info = engine.count(
        &args.root,
        &args.sub,
        &args.sessions,
        args.count_vol,
        sheet.as_ref(),
        Some(&save),
    )?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn run_align(args: AlignArgs) -> anyhow::Result<()> {
    let engine = load_engine()?;
    let sheet = args
        .scanning_sheet
        .as_deref()
        .map(ScanningSheet::load)
        .transpose()
        .context("loading scanning sheet")?;
    let summaries = engine.align(&args.scratch, &args.sub, &args.sessions, sheet.as_ref())?;

    for summary in &summaries {
        println!("{}", summary.session);
        for warning in &summary.warnings {
            println!("  warning: {}", warning);
        }
        if let Some(reason) = &summary.skipped {
            println!("  skipped: {}", reason);
            continue;
        }
        for outcome in &summary.outcomes {
            println!("  {}: {:?} ({})", outcome.run, outcome.disposition, outcome.detail);
        }
    }
    Ok(())
}

fn run_slice(args: SliceArgs) -> anyhow::Result<()> {
    let engine = load_engine()?;
    let save = args.save.clone().unwrap_or_else(|| args.root.clone());
    engine.slice(&args.root, &args.sub, args.session.as_deref(), &save)?;
    Ok(())
}

fn print_config() -> anyhow::Result<()> {
    let config = AppConfig::load().context("loading configuration")?;
    println!("{:#?}", config);
    Ok(())
}
