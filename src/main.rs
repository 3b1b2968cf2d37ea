use anyhow::Result;
use clap::Parser;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use protoprobe::cli::Cli;
use protoprobe::config::ProbeConfig;
use protoprobe::output::OutputWriter;
use protoprobe::probe::adapters::AdapterInfo;
use protoprobe::probe::Prober;

fn init_logging(verbose: bool) {
    let default = if verbose { "protoprobe=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if cli.no_color {
        colored::control::set_override(false);
    }

    let mut config = ProbeConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    let writer = OutputWriter::new(cli.output_format, cli.output_file.clone());
    let prober = Prober::new(config);

    if cli.list {
        let adapters: Vec<AdapterInfo> = prober.registry().adapters().map(|a| a.info()).collect();
        return writer.write_adapters(&adapters);
    }

    if cli.batch.is_none() && (cli.protocol.is_none() || cli.targets.is_empty()) {
        eprintln!("{}", "Error: a protocol and at least one target are required.".red());
        eprintln!("Example: protoprobe redis 10.0.0.5");
        eprintln!("Run 'protoprobe --list' for supported protocols.");
        std::process::exit(2);
    }

    let requests = cli.requests(prober.config())?;

    let pb = (requests.len() > 1).then(|| {
        let pb = ProgressBar::new(requests.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("⟦{spinner:.bright_magenta}⟧ [{elapsed_precise}] ⟨{bar:40.bright_green/bright_black}⟩ {pos}/{len} probes ({eta})")
        {
            pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏ "));
        }
        pb
    });

    let results = prober.probe_all(requests, pb.as_ref()).await;
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    writer.write(&results)?;

    if results.iter().any(|r| !r.success) {
        std::process::exit(1);
    }
    Ok(())
}
