use std::{fs::File, io::BufWriter, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use cfnagg::{
    aggregation::observer::{CsvTraceObserver, FanoutObserver, TracingObserver},
    config::ConfigArgs,
    simulation::AggregationSimulation,
};

/// Simulates hierarchical in-network aggregation over a configured tree.
#[derive(Parser, Debug)]
#[command(name = "cfnagg", version)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    /// Write every round event to this CSV file.
    #[arg(long, value_name = "FILE")]
    trace_csv: Option<PathBuf>,

    /// Print the report as JSON instead of text.
    #[arg(long)]
    json: bool,

    /// Sleep between events so virtual time follows the wall clock, sped up
    /// by the given factor.
    #[arg(long, value_name = "SPEEDUP")]
    paced: Option<f64>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    #[cfg(feature = "trace")]
    cfnagg::tracing::init_tracer(cli.config.log_level)?;

    let config = cli.config.build()?;

    let mut observer = FanoutObserver::new().with(Arc::new(TracingObserver));
    let csv = match &cli.trace_csv {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating trace file {}", path.display()))?;
            let csv = Arc::new(CsvTraceObserver::new(BufWriter::new(file))?);
            observer.push(csv.clone());
            Some(csv)
        }
        None => None,
    };

    let mut sim = AggregationSimulation::new(&config, Arc::new(observer))?;
    let report = match cli.paced {
        Some(speedup) => {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()?;
            rt.block_on(sim.run_paced(config.simulation.stop_time(), speedup))?;
            sim.stop();
            sim.report()
        }
        None => sim.run()?,
    };

    if let Some(csv) = csv {
        csv.flush().context("flushing trace file")?;
    }
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    Ok(())
}
