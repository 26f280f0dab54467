use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use foodchain_map::filter::{self, FilterCriteria, FilterDimension};
use foodchain_map::{
    init_tracing, AppConfig, CsvFileSource, GeocodeCache, LocationPipeline, PipelineProgress,
    ProgressObserver,
};

#[derive(Debug, Parser)]
#[command(
    name = "foodchain-map",
    version,
    about = "Geocode approved food establishments from a CSV export and emit map-ready JSON"
)]
struct Args {
    /// CSV export of approved establishments
    input: PathBuf,

    #[arg(long = "category", value_name = "CATEGORY", help = "Keep records with this category (repeatable)")]
    categories: Vec<String>,

    #[arg(long = "facility", value_name = "FACILITY", help = "Keep records with this facility type (repeatable)")]
    facilities: Vec<String>,

    #[arg(long = "authority", value_name = "AUTHORITY", help = "Keep records under this local authority (repeatable)")]
    authorities: Vec<String>,

    #[arg(long = "country", value_name = "COUNTRY", help = "Keep records in this country (repeatable)")]
    countries: Vec<String>,

    #[arg(short, long, value_name = "FILE", help = "Write JSON here instead of stdout")]
    output: Option<PathBuf>,

    #[arg(long, help = "Pretty-print the JSON output")]
    pretty: bool,
}

impl Args {
    fn criteria(&self) -> FilterCriteria {
        FilterCriteria::new()
            .with(FilterDimension::Category, self.categories.iter().cloned())
            .with(FilterDimension::FacilityType, self.facilities.iter().cloned())
            .with(FilterDimension::Authority, self.authorities.iter().cloned())
            .with(FilterDimension::Country, self.countries.iter().cloned())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = AppConfig::from_env();
    let pipeline = LocationPipeline::new(&config, Arc::new(GeocodeCache::new()))
        .context("failed to build location pipeline")?;

    let cancel_flag = Arc::new(AtomicBool::new(false));
    {
        let cancel_flag = Arc::clone(&cancel_flag);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("interrupt received, cancelling run");
                    cancel_flag.store(true, Ordering::SeqCst);
                }
                Err(err) => warn!(?err, "failed to install Ctrl-C handler"),
            }
        });
    }

    let observer: ProgressObserver = Arc::new(|progress: PipelineProgress| {
        info!(
            processed = progress.processed,
            total = progress.total,
            "processing locations"
        );
    });

    let source = CsvFileSource::new(args.input.clone());
    let output = match pipeline
        .run_source(&source, Some(observer), Some(cancel_flag))
        .await
    {
        Ok(output) => output,
        Err(err) => {
            if err.is_retryable() {
                eprintln!(
                    "Could not process {}. Fix the input and run the command again to retry.",
                    args.input.display()
                );
            }
            return Err(anyhow::Error::new(err)
                .context(format!("failed to process {}", args.input.display())));
        }
    };

    let criteria = args.criteria();
    let records = filter::apply(&output.records, &criteria);
    info!(
        total = output.records.len(),
        shown = records.len(),
        "filters applied"
    );

    let writer: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    };
    let mut writer = BufWriter::new(writer);
    if args.pretty {
        serde_json::to_writer_pretty(&mut writer, &records)?;
    } else {
        serde_json::to_writer(&mut writer, &records)?;
    }
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}
