pub mod cache;
pub mod config;
pub mod errors;
pub mod fallback;
pub mod filter;
pub mod geocoder;
pub mod ingestion;
pub mod normalizer;
pub mod pipeline;
pub mod postcodes;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::cache::{GeocodeCache, GeocodeResult};
pub use crate::config::AppConfig;
pub use crate::errors::{AppError, AppResult};
pub use crate::fallback::{FallbackResolver, Provenance};
pub use crate::filter::{FilterCriteria, FilterDimension};
pub use crate::geocoder::{Geocoder, GeocoderOptions};
pub use crate::ingestion::{CsvFileSource, InMemorySource, RawRecord, RecordSource};
pub use crate::normalizer::NormalizedLocation;
pub use crate::pipeline::{
    LocatedRecord, LocationPipeline, PipelineOutput, PipelineProgress, ProgressObserver,
};
pub use crate::postcodes::{HttpPostcodeClient, PostcodeLookup, PostcodeService};

/// Installs the global subscriber once. Logs go to stderr so stdout stays
/// free for pipeline output.
pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,foodchain_map=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
