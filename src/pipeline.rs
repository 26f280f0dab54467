use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::{GeocodeCache, GeocodeResult};
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::fallback::{FallbackResolver, Provenance};
use crate::geocoder::{BatchResolution, GeocodeStats, Geocoder};
use crate::ingestion::{RawRecord, RecordSource};
use crate::normalizer::{normalize, NormalizationReport, NormalizedLocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineProgress {
    pub processed: usize,
    pub total: usize,
}

pub type ProgressObserver = Arc<dyn Fn(PipelineProgress) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatedRecord {
    #[serde(flatten)]
    pub location: NormalizedLocation,
    pub coordinate: GeocodeResult,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub normalization: NormalizationReport,
    pub geocode: GeocodeStats,
    pub geocoded: usize,
    pub fallback_raw_coordinates: usize,
    pub fallback_default: usize,
}

impl PipelineStats {
    fn count(&mut self, provenance: Provenance) {
        match provenance {
            Provenance::Geocoded => self.geocoded += 1,
            Provenance::FallbackRawCoordinates => self.fallback_raw_coordinates += 1,
            Provenance::FallbackDefault => self.fallback_default += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput {
    pub records: Vec<LocatedRecord>,
    pub stats: PipelineStats,
    pub completed_at: DateTime<Utc>,
}

pub struct LocationPipeline {
    geocoder: Geocoder,
    fallback: FallbackResolver,
    batch_size: usize,
    yield_between_batches: bool,
}

impl LocationPipeline {
    pub fn new(config: &AppConfig, cache: Arc<GeocodeCache>) -> AppResult<Self> {
        let geocoder = Geocoder::new(config, cache)?;
        let mut pipeline = Self::with_parts(
            geocoder,
            FallbackResolver::from_config(config),
            config.processing_batch_size,
        );
        pipeline.yield_between_batches = config.yield_between_batches;
        Ok(pipeline)
    }

    pub fn with_parts(geocoder: Geocoder, fallback: FallbackResolver, batch_size: usize) -> Self {
        Self {
            geocoder,
            fallback,
            batch_size: batch_size.max(1),
            yield_between_batches: true,
        }
    }

    pub fn geocoder(&self) -> &Geocoder {
        &self.geocoder
    }

    /// Pre-populates the geocode cache one postcode at a time. Returns how
    /// many of the given postcodes are resolvable afterwards.
    pub async fn warm_up(&self, postcodes: &[String]) -> usize {
        let mut resolved = 0;
        for postcode in postcodes {
            if self.geocoder.resolve_one(postcode).await.is_some() {
                resolved += 1;
            }
        }
        debug!(requested = postcodes.len(), resolved, "geocode cache warmed");
        resolved
    }

    pub async fn run_source(
        &self,
        source: &dyn RecordSource,
        observer: Option<ProgressObserver>,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> AppResult<PipelineOutput> {
        let raw = source.load()?;
        info!(source = %source.describe(), rows = raw.len(), "loaded source records");
        self.run(raw, observer, cancel_flag).await
    }

    pub async fn run(
        &self,
        raw: Vec<RawRecord>,
        observer: Option<ProgressObserver>,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> AppResult<PipelineOutput> {
        let cancel = cancel_flag.as_deref();
        ensure_active(cancel)?;

        let (locations, report) = normalize(&raw);
        drop(raw);

        let postcodes = distinct_postcodes(&locations);
        let resolution = if postcodes.is_empty() {
            BatchResolution::default()
        } else {
            self.geocoder.resolve_batch(&postcodes, cancel).await
        };
        ensure_active(cancel)?;

        let mut stats = PipelineStats {
            normalization: report,
            geocode: resolution.stats.clone(),
            ..PipelineStats::default()
        };
        let total = locations.len();
        let mut records = Vec::with_capacity(total);

        if total == 0 {
            notify(&observer, PipelineProgress { processed: 0, total });
        }

        let mut pending = locations.into_iter();
        let mut processed = 0;
        loop {
            let batch: Vec<NormalizedLocation> = pending.by_ref().take(self.batch_size).collect();
            if batch.is_empty() {
                break;
            }
            ensure_active(cancel)?;

            processed += batch.len();
            for location in batch {
                let geocoded = location
                    .postcode
                    .as_deref()
                    .and_then(|postcode| resolution.get(postcode));
                let (coordinate, provenance) = self.fallback.resolve(&location, geocoded);
                if provenance == Provenance::FallbackDefault {
                    debug!(id = %location.id, "placing record at default centroid");
                }
                stats.count(provenance);
                records.push(LocatedRecord {
                    location,
                    coordinate,
                    provenance,
                });
            }

            ensure_active(cancel)?;
            notify(&observer, PipelineProgress { processed, total });
            if self.yield_between_batches && processed < total {
                tokio::task::yield_now().await;
            }
        }

        info!(
            records = records.len(),
            geocoded = stats.geocoded,
            fallback_raw = stats.fallback_raw_coordinates,
            fallback_default = stats.fallback_default,
            "location pipeline completed"
        );
        Ok(PipelineOutput {
            records,
            stats,
            completed_at: Utc::now(),
        })
    }
}

fn distinct_postcodes(locations: &[NormalizedLocation]) -> Vec<String> {
    let mut seen = HashSet::new();
    locations
        .iter()
        .filter_map(|location| location.postcode.as_deref())
        .filter(|postcode| seen.insert(*postcode))
        .map(str::to_string)
        .collect()
}

fn ensure_active(cancel: Option<&AtomicBool>) -> AppResult<()> {
    match cancel {
        Some(flag) if flag.load(Ordering::SeqCst) => Err(AppError::Cancelled),
        _ => Ok(()),
    }
}

fn notify(observer: &Option<ProgressObserver>, progress: PipelineProgress) {
    if let Some(callback) = observer {
        callback(progress);
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::cache::normalize_postcode;
    use crate::geocoder::tests::{coordinate_for, test_options, RecordingLookup};
    use crate::geocoder::GeocoderOptions;
    use crate::ingestion::{CsvFileSource, InMemorySource};
    use crate::postcodes::PostcodeService;

    fn raw(position: usize, fields: &[(&str, &str)]) -> RawRecord {
        RawRecord::new(
            position,
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn pipeline(lookup: Arc<RecordingLookup>, options: GeocoderOptions, batch_size: usize) -> LocationPipeline {
        let geocoder = Geocoder::with_lookup(
            PostcodeService::from_lookup(lookup),
            Arc::new(GeocodeCache::new()),
            options,
        );
        LocationPipeline::with_parts(
            geocoder,
            FallbackResolver::from_config(&AppConfig::default()),
            batch_size,
        )
    }

    fn recording_observer() -> (ProgressObserver, Arc<Mutex<Vec<PipelineProgress>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer: ProgressObserver = Arc::new(move |progress: PipelineProgress| sink.lock().push(progress));
        (observer, seen)
    }

    #[tokio::test]
    async fn geocodes_shared_postcodes_with_one_batch_call() {
        let lookup = Arc::new(RecordingLookup::default());
        let pipeline = pipeline(lookup.clone(), test_options(), 50);
        let rows: Vec<_> = (1..=6)
            .map(|i| {
                let postcode = if i % 2 == 0 { "NR12 8JX" } else { "iv2 7bt" };
                raw(i, &[("Postcode", postcode)])
            })
            .collect();

        let output = pipeline.run(rows, None, None).await.unwrap();

        assert_eq!(lookup.batch_sizes(), vec![2]);
        assert_eq!(output.records.len(), 6);
        assert!(output
            .records
            .iter()
            .all(|record| record.provenance == Provenance::Geocoded));
        assert_eq!(output.records[0].coordinate, coordinate_for("IV27BT"));
        let ids: Vec<_> = output.records.iter().map(|r| r.location.id.as_str()).collect();
        assert_eq!(ids, vec!["row-1", "row-2", "row-3", "row-4", "row-5", "row-6"]);
        assert_eq!(output.stats.geocoded, 6);
    }

    #[tokio::test]
    async fn unresolved_records_fall_back_to_raw_or_default() {
        let mut lookup = RecordingLookup::default();
        lookup.unknown.insert("ZZ99ZZ".into());
        let pipeline = pipeline(Arc::new(lookup), test_options(), 50);
        let rows = vec![
            raw(1, &[("AppNo", "A"), ("Postcode", "ZZ9 9ZZ"), ("X", "-1.5"), ("Y", "53.8")]),
            raw(2, &[("AppNo", "B"), ("Postcode", "ZZ9 9ZZ")]),
            raw(3, &[("AppNo", "C"), ("X", "429157"), ("Y", "433986")]),
            raw(4, &[("AppNo", "D")]),
        ];

        let output = pipeline.run(rows, None, None).await.unwrap();

        let centroid = GeocodeResult::new(54.7023545, -3.2765753);
        assert_eq!(output.records.len(), 3);
        assert_eq!(output.records[0].provenance, Provenance::FallbackRawCoordinates);
        assert_eq!(output.records[0].coordinate, GeocodeResult::new(53.8, -1.5));
        assert_eq!(output.records[1].provenance, Provenance::FallbackDefault);
        assert_eq!(output.records[1].coordinate, centroid);
        assert_eq!(output.records[2].provenance, Provenance::FallbackDefault);
        assert_eq!(output.records[2].coordinate, centroid);
        assert_eq!(output.stats.normalization.dropped_unlocatable, 1);
        assert_eq!(output.stats.fallback_default, 2);
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_ends_at_total() {
        let lookup = Arc::new(RecordingLookup::default());
        let pipeline = pipeline(lookup, test_options(), 5);
        let rows: Vec<_> = (1..=23)
            .map(|i| {
                let postcode = format!("AB{i} 1CD");
                raw(i, &[("Postcode", postcode.as_str())])
            })
            .collect();
        let (observer, seen) = recording_observer();

        pipeline.run(rows, Some(observer), None).await.unwrap();

        let processed: Vec<usize> = seen.lock().iter().map(|p| p.processed).collect();
        assert_eq!(processed, vec![5, 10, 15, 20, 23]);
        assert!(processed.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(seen.lock().iter().all(|p| p.total == 23));
    }

    #[tokio::test]
    async fn empty_input_reports_zero_of_zero() {
        let lookup = Arc::new(RecordingLookup::default());
        let pipeline = pipeline(lookup.clone(), test_options(), 5);
        let (observer, seen) = recording_observer();

        let output = pipeline.run(Vec::new(), Some(observer), None).await.unwrap();

        assert!(output.records.is_empty());
        assert_eq!(*seen.lock(), vec![PipelineProgress { processed: 0, total: 0 }]);
        assert_eq!(lookup.total_calls(), 0);
    }

    #[tokio::test]
    async fn failing_chunk_records_use_fallback_provenance() {
        let postcodes = ["AA1 1AA", "BB2 2BB", "CC3 3CC", "DD4 4DD"];
        let mut lookup = RecordingLookup::default();
        lookup.failing.insert(normalize_postcode(postcodes[3]));
        let lookup = Arc::new(lookup);
        let options = GeocoderOptions {
            chunk_size: 2,
            ..test_options()
        };
        let pipeline = pipeline(lookup.clone(), options, 50);
        let rows: Vec<_> = postcodes
            .iter()
            .enumerate()
            .map(|(i, pc)| raw(i + 1, &[("Postcode", *pc)]))
            .collect();

        let output = pipeline.run(rows, None, None).await.unwrap();

        assert_eq!(lookup.batch_sizes(), vec![2, 2]);
        let provenance: Vec<_> = output.records.iter().map(|r| r.provenance).collect();
        assert_eq!(
            provenance,
            vec![
                Provenance::Geocoded,
                Provenance::Geocoded,
                Provenance::FallbackDefault,
                Provenance::FallbackDefault,
            ]
        );
        assert_eq!(output.stats.geocode.failed_chunks, 1);
    }

    #[tokio::test]
    async fn cancellation_stops_progress_and_reports_cancelled() {
        let lookup = Arc::new(RecordingLookup::default());
        let pipeline = pipeline(lookup, test_options(), 2);
        let rows: Vec<_> = (1..=10)
            .map(|i| {
                let postcode = format!("CD{i} 2EF");
                raw(i, &[("Postcode", postcode.as_str())])
            })
            .collect();
        let cancel = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer: ProgressObserver = {
            let cancel = Arc::clone(&cancel);
            let seen = Arc::clone(&seen);
            Arc::new(move |progress: PipelineProgress| {
                seen.lock().push(progress);
                cancel.store(true, Ordering::SeqCst);
            })
        };

        let result = pipeline.run(rows, Some(observer), Some(cancel)).await;

        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_network_calls() {
        let lookup = Arc::new(RecordingLookup::default());
        let pipeline = pipeline(lookup.clone(), test_options(), 2);
        let rows = vec![raw(1, &[("Postcode", "EF1 1GH")])];

        let result = pipeline
            .run(rows, None, Some(Arc::new(AtomicBool::new(true))))
            .await;

        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(lookup.total_calls(), 0);
    }

    #[tokio::test]
    async fn unreadable_source_fails_without_progress() {
        let pipeline = pipeline(Arc::new(RecordingLookup::default()), test_options(), 5);
        let (observer, seen) = recording_observer();

        let result = pipeline
            .run_source(
                &CsvFileSource::new("/missing/extract.csv"),
                Some(observer),
                None,
            )
            .await;

        assert!(matches!(result, Err(AppError::Ingestion(_))));
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn warm_up_fills_cache_for_later_runs() {
        let lookup = Arc::new(RecordingLookup::default());
        let pipeline = pipeline(lookup.clone(), test_options(), 5);

        let resolved = pipeline.warm_up(&["ab1 2cd".to_string()]).await;
        assert_eq!(resolved, 1);

        let source = InMemorySource::new(vec![raw(1, &[("Postcode", "AB1 2CD")])]);
        let output = pipeline.run_source(&source, None, None).await.unwrap();

        assert_eq!(output.records[0].provenance, Provenance::Geocoded);
        assert_eq!(output.stats.geocode.cache_hits, 1);
        assert!(lookup.batches.lock().is_empty());
    }
}
