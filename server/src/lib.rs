pub mod config;
pub mod db;
pub mod errors;
pub mod evaluator;
pub mod ingest;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod notify;
pub mod registry;
pub mod rest;
pub mod rule;
pub mod sensors;
pub mod timeseries;

use evaluator::EvaluationJob;
use ingest::Ingestor;
use registry::{DeviceDirectory, SensorRegistry};
use rest::AppState;
use rule::RuleStore;
use sensors::SensorService;
use std::sync::Arc;
use timeseries::ReadingStore;
use tokio::sync::mpsc;

/// Wires the HTTP state around a single store backing every seam.
pub fn app_state<S>(store: Arc<S>, evaluations: mpsc::Sender<EvaluationJob>) -> AppState
where
    S: DeviceDirectory + SensorRegistry + ReadingStore + RuleStore + 'static,
{
    let ingestor = Ingestor::new(store.clone(), store.clone(), store.clone(), evaluations);
    let sensors = SensorService::new(store.clone(), store.clone());
    AppState {
        directory: store.clone(),
        registry: store.clone(),
        readings: store.clone(),
        rules: store,
        ingestor: Arc::new(ingestor),
        sensors: Arc::new(sensors),
    }
}
