//! Online feature resolution: entity rows and feature references in, rows of feature values out.

use crate::config::{ResolverConfig, TimeoutMode};
use crate::error::{ServingError, ServingResult};
use crate::key_codec::{FeatureKeyCodec, LookupKey};
use crate::model::{EntityRow, FeatureReference, FeatureValue};
use crate::onlinestore::{LookupError, LookupResult, OnlineStore};
use crate::registry::{FeatureSetRegistry, ResolvedFeature};
use crate::util::prost_timestamp_to_datetime;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap as HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, instrument, warn};

#[derive(Debug, Clone)]
pub struct ResolvedRows {
    pub features: Vec<ResolvedFeature>,
    /// One row per entity row, one value per feature, both in request order.
    pub rows: Vec<Vec<FeatureValue>>,
}

impl ResolvedRows {
    /// Column names in `feature_set:version:feature` form.
    pub fn field_names(&self) -> Vec<String> {
        self.features
            .iter()
            .map(|feature| {
                format!(
                    "{}:{}:{}",
                    feature.reference.feature_set, feature.reference.version, feature.reference.name
                )
            })
            .collect()
    }
}

type ChunkResult = (usize, usize, Result<Vec<LookupResult>, LookupError>);

pub struct OnlineFeatureResolver {
    registry: Arc<dyn FeatureSetRegistry>,
    store: Arc<dyn OnlineStore>,
    codec: FeatureKeyCodec,
    config: ResolverConfig,
}

impl OnlineFeatureResolver {
    pub fn new(
        registry: Arc<dyn FeatureSetRegistry>,
        store: Arc<dyn OnlineStore>,
        codec: FeatureKeyCodec,
        config: ResolverConfig,
    ) -> Self {
        Self {
            registry,
            store,
            codec,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<dyn FeatureSetRegistry> {
        &self.registry
    }

    #[instrument(skip_all, fields(rows = entity_rows.len(), features = features.len()))]
    pub async fn resolve(
        &self,
        entity_rows: &[EntityRow],
        features: &[FeatureReference],
    ) -> ServingResult<ResolvedRows> {
        if features.is_empty() {
            return Err(ServingError::invalid_argument(
                "At least one feature reference is required",
            ));
        }
        let resolved = self.registry.resolve_features(features).await?;

        let mut unique_keys: Vec<LookupKey> = vec![];
        let mut key_slots: HashMap<LookupKey, usize> = HashMap::default();
        let mut cells: Vec<Vec<usize>> = Vec::with_capacity(entity_rows.len());
        for row in entity_rows {
            let mut row_slots = Vec::with_capacity(resolved.len());
            for feature in &resolved {
                let key = self.codec.lookup_key(row, feature)?;
                let slot = match key_slots.get(&key) {
                    Some(slot) => *slot,
                    None => {
                        let slot = unique_keys.len();
                        unique_keys.push(key.clone());
                        key_slots.insert(key, slot);
                        slot
                    }
                };
                row_slots.push(slot);
            }
            cells.push(row_slots);
        }
        debug!(
            lookups = entity_rows.len() * resolved.len(),
            unique = unique_keys.len(),
            "Built lookup keys"
        );

        let outcomes = self.fetch(unique_keys).await?;

        if !outcomes.is_empty()
            && outcomes
                .iter()
                .all(|o| matches!(o, Some(Err(err)) if err.is_unavailable()))
        {
            let reason = match &outcomes[0] {
                Some(Err(err)) => err.to_string(),
                _ => String::new(),
            };
            error!("Every online store lookup failed: {}", reason);
            return Err(ServingError::service_unavailable(reason));
        }

        let now = Utc::now();
        let rows = cells
            .iter()
            .zip(entity_rows)
            .map(|(slots, row)| {
                let reference_time = row.entity_timestamp.unwrap_or(now);
                slots
                    .iter()
                    .zip(&resolved)
                    .map(|(slot, feature)| {
                        feature_value(outcomes[*slot].as_ref(), feature, reference_time)
                    })
                    .collect()
            })
            .collect();
        Ok(ResolvedRows {
            features: resolved,
            rows,
        })
    }

    /// Runs every lookup under the request deadline. A `None` outcome means the lookup was
    /// still pending when the deadline passed.
    async fn fetch(&self, keys: Vec<LookupKey>) -> ServingResult<Vec<Option<LookupResult>>> {
        let mut outcomes: Vec<Option<LookupResult>> = vec![None; keys.len()];
        if keys.is_empty() {
            return Ok(outcomes);
        }
        let deadline = Instant::now() + self.config.timeout();
        let chunk_size = if self.store.supports_multi_get() {
            keys.len()
        } else {
            1
        };
        let keys = Arc::new(keys);
        let semaphore = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut join_set: JoinSet<ChunkResult> = JoinSet::new();
        for start in (0..keys.len()).step_by(chunk_size) {
            let end = (start + chunk_size).min(keys.len());
            let store = self.store.clone();
            let keys = keys.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (start, end, store.multi_get(&keys[start..end]).await)
            });
        }

        loop {
            match timeout_at(deadline, join_set.join_next()).await {
                Ok(Some(Ok((start, end, Ok(results))))) if results.len() == end - start => {
                    for (slot, result) in (start..end).zip(results) {
                        outcomes[slot] = Some(result);
                    }
                }
                Ok(Some(Ok((start, end, Ok(results))))) => {
                    warn!(
                        expected = end - start,
                        got = results.len(),
                        "Online store returned a mismatched number of results"
                    );
                    for outcome in &mut outcomes[start..end] {
                        *outcome = Some(Err(LookupError::Failed(
                            "mismatched number of results".to_string(),
                        )));
                    }
                }
                Ok(Some(Ok((start, end, Err(err))))) => {
                    for outcome in &mut outcomes[start..end] {
                        *outcome = Some(Err(err.clone()));
                    }
                }
                Ok(Some(Err(join_error))) => {
                    join_set.abort_all();
                    return Err(ServingError::internal(format!(
                        "Online store lookup task failed: {}",
                        join_error
                    )));
                }
                Ok(None) => break,
                Err(_) => {
                    join_set.abort_all();
                    let pending = outcomes.iter().filter(|o| o.is_none()).count();
                    warn!(
                        pending,
                        timeout_ms = self.config.timeout_ms,
                        "Online feature lookup timed out"
                    );
                    if self.config.timeout_mode == TimeoutMode::Fail {
                        return Err(ServingError::deadline_exceeded(format!(
                            "Online feature lookup did not finish within {} ms",
                            self.config.timeout_ms
                        )));
                    }
                    break;
                }
            }
        }
        Ok(outcomes)
    }
}

fn feature_value(
    outcome: Option<&LookupResult>,
    feature: &ResolvedFeature,
    reference_time: DateTime<Utc>,
) -> FeatureValue {
    match outcome {
        None => FeatureValue::error(),
        Some(Err(err)) => {
            debug!(feature = %feature.reference, "Lookup failed: {}", err);
            FeatureValue::error()
        }
        Some(Ok(None)) => FeatureValue::not_found(),
        Some(Ok(Some(stored))) => {
            let Some(value) = stored.value.clone() else {
                return FeatureValue::not_found();
            };
            let event_timestamp = stored
                .event_timestamp
                .as_ref()
                .map(prost_timestamp_to_datetime)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            match feature.feature_set.max_age() {
                Some(max_age) if event_timestamp + max_age < reference_time => {
                    FeatureValue::outdated(value, event_timestamp)
                }
                _ => FeatureValue::present(value, event_timestamp),
            }
        }
    }
}
