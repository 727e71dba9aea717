//! Intake Facade (`SPEC_FULL.md` §4.8) — the single synchronous-feeling entry point edges call
//! to admit a request into the core.
//!
//! Grounded in Design Notes §9's "global state" note (a process-wide atomic flag gates intake)
//! and in the teacher's `manager::RequestManager::submit_requests` as the shape of "one public
//! entry function that hands off to internal admission machinery".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::aggregator::{AdmitRequest, AggregatorRegistry};
use crate::bus::Bus;
use crate::error::AdmitError;
use crate::jobrunner::JobRunner;
use crate::model::{AnyRequest, DeliveryConfig, Endpoint};
use crate::store::Store;

/// A validated request as accepted from an edge, before admission.
#[derive(Debug, Clone)]
pub struct IntakeRequest {
    pub custom_id: String,
    pub endpoint: Endpoint,
    pub model: String,
    pub request_payload: Value,
    pub delivery: DeliveryConfig,
}

/// Thin facade in front of an `AggregatorRegistry`: validates, checks the maintenance gate, and
/// retries admission once if the Aggregator raced the request off its Batch (`SPEC_FULL.md` §4.8:
/// "On `batch_full`/`batch_not_building` the facade retries once").
pub struct Intake<St: Store, JR: JobRunner, B: Bus> {
    registry: Arc<AggregatorRegistry<St, JR, B>>,
    maintenance: AtomicBool,
}

impl<St: Store + 'static, JR: JobRunner + 'static, B: Bus + 'static> Intake<St, JR, B> {
    pub fn new(registry: Arc<AggregatorRegistry<St, JR, B>>) -> Self {
        Self {
            registry,
            maintenance: AtomicBool::new(false),
        }
    }

    /// Refuse/allow new intake process-wide. Requests already in flight are unaffected.
    pub fn set_maintenance_mode(&self, enabled: bool) {
        self.maintenance.store(enabled, Ordering::SeqCst);
    }

    pub fn is_in_maintenance_mode(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    #[tracing::instrument(skip(self, request), fields(custom_id = %request.custom_id, model = %request.model))]
    pub async fn admit(&self, request: IntakeRequest) -> Result<AnyRequest, AdmitError> {
        if self.is_in_maintenance_mode() {
            return Err(AdmitError::MaintenanceMode);
        }

        request.delivery.validate()?;

        let admit_request = AdmitRequest {
            custom_id: request.custom_id,
            request_payload: request.request_payload,
            delivery_config: request.delivery,
        };

        match self
            .registry
            .admit(request.endpoint, &request.model, admit_request.clone())
            .await
        {
            Ok(accepted) => Ok(accepted),
            Err(AdmitError::BatchFull) | Err(AdmitError::BatchNotBuilding) => {
                tracing::debug!("admission raced batch closure, retrying once");
                self.registry
                    .admit(request.endpoint, &request.model, admit_request)
                    .await
            }
            Err(e) => Err(e),
        }
    }
}
