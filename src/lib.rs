//! A batch-aggregation manager sitting in front of an LLM provider's async batch API.
//!
//! Incoming requests are admitted through the [`intake`] facade, grouped by `(endpoint, model)`
//! into draft [`model::Batch`]es by the [`aggregator`], uploaded and driven through the
//! provider's batch lifecycle by [`lifecycle`], parsed by the [`result_processor`], and fanned
//! out to their [`sinks`] by [`delivery`]. Every state change is a guarded, audited transition
//! persisted through the [`store::Store`] trait and announced on the [`bus`].
//!
//! # Example
//! ```no_run
//! use batch_manager::{Config, Intake, IntakeRequest};
//! use batch_manager::aggregator::AggregatorRegistry;
//! use batch_manager::bus::InMemoryBus;
//! use batch_manager::jobrunner::InMemoryJobRunner;
//! use batch_manager::model::{DeliveryConfig, Endpoint};
//! use batch_manager::store::in_memory::InMemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(InMemoryStore::new());
//!     let jobrunner = Arc::new(InMemoryJobRunner::default());
//!     let bus = Arc::new(InMemoryBus::new());
//!     let config = Config::from_env();
//!
//!     // In a real binary this closure enqueues the Lifecycle Engine's `upload` action; see
//!     // `main.rs` for the concrete wiring against a `ProviderClient`.
//!     let upload_trigger = Arc::new(|_batch_id| -> batch_manager::jobrunner::Job {
//!         Box::pin(async { Ok(()) })
//!     });
//!
//!     let registry = Arc::new(AggregatorRegistry::new(
//!         store, jobrunner, bus, config, upload_trigger,
//!     ));
//!     let intake = Intake::new(registry);
//!
//!     let accepted = intake
//!         .admit(IntakeRequest {
//!             custom_id: "req-1".into(),
//!             endpoint: Endpoint::Responses,
//!             model: "gpt-4o-mini".into(),
//!             request_payload: serde_json::json!({"model": "gpt-4o-mini", "input": "hi"}),
//!             delivery: DeliveryConfig::Webhook { url: "https://example.com/hook".into() },
//!         })
//!         .await?;
//!
//!     println!("admitted: {:?}", accepted.id());
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod batchfile;
pub mod bus;
pub mod config;
pub mod delivery;
pub mod error;
pub mod intake;
pub mod jobrunner;
pub mod lifecycle;
pub mod model;
pub mod provider;
pub mod result_processor;
pub mod sinks;
pub mod store;

pub use config::Config;
pub use error::{AdmitError, Error, Result};
pub use intake::{Intake, IntakeRequest};
