//! qaflow orchestration engine
//!
//! Drives guarded, interactive exploration and testing runs against a web
//! application:
//! - `login`: session check, credential detection, login and validation
//! - `discovery`: context detection, breadth-first crawl, summary
//! - `testgen` / `executor` / `report`: plan building from the schema
//!   registry (plus optional AI), execution with evidence, final report
//! - `admission` / `orchestrator`: concurrency caps and the run state machine
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  Orchestrator                                                  │
//! │    create_run ── guards ── AdmissionController ── spawn        │
//! │    submit_answer / cancel / status / list_runs / artifacts     │
//! ├────────────────────────────────────────────────────────────────┤
//! │  per run: RunRecord (RunContext, state, question, history)     │
//! │    LoginPipeline → DiscoveryRunner → PlanBuilder → Executor    │
//! │                                       ↑                        │
//! │                        SchemaRegistry + ProviderCache          │
//! ├────────────────────────────────────────────────────────────────┤
//! │  RunStore (SQLite | memory)      ArtifactStore (JSON per run)  │
//! └────────────────────────────────────────────────────────────────┘
//! ```

pub mod admission;
pub mod ai;
pub mod artifacts;
pub mod config;
pub mod discovery;
pub mod executor;
pub mod login;
pub mod orchestrator;
pub mod report;
pub mod run;
pub mod schema;
pub mod store;
pub mod testgen;

pub use admission::{AdmissionController, AdmissionPermit, AdmissionSnapshot};
pub use ai::{AiProvider, OutputSchema, ProviderCache, ProviderKind, ProviderSettings};
pub use artifacts::{ArtifactInfo, ArtifactStore};
pub use config::EngineConfig;
pub use orchestrator::{Orchestrator, RunRequest, TEST_SCOPE_VARIABLE};
pub use run::{RunRecord, RunSnapshot, RunSummary};
pub use schema::SchemaRegistry;
pub use store::{MemoryRunStore, RunStore, SqliteRunStore};
