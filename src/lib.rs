//! Lead-generation workflow orchestrator.
//!
//! Sources local businesses for an agency, scores and stores them, audits their
//! websites into sales dossiers, and meters every paid step through a billing
//! gate that can pause a flow and resume it later.
//!
//! # Modules
//!
//! - `signals`: qualification signals, scoring and the hard filter.
//! - `persistence`: deduplicated opportunity inserts.
//! - `phases`: phase state machine and weighted progress.
//! - `billing`: billing gate and the pause signal.
//! - `ledger`: at-most-once dossier charging.
//! - `audit`, `dossier`: the per-opportunity audit pipeline.
//! - `orchestrator`: the six-phase flow, start, resume and recovery.
//! - `store`, `db_storage`, `db`: document storage (in-memory and Postgres).
//! - `services`: external collaborator contracts and HTTP clients.
//! - `handlers`: HTTP API.
//! - `config`, `errors`, `retry`, `circuit_breaker`: shared plumbing.

pub mod audit;
pub mod billing;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod db_storage;
pub mod dossier;
pub mod errors;
pub mod handlers;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod phases;
pub mod retry;
pub mod services;
pub mod signals;
pub mod store;
