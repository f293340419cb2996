//! Closed-loop Settlement
//!
//! Financial institution directory, correspondent banks and the settlement
//! batches that move closed-loop balances back onto external rails, persisted
//! in memory or in Postgres.

pub mod bank;
pub mod batch;
pub mod institution;
pub mod postgres;
pub mod service;
pub mod store;

pub use bank::{CorrespondentBank, NewCorrespondentBank, SettlementMethod};
pub use batch::{BatchStatus, SettlementBatch};
pub use institution::{
    central_banks, is_valid_routing_number, FinancialInstitution, InstitutionRegistry,
    InstitutionType, NewInstitution, SeedReport, UpsertOutcome,
};
pub use postgres::PgSettlementStore;
pub use service::SettlementService;
pub use store::{MemorySettlementStore, PendingSettlement, SettlementStore};
