//! Persistence seam for institutions, correspondent banks, settlement queues
//! and batches.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use closedloop_common::{BankId, Currency, InstitutionId, LedgerError, Result, TransactionId};

use crate::bank::CorrespondentBank;
use crate::batch::{BatchStatus, SettlementBatch};
use crate::institution::{FinancialInstitution, UpsertOutcome};

/// A booked transfer waiting to be settled with a correspondent bank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSettlement {
    pub transaction_id: TransactionId,
    pub amount: Decimal,
    pub currency: Currency,
    pub queued_at: DateTime<Utc>,
}

/// Builds a batch from a bank's queued items, oldest first. `None` leaves
/// the queue untouched.
pub type BatchCutter<'a> =
    dyn Fn(&[PendingSettlement]) -> Result<Option<SettlementBatch>> + Send + Sync + 'a;

/// Storage backend for settlement state.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    /// Store an institution unless one with the same SWIFT lookup key exists,
    /// in which case the existing record is returned untouched.
    async fn insert_institution(&self, institution: &FinancialInstitution) -> Result<UpsertOutcome>;

    async fn get_institution(&self, lookup_key: &str) -> Result<Option<FinancialInstitution>>;

    async fn get_institution_by_id(&self, id: InstitutionId) -> Result<Option<FinancialInstitution>>;

    async fn set_institution_active(
        &self,
        lookup_key: &str,
        active: bool,
    ) -> Result<Option<FinancialInstitution>>;

    /// All institutions sorted by name.
    async fn list_institutions(&self) -> Result<Vec<FinancialInstitution>>;

    /// Fails with `DuplicateBankCode` if the code is taken.
    async fn insert_bank(&self, bank: &CorrespondentBank) -> Result<()>;

    async fn get_bank(&self, id: BankId) -> Result<Option<CorrespondentBank>>;

    /// `bank_code` is already normalized to upper case.
    async fn find_bank_by_code(&self, bank_code: &str) -> Result<Option<CorrespondentBank>>;

    /// All banks sorted by name.
    async fn list_banks(&self) -> Result<Vec<CorrespondentBank>>;

    async fn set_bank_active(&self, id: BankId, active: bool) -> Result<CorrespondentBank>;

    /// Append to a bank's queue. Fails with `DuplicateRequest` if the
    /// transaction was ever queued before, batched or not.
    async fn enqueue(&self, bank_id: BankId, item: &PendingSettlement) -> Result<()>;

    /// Unbatched items for a bank, oldest first.
    async fn pending(&self, bank_id: BankId) -> Result<Vec<PendingSettlement>>;

    /// Hand every unbatched item for a bank to `cut` and, if it returns a
    /// batch, store the batch and detach the items from the queue. Concurrent
    /// calls for the same bank never see the same items.
    async fn cut_batch(
        &self,
        bank_id: BankId,
        cut: &BatchCutter<'_>,
    ) -> Result<Option<SettlementBatch>>;

    async fn insert_batch(&self, batch: &SettlementBatch) -> Result<()>;

    async fn get_batch(&self, batch_id: &str) -> Result<Option<SettlementBatch>>;

    /// Replace a stored batch if its status is still `expected`. Returns
    /// false when another writer moved it first.
    async fn update_batch(&self, batch: &SettlementBatch, expected: BatchStatus) -> Result<bool>;

    /// Batches for a bank, oldest first.
    async fn batches_for_bank(&self, bank_id: BankId) -> Result<Vec<SettlementBatch>>;

    async fn batches_with_status(&self, status: BatchStatus) -> Result<Vec<SettlementBatch>>;
}

/// In-process store, used when no database is configured and in tests.
pub fn memory() -> Arc<dyn SettlementStore> {
    Arc::new(MemorySettlementStore::new())
}

#[derive(Default)]
struct State {
    banks: HashMap<BankId, CorrespondentBank>,
    bank_codes: HashMap<String, BankId>,
    pending: HashMap<BankId, VecDeque<PendingSettlement>>,
    /// Every transaction ever queued.
    seen: HashSet<TransactionId>,
    batches: HashMap<String, SettlementBatch>,
}

/// Settlement store kept in memory.
#[derive(Default)]
pub struct MemorySettlementStore {
    institutions: DashMap<String, FinancialInstitution>,
    state: Mutex<State>,
}

impl MemorySettlementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettlementStore for MemorySettlementStore {
    async fn insert_institution(&self, institution: &FinancialInstitution) -> Result<UpsertOutcome> {
        match self
            .institutions
            .entry(institution.swift_code.lookup_key().to_string())
        {
            Entry::Occupied(existing) => Ok(UpsertOutcome::Skipped(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(institution.clone());
                Ok(UpsertOutcome::Created(institution.clone()))
            }
        }
    }

    async fn get_institution(&self, lookup_key: &str) -> Result<Option<FinancialInstitution>> {
        Ok(self.institutions.get(lookup_key).map(|i| i.clone()))
    }

    async fn get_institution_by_id(&self, id: InstitutionId) -> Result<Option<FinancialInstitution>> {
        Ok(self
            .institutions
            .iter()
            .find(|i| i.id == id)
            .map(|i| i.clone()))
    }

    async fn set_institution_active(
        &self,
        lookup_key: &str,
        active: bool,
    ) -> Result<Option<FinancialInstitution>> {
        Ok(self.institutions.get_mut(lookup_key).map(|mut i| {
            i.is_active = active;
            i.clone()
        }))
    }

    async fn list_institutions(&self) -> Result<Vec<FinancialInstitution>> {
        let mut all: Vec<_> = self.institutions.iter().map(|i| i.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn insert_bank(&self, bank: &CorrespondentBank) -> Result<()> {
        let mut state = self.state.lock();
        if state.bank_codes.contains_key(&bank.bank_code) {
            return Err(LedgerError::DuplicateBankCode(bank.bank_code.clone()));
        }
        state.bank_codes.insert(bank.bank_code.clone(), bank.id);
        state.banks.insert(bank.id, bank.clone());
        Ok(())
    }

    async fn get_bank(&self, id: BankId) -> Result<Option<CorrespondentBank>> {
        Ok(self.state.lock().banks.get(&id).cloned())
    }

    async fn find_bank_by_code(&self, bank_code: &str) -> Result<Option<CorrespondentBank>> {
        let state = self.state.lock();
        Ok(state
            .bank_codes
            .get(bank_code)
            .and_then(|id| state.banks.get(id))
            .cloned())
    }

    async fn list_banks(&self) -> Result<Vec<CorrespondentBank>> {
        let mut banks: Vec<_> = self.state.lock().banks.values().cloned().collect();
        banks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(banks)
    }

    async fn set_bank_active(&self, id: BankId, active: bool) -> Result<CorrespondentBank> {
        let mut state = self.state.lock();
        let bank = state.banks.get_mut(&id).ok_or(LedgerError::BankNotFound(id))?;
        bank.is_active = active;
        bank.updated_at = Utc::now();
        Ok(bank.clone())
    }

    async fn enqueue(&self, bank_id: BankId, item: &PendingSettlement) -> Result<()> {
        let mut state = self.state.lock();
        if !state.seen.insert(item.transaction_id.clone()) {
            return Err(LedgerError::DuplicateRequest(item.transaction_id.to_string()));
        }
        state
            .pending
            .entry(bank_id)
            .or_default()
            .push_back(item.clone());
        Ok(())
    }

    async fn pending(&self, bank_id: BankId) -> Result<Vec<PendingSettlement>> {
        Ok(self
            .state
            .lock()
            .pending
            .get(&bank_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn cut_batch(
        &self,
        bank_id: BankId,
        cut: &BatchCutter<'_>,
    ) -> Result<Option<SettlementBatch>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(queue) = state.pending.get_mut(&bank_id) else {
            return Ok(None);
        };
        let Some(batch) = cut(queue.make_contiguous())? else {
            return Ok(None);
        };
        queue.clear();
        state.batches.insert(batch.batch_id.clone(), batch.clone());
        Ok(Some(batch))
    }

    async fn insert_batch(&self, batch: &SettlementBatch) -> Result<()> {
        let mut state = self.state.lock();
        if state.batches.contains_key(&batch.batch_id) {
            return Err(LedgerError::DuplicateRequest(batch.batch_id.clone()));
        }
        state.batches.insert(batch.batch_id.clone(), batch.clone());
        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<SettlementBatch>> {
        Ok(self.state.lock().batches.get(batch_id).cloned())
    }

    async fn update_batch(&self, batch: &SettlementBatch, expected: BatchStatus) -> Result<bool> {
        let mut state = self.state.lock();
        match state.batches.get_mut(&batch.batch_id) {
            Some(stored) if stored.status == expected => {
                *stored = batch.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(LedgerError::BatchNotFound(batch.batch_id.clone())),
        }
    }

    async fn batches_for_bank(&self, bank_id: BankId) -> Result<Vec<SettlementBatch>> {
        let mut batches: Vec<_> = self
            .state
            .lock()
            .batches
            .values()
            .filter(|b| b.bank_id == bank_id)
            .cloned()
            .collect();
        batches.sort_by_key(|b| b.created_at);
        Ok(batches)
    }

    async fn batches_with_status(&self, status: BatchStatus) -> Result<Vec<SettlementBatch>> {
        let mut batches: Vec<_> = self
            .state
            .lock()
            .batches
            .values()
            .filter(|b| b.status == status)
            .cloned()
            .collect();
        batches.sort_by_key(|b| b.created_at);
        Ok(batches)
    }
}
