//! Financial institution registry and idempotent seeding.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use closedloop_common::{InstitutionId, LedgerError, Result, SwiftCode};

use crate::store::{self, SettlementStore};

/// Kind of financial institution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstitutionType {
    Bank,
    CreditUnion,
    InvestmentFirm,
    CentralBank,
    Government,
    Other,
}

impl InstitutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstitutionType::Bank => "bank",
            InstitutionType::CreditUnion => "credit_union",
            InstitutionType::InvestmentFirm => "investment_firm",
            InstitutionType::CentralBank => "central_bank",
            InstitutionType::Government => "government",
            InstitutionType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "bank" => InstitutionType::Bank,
            "credit_union" => InstitutionType::CreditUnion,
            "investment_firm" => InstitutionType::InvestmentFirm,
            "central_bank" => InstitutionType::CentralBank,
            "government" => InstitutionType::Government,
            "other" => InstitutionType::Other,
            _ => return None,
        };
        Some(kind)
    }
}

/// Check an ABA routing number: nine digits with a weighted mod-10 checksum.
pub fn is_valid_routing_number(routing_number: &str) -> bool {
    let digits: Vec<u32> = routing_number.chars().filter_map(|c| c.to_digit(10)).collect();
    if routing_number.len() != 9 || digits.len() != 9 {
        return false;
    }
    let checksum = 3 * (digits[0] + digits[3] + digits[6])
        + 7 * (digits[1] + digits[4] + digits[7])
        + (digits[2] + digits[5] + digits[8]);
    checksum % 10 == 0
}

/// Validate an optional routing number, passing `None` through.
pub fn check_routing_number(routing_number: Option<&str>) -> Result<Option<String>> {
    match routing_number.map(str::trim).filter(|r| !r.is_empty()) {
        None => Ok(None),
        Some(r) if is_valid_routing_number(r) => Ok(Some(r.to_string())),
        Some(r) => Err(LedgerError::InvalidRoutingNumber(r.to_string())),
    }
}

/// Institution data as supplied by an operator or a seed list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInstitution {
    pub name: String,
    pub institution_type: InstitutionType,
    pub swift_code: String,
    pub ach_routing_number: Option<String>,
    pub country: String,
    /// Name of the RTGS system the institution settles through.
    pub rtgs_system: Option<String>,
    pub rtgs_enabled: bool,
    /// Server-to-server transfers supported.
    pub s2s_enabled: bool,
    pub is_active: bool,
}

impl NewInstitution {
    pub fn new(
        name: impl Into<String>,
        institution_type: InstitutionType,
        swift_code: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            institution_type,
            swift_code: swift_code.into(),
            ach_routing_number: None,
            country: country.into(),
            rtgs_system: None,
            rtgs_enabled: false,
            s2s_enabled: false,
            is_active: true,
        }
    }

    /// Mark the institution as reachable over RTGS and server-to-server rails.
    pub fn with_rtgs(mut self, system: impl Into<String>) -> Self {
        self.rtgs_system = Some(system.into());
        self.rtgs_enabled = true;
        self.s2s_enabled = true;
        self
    }

    pub fn with_routing_number(mut self, routing_number: impl Into<String>) -> Self {
        self.ach_routing_number = Some(routing_number.into());
        self
    }
}

/// A registered financial institution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialInstitution {
    pub id: InstitutionId,
    pub name: String,
    pub institution_type: InstitutionType,
    pub swift_code: SwiftCode,
    pub ach_routing_number: Option<String>,
    pub country: String,
    pub rtgs_system: Option<String>,
    pub rtgs_enabled: bool,
    pub s2s_enabled: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl FinancialInstitution {
    fn from_new(new: NewInstitution, swift_code: SwiftCode, ach_routing_number: Option<String>) -> Self {
        Self {
            id: InstitutionId::new(),
            name: new.name,
            institution_type: new.institution_type,
            swift_code,
            ach_routing_number,
            country: new.country,
            rtgs_system: new.rtgs_system,
            rtgs_enabled: new.rtgs_enabled,
            s2s_enabled: new.s2s_enabled,
            is_active: new.is_active,
            created_at: Utc::now(),
        }
    }
}

/// Result of an upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Created(FinancialInstitution),
    /// An institution with the same SWIFT code already existed and was left untouched.
    Skipped(FinancialInstitution),
}

impl UpsertOutcome {
    pub fn institution(&self) -> &FinancialInstitution {
        match self {
            UpsertOutcome::Created(i) | UpsertOutcome::Skipped(i) => i,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, UpsertOutcome::Created(_))
    }
}

/// Counts from a seeding run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedReport {
    pub created: usize,
    pub skipped: usize,
}

/// Registry of financial institutions, keyed by normalized SWIFT code.
#[derive(Clone)]
pub struct InstitutionRegistry {
    store: Arc<dyn SettlementStore>,
}

impl InstitutionRegistry {
    pub fn new(store: Arc<dyn SettlementStore>) -> Self {
        Self { store }
    }

    /// Registry over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(store::memory())
    }

    /// Insert an institution unless one with the same SWIFT code exists.
    pub async fn upsert(&self, new: NewInstitution) -> Result<UpsertOutcome> {
        let swift_code = SwiftCode::parse(&new.swift_code)?;
        let routing = check_routing_number(new.ach_routing_number.as_deref())?;
        let institution = FinancialInstitution::from_new(new, swift_code, routing);

        let outcome = self.store.insert_institution(&institution).await?;
        match &outcome {
            UpsertOutcome::Created(i) => info!(
                swift_code = %i.swift_code,
                name = %i.name,
                "Institution registered"
            ),
            UpsertOutcome::Skipped(i) => {
                debug!(swift_code = %i.swift_code, "Institution already registered")
            }
        }
        Ok(outcome)
    }

    /// Seed a list of institutions. Safe to run repeatedly.
    ///
    /// Every SWIFT code is validated before anything is inserted.
    #[instrument(skip(self, institutions), fields(count = institutions.len()))]
    pub async fn seed(&self, institutions: &[NewInstitution]) -> Result<SeedReport> {
        for new in institutions {
            SwiftCode::parse(&new.swift_code)?;
            check_routing_number(new.ach_routing_number.as_deref())?;
        }

        let mut report = SeedReport::default();
        for new in institutions {
            if self.upsert(new.clone()).await?.was_created() {
                report.created += 1;
            } else {
                report.skipped += 1;
            }
        }
        info!(created = report.created, skipped = report.skipped, "Institution seeding finished");
        Ok(report)
    }

    /// Look up by SWIFT code. An 8-character code finds its `XXX` form and vice versa.
    pub async fn get(&self, swift_code: &str) -> Result<FinancialInstitution> {
        let code = SwiftCode::parse(swift_code)?;
        self.store
            .get_institution(code.lookup_key())
            .await?
            .ok_or_else(|| LedgerError::InstitutionNotFound(code.to_string()))
    }

    pub async fn get_by_id(&self, id: InstitutionId) -> Result<Option<FinancialInstitution>> {
        self.store.get_institution_by_id(id).await
    }

    /// Enable or disable an institution.
    pub async fn set_active(&self, swift_code: &str, active: bool) -> Result<FinancialInstitution> {
        let code = SwiftCode::parse(swift_code)?;
        let institution = self
            .store
            .set_institution_active(code.lookup_key(), active)
            .await?
            .ok_or_else(|| LedgerError::InstitutionNotFound(code.to_string()))?;
        info!(swift_code = %institution.swift_code, active, "Institution status changed");
        Ok(institution)
    }

    /// All institutions sorted by name.
    pub async fn list(&self) -> Result<Vec<FinancialInstitution>> {
        self.store.list_institutions().await
    }

    /// Active institutions that accept RTGS transfers.
    pub async fn rtgs_enabled(&self) -> Result<Vec<FinancialInstitution>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|i| i.is_active && i.rtgs_enabled)
            .collect())
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.list().await?.len())
    }
}

/// Built-in seed list of central banks and international financial institutions.
pub fn central_banks() -> Vec<NewInstitution> {
    vec![
        NewInstitution::new(
            "Federal Reserve Bank of the United States",
            InstitutionType::CentralBank,
            "FRNYUS33",
            "United States",
        )
        .with_rtgs("Fedwire Funds Service"),
        NewInstitution::new("Bank of China", InstitutionType::Bank, "BKCHCNBJ", "China")
            .with_rtgs("China National Advanced Payment System (CNAPS)"),
        NewInstitution::new(
            "European Central Bank",
            InstitutionType::CentralBank,
            "ECBFDEFFXXX",
            "European Union",
        )
        .with_rtgs("TARGET2"),
        NewInstitution::new("World Bank", InstitutionType::Other, "IBRDUS33", "International")
            .with_rtgs("IBRD Funds Transfer System"),
        NewInstitution::new(
            "International Monetary Fund",
            InstitutionType::Other,
            "IMFDUS33",
            "International",
        )
        .with_rtgs("IMF Funding System"),
        NewInstitution::new(
            "Bank for International Settlements",
            InstitutionType::Other,
            "BISBCHBB",
            "International/Switzerland",
        )
        .with_rtgs("BIS Correspondent Banking Services"),
        NewInstitution::new(
            "African Development Bank",
            InstitutionType::Other,
            "AFDBCIAC",
            "Pan-African",
        )
        .with_rtgs("AfDB Regional Payment System"),
    ]
}
