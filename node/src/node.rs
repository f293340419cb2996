//! The ledger node: owns the ledger, settlement and messaging services and
//! drives the periodic settlement sweep.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use closedloop_common::{AccountId, BankId, LedgerError, TransactionId, TransactionStatus, UserId};
use closedloop_ledger::store::{self, LedgerStore};
use closedloop_ledger::{LedgerEngine, PgLedgerStore, PostedTransaction, TransferRequest};
use closedloop_protocol::{
    parse_message, AckReport, EdiService, EdiStatus, EdiTransaction, IncomingTelex,
    ReceiveOutcome, TelexMessage, TelexService,
};
use closedloop_settlement::store::{self as settlement_store, SettlementStore};
use closedloop_settlement::{
    central_banks, InstitutionRegistry, PgSettlementStore, SeedReport, SettlementBatch,
    SettlementService,
};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::metrics::{Metrics, SharedMetrics};
use crate::state::NodeState;

/// How long `stop` waits for the sweep task to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Node {
    config: NodeConfig,
    state: RwLock<NodeState>,
    ledger: Arc<LedgerEngine>,
    settlement: Arc<SettlementService>,
    institutions: InstitutionRegistry,
    telex: TelexService,
    edi: EdiService,
    metrics: SharedMetrics,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Create a node over existing ledger and settlement stores.
    pub fn new(
        config: NodeConfig,
        ledger_store: Arc<dyn LedgerStore>,
        settlement_store: Arc<dyn SettlementStore>,
    ) -> Self {
        let ledger =
            Arc::new(LedgerEngine::new(ledger_store).with_currency(config.currency.clone()));
        let settlement = Arc::new(SettlementService::new(
            Arc::clone(&ledger),
            config.operator_id,
            Arc::clone(&settlement_store),
        ));
        let institutions = InstitutionRegistry::new(settlement_store);
        if config.telex.has_credentials() {
            warn!("Telex credentials are set but no live transport is wired; messages are simulated");
        }
        let telex = TelexService::simulated(config.telex.clone());
        let edi = EdiService::simulated(config.edi.clone());
        if let Some(path) = &config.edi.partners_file {
            if let Err(e) = edi.load_partners(path) {
                warn!(error = %e, "EDI partners not loaded");
            }
        }
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            state: RwLock::new(NodeState::Starting),
            ledger,
            settlement,
            institutions,
            telex,
            edi,
            metrics: Arc::new(Metrics::new()),
            shutdown_tx,
            sweeper: Mutex::new(None),
        }
    }

    /// Create a node that keeps all state in memory.
    pub fn in_memory(config: NodeConfig) -> Self {
        Self::new(config, store::memory(), settlement_store::memory())
    }

    /// Create a node backed by Postgres when `database_url` is set, running
    /// pending migrations first. Falls back to memory otherwise.
    pub async fn connect(config: NodeConfig) -> Result<Self> {
        let (ledger_store, settlement_store): (Arc<dyn LedgerStore>, Arc<dyn SettlementStore>) =
            match &config.database_url {
                Some(url) => {
                    let pg = PgLedgerStore::connect(url, config.max_db_connections).await?;
                    pg.migrate().await?;
                    let settlement = PgSettlementStore::new(pg.pool().clone());
                    settlement.migrate().await?;
                    info!(
                        max_connections = config.max_db_connections,
                        "Connected to Postgres ledger and settlement stores"
                    );
                    (Arc::new(pg), Arc::new(settlement))
                }
                None => {
                    warn!("DATABASE_URL not set, state will not survive a restart");
                    (store::memory(), settlement_store::memory())
                }
            };
        Ok(Self::new(config, ledger_store, settlement_store))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn is_accepting_requests(&self) -> bool {
        self.state().accepts_requests()
    }

    pub fn ledger(&self) -> &Arc<LedgerEngine> {
        &self.ledger
    }

    pub fn settlement(&self) -> &Arc<SettlementService> {
        &self.settlement
    }

    pub fn institutions(&self) -> &InstitutionRegistry {
        &self.institutions
    }

    pub fn telex(&self) -> &TelexService {
        &self.telex
    }

    pub fn edi(&self) -> &EdiService {
        &self.edi
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Move to `Running` and start the settlement sweep task.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != NodeState::Starting {
                return Err(LedgerError::transition(*state, NodeState::Running).into());
            }
            *state = NodeState::Running;
        }

        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(Arc::clone(self).sweep_loop(shutdown_rx));
        *self.sweeper.lock() = Some(handle);

        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs_f64(),
            method = %self.config.settlement_method,
            "Node started"
        );
        Ok(())
    }

    /// Stop accepting requests and wait for the sweep task to exit.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if matches!(*state, NodeState::ShuttingDown | NodeState::Stopped) {
                return Ok(());
            }
            *state = NodeState::ShuttingDown;
        }
        info!("Node shutting down");

        self.shutdown_tx.send_replace(true);
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Sweep task ended abnormally"),
                Err(_) => warn!("Timed out waiting for the sweep task"),
            }
        }

        *self.state.write() = NodeState::Stopped;
        info!("Node stopped");
        Ok(())
    }

    async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_sweep().await {
                        warn!(error = %e, code = e.error_code(), "Settlement sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Settlement sweep loop exited");
    }

    /// Cut batches for every bank whose queue has reached its threshold.
    pub async fn run_sweep(&self) -> std::result::Result<Vec<SettlementBatch>, LedgerError> {
        let batches = self.settlement.sweep(self.config.settlement_method).await?;
        self.metrics.sweep_completed(batches.len());
        if !batches.is_empty() {
            let total = batches
                .iter()
                .try_fold(Decimal::ZERO, |acc, b| acc.checked_add(b.total_amount));
            match total {
                Some(total) => {
                    info!(batches = batches.len(), total = %total, "Settlement sweep cut batches")
                }
                None => info!(batches = batches.len(), "Settlement sweep cut batches"),
            }
        }
        Ok(batches)
    }

    fn ensure_accepting(&self) -> Result<()> {
        let state = self.state();
        if state.accepts_requests() {
            Ok(())
        } else {
            Err(NodeError::NotAccepting(state))
        }
    }

    /// Post a transfer between two ledger accounts.
    #[instrument(skip(self, request), fields(from = %request.from, to = %request.to, amount = %request.amount))]
    pub async fn transfer(&self, request: TransferRequest) -> Result<PostedTransaction> {
        self.ensure_accepting()?;
        let outcome = self.ledger.transfer(request).await;
        self.record_transfer(outcome)
    }

    /// Move funds into a correspondent bank's settlement account and queue
    /// them for the next batch.
    #[instrument(skip(self))]
    pub async fn route_to_bank(
        &self,
        from: AccountId,
        bank_id: BankId,
        amount: Decimal,
        idempotency_key: Option<String>,
    ) -> Result<PostedTransaction> {
        self.ensure_accepting()?;
        let outcome = self
            .settlement
            .route_to_bank(from, bank_id, amount, idempotency_key)
            .await;
        self.record_transfer(outcome)
    }

    fn record_transfer(
        &self,
        outcome: std::result::Result<PostedTransaction, LedgerError>,
    ) -> Result<PostedTransaction> {
        match outcome {
            Ok(posted) => {
                self.metrics.transfer_posted(posted.replayed);
                Ok(posted)
            }
            Err(e) => {
                let insufficient = matches!(e, LedgerError::InsufficientFunds { .. });
                self.metrics.transfer_rejected(insufficient);
                warn!(error = %e, code = e.error_code(), "Transfer rejected");
                Err(e.into())
            }
        }
    }

    /// Record a batch as paid out by the external rail.
    pub async fn complete_batch(
        &self,
        batch_id: &str,
        external_reference: &str,
    ) -> Result<SettlementBatch> {
        let batch = self
            .settlement
            .complete_batch(batch_id, external_reference)
            .await?;
        self.metrics.batch_completed();
        Ok(batch)
    }

    pub async fn fail_batch(&self, batch_id: &str, reason: &str) -> Result<SettlementBatch> {
        let batch = self.settlement.fail_batch(batch_id, reason).await?;
        self.metrics.batch_failed();
        Ok(batch)
    }

    /// Send a funds-transfer telex for a posted transaction to a registered
    /// institution.
    #[instrument(skip(self))]
    pub async fn notify_correspondent(
        &self,
        transaction_id: &TransactionId,
        swift_code: &str,
    ) -> Result<TelexMessage> {
        let institution = self.institutions.get(swift_code).await?;
        if !institution.is_active {
            return Err(LedgerError::Configuration(format!(
                "institution {} is inactive",
                institution.swift_code
            ))
            .into());
        }
        let tx = self.ledger.get_transaction(transaction_id).await?;

        match self
            .telex
            .funds_transfer_message(&tx, &institution.swift_code)
            .await
        {
            Ok(message) => {
                self.metrics.telex_delivered(true);
                Ok(message)
            }
            Err(e) => {
                self.metrics.telex_delivered(false);
                Err(e.into())
            }
        }
    }

    /// Accept an incoming telex. A funds transfer confirmation whose
    /// reference names a known transaction moves that transaction to the
    /// reported status and is marked processed; otherwise the message stays
    /// received for manual handling.
    #[instrument(skip(self, incoming), fields(message_id = ?incoming.message_id))]
    pub async fn receive_telex(&self, incoming: IncomingTelex) -> Result<TelexMessage> {
        let (message, reference, reported_status) = match self.telex.receive(incoming)? {
            ReceiveOutcome::Confirmation {
                message,
                reference,
                reported_status,
            } => (message, reference, reported_status),
            outcome => return Ok(outcome.message().clone()),
        };

        let bare = reference.strip_prefix("FT-").unwrap_or(reference.as_str());
        let Some(transaction_id) = TransactionId::parse(bare) else {
            warn!(reference = %reference, "Confirmation reference is not a transaction id");
            return Ok(message);
        };
        let tx = match self.ledger.get_transaction(&transaction_id).await {
            Ok(tx) => tx,
            Err(LedgerError::TransactionNotFound(_)) => {
                warn!(transaction_id = %transaction_id, "Confirmation for an unknown transaction");
                return Ok(message);
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(status) = reported_status {
            self.ledger.update_transaction_status(&tx.id, status).await?;
        }
        let processed = self.telex.mark_processed(&message.message_id, Some(tx.id))?;
        info!(
            transaction_id = ?processed.transaction_id,
            status = ?reported_status,
            "Applied funds transfer confirmation"
        );
        Ok(processed)
    }

    /// Send a pending ledger transaction to an EDI partner. The transaction
    /// moves to `Processing` once the partner's transport accepts the file and
    /// to `Failed` if it refuses.
    #[instrument(skip(self))]
    pub async fn send_edi(
        &self,
        transaction_id: &TransactionId,
        partner_id: &str,
    ) -> Result<EdiTransaction> {
        self.ensure_accepting()?;
        let tx = self.ledger.get_transaction(transaction_id).await?;
        if tx.status.is_final() {
            return Err(LedgerError::transition(tx.status, TransactionStatus::Processing).into());
        }
        let order = self.edi.from_ledger_transaction(&tx, partner_id)?;

        match self.edi.send(&order.transaction_id).await {
            Ok(sent) => {
                self.ledger
                    .update_transaction_status(&tx.id, TransactionStatus::Processing)
                    .await?;
                Ok(sent)
            }
            Err(e) => {
                self.ledger
                    .update_transaction_status(&tx.id, TransactionStatus::Failed)
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Apply a partner acknowledgment. Accepted orders complete their ledger
    /// transaction and rejected ones fail it.
    #[instrument(skip(self, content))]
    pub async fn receive_edi_acknowledgment(
        &self,
        partner_id: &str,
        content: &str,
    ) -> Result<AckReport> {
        let report = self.edi.process_acknowledgment(partner_id, content)?;
        for order in &report.updated {
            let Some(source) = &order.source_transaction else {
                continue;
            };
            let status = match order.status {
                EdiStatus::Rejected => TransactionStatus::Failed,
                _ => TransactionStatus::Completed,
            };
            self.ledger.update_transaction_status(source, status).await?;
        }
        Ok(report)
    }

    /// Record an incoming SWIFT payment as a pending transaction owned by
    /// `user_id`. Importing the same message twice returns the first record.
    #[instrument(skip(self, raw))]
    pub async fn import_swift(&self, raw: &str, user_id: UserId) -> Result<PostedTransaction> {
        let parsed = parse_message(raw)?;
        let tx = parsed.to_transaction(user_id)?;
        let posted = self.ledger.record_transaction(tx).await?;
        info!(
            transaction_id = %posted.transaction.id,
            reference = %parsed.reference,
            replayed = posted.replayed,
            "Imported SWIFT payment"
        );
        Ok(posted)
    }

    /// Load the built-in central bank directory. Safe to repeat.
    pub async fn seed_institutions(&self) -> Result<SeedReport> {
        Ok(self.institutions.seed(&central_banks()).await?)
    }

    /// Return the transactions whose debits and credits disagree.
    pub async fn verify_ledger(&self) -> Result<Vec<TransactionId>> {
        let unbalanced = self.ledger.verify_integrity().await?;
        if unbalanced.is_empty() {
            info!("Ledger integrity check passed");
        } else {
            warn!(count = unbalanced.len(), "Ledger has unbalanced transactions");
        }
        Ok(unbalanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use closedloop_common::{Counterparty, Currency, Money, Transaction, TransactionType};
    use closedloop_ledger::AccountType;
    use closedloop_protocol::{EdiFormat, EdiPartner, SwiftParseError, TelexStatus};
    use closedloop_settlement::{BatchStatus, NewCorrespondentBank};
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    fn test_config() -> NodeConfig {
        NodeConfig {
            sweep_interval: Duration::from_millis(10),
            ..NodeConfig::default()
        }
    }

    async fn running_node() -> Arc<Node> {
        running_node_with(test_config()).await
    }

    async fn running_node_with(config: NodeConfig) -> Arc<Node> {
        let node = Arc::new(Node::in_memory(config));
        node.start().await.unwrap();
        node
    }

    #[tokio::test]
    async fn test_start_stop() {
        let node = Arc::new(Node::in_memory(test_config()));
        assert_eq!(node.state(), NodeState::Starting);
        assert!(!node.is_accepting_requests());

        assert_ok!(node.start().await);
        assert_eq!(node.state(), NodeState::Running);
        assert_err!(node.start().await);

        assert_ok!(node.stop().await);
        assert_eq!(node.state(), NodeState::Stopped);
        // second stop is a no-op
        assert_ok!(node.stop().await);
    }

    #[tokio::test]
    async fn test_transfers_counted_in_metrics() {
        let node = running_node().await;
        let ledger = node.ledger();
        let alice = ledger
            .open_account(UserId::new(), AccountType::Individual, dec!(100))
            .await
            .unwrap();
        let bob = ledger
            .open_account(UserId::new(), AccountType::Individual, dec!(0))
            .await
            .unwrap();

        node.transfer(TransferRequest::new(alice.id, bob.id, dec!(40)).with_idempotency_key("t-1"))
            .await
            .unwrap();
        let replay = node
            .transfer(TransferRequest::new(alice.id, bob.id, dec!(40)).with_idempotency_key("t-1"))
            .await
            .unwrap();
        assert!(replay.replayed);

        let err = node
            .transfer(TransferRequest::new(alice.id, bob.id, dec!(500)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NodeError::Ledger(LedgerError::InsufficientFunds { .. })
        ));

        let snapshot = node.metrics().snapshot();
        assert_eq!(snapshot.transfers_total, 1);
        assert_eq!(snapshot.transfers_replayed, 1);
        assert_eq!(snapshot.transfers_rejected, 1);
        assert_eq!(snapshot.insufficient_funds, 1);
        assert_eq!(ledger.balance(bob.id).await.unwrap(), dec!(40));

        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_refused_when_not_running() {
        let node = Node::in_memory(test_config());
        let err = node
            .transfer(TransferRequest::new(AccountId::new(), AccountId::new(), dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::NotAccepting(NodeState::Starting)));
    }

    #[tokio::test]
    async fn test_sweep_and_batch_lifecycle() {
        // background sweeps must not race the manual ones
        let node = running_node_with(NodeConfig {
            sweep_interval: Duration::from_secs(3600),
            ..NodeConfig::default()
        })
        .await;
        let customer = node
            .ledger()
            .open_account(UserId::new(), AccountType::Business, dec!(1000))
            .await
            .unwrap();
        let bank = node
            .settlement()
            .register_bank(
                NewCorrespondentBank::new("Harbor Trust", "HRBT")
                    .with_routing_number("021000021")
                    .with_threshold(dec!(200)),
            )
            .await
            .unwrap();

        node.route_to_bank(customer.id, bank.id, dec!(150), None)
            .await
            .unwrap();
        assert!(node.run_sweep().await.unwrap().is_empty());

        node.route_to_bank(customer.id, bank.id, dec!(100), None)
            .await
            .unwrap();
        let batches = node.run_sweep().await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].total_amount, dec!(250));

        let batch_id = batches[0].batch_id.clone();
        node.settlement().start_batch(&batch_id).await.unwrap();
        let done = node.complete_batch(&batch_id, "ACH-000123").await.unwrap();
        assert_eq!(done.status, BatchStatus::Completed);

        let snapshot = node.metrics().snapshot();
        assert_eq!(snapshot.batches_created, 1);
        assert_eq!(snapshot.batches_completed, 1);
        assert!(snapshot.sweeps_run >= 2);

        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_background_sweep_runs() {
        let node = running_node().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        node.stop().await.unwrap();
        assert!(node.metrics().snapshot().sweeps_run > 0);
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let node = Node::in_memory(test_config());
        let first = node.seed_institutions().await.unwrap();
        assert!(first.created > 0);
        assert_eq!(first.skipped, 0);

        let second = node.seed_institutions().await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped, first.created);
        assert_eq!(node.institutions().len().await.unwrap(), first.created);
    }

    #[tokio::test]
    async fn test_nodes_sharing_stores_share_settlement_state() {
        let ledger_store = store::memory();
        let settlement = settlement_store::memory();
        let first = Node::new(test_config(), Arc::clone(&ledger_store), Arc::clone(&settlement));
        let seeded = first.seed_institutions().await.unwrap();
        let bank = first
            .settlement()
            .register_bank(NewCorrespondentBank::new("Harbor Trust", "HRBT"))
            .await
            .unwrap();

        let second = Node::new(test_config(), ledger_store, settlement);
        let report = second.seed_institutions().await.unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.skipped, seeded.created);
        assert_eq!(second.settlement().get_bank(bank.id).await.unwrap().bank_code, "HRBT");
    }

    #[tokio::test]
    async fn test_notify_correspondent_sends_simulated_telex() {
        let node = running_node().await;
        node.seed_institutions().await.unwrap();
        let account = node
            .ledger()
            .open_account(UserId::new(), AccountType::Business, dec!(75))
            .await
            .unwrap();
        let history = node.ledger().account_history(account.id, 10, 0).await.unwrap();
        let tx_id = history[0].transaction.id.clone();

        let message = node.notify_correspondent(&tx_id, "FRNYUS33").await.unwrap();
        assert_eq!(message.status, TelexStatus::Sent);
        assert!(message.simulated);
        assert_eq!(message.sender_reference, format!("FT-{}", tx_id));
        assert_eq!(node.metrics().snapshot().telex_sent, 1);

        assert_err!(node.notify_correspondent(&tx_id, "ZZZZUS33").await);
        node.stop().await.unwrap();
    }

    fn confirmation(message_id: &str, reference: &str, status: &str) -> IncomingTelex {
        IncomingTelex {
            message_id: Some(message_id.into()),
            sender_reference: Some(format!("REF-{}", message_id)),
            sender_bic: Some("DEUTDEFF".into()),
            message_type: Some("FTC".into()),
            content: Some(serde_json::json!({ "reference": reference, "status": status })),
            priority: None,
        }
    }

    const INCOMING_MT103: &str = "{1:F01DEUTDEFFAXXX0000000000}{2:I103NVCGUS33XXXXN}{4:\r\n\
:20:INV-7781\r\n\
:23B:CRED\r\n\
:32A:240115USD1250,00\r\n\
:50K:/DE89370400440532013000\r\nACME GMBH\r\n\
:59:/12345678\r\nJOHN SMITH\r\n\
:71A:SHA\r\n\
-}";

    #[tokio::test]
    async fn test_confirmation_completes_imported_payment() {
        let node = Node::in_memory(test_config());
        let owner = UserId::new();
        let posted = node.import_swift(INCOMING_MT103, owner).await.unwrap();
        assert!(!posted.replayed);
        assert_eq!(posted.transaction.status, TransactionStatus::Pending);
        let tx_id = posted.transaction.id.clone();

        let again = node.import_swift(INCOMING_MT103, owner).await.unwrap();
        assert!(again.replayed);
        assert_eq!(again.transaction.id, tx_id);

        let message = node
            .receive_telex(confirmation("KTT-1", &format!("FT-{}", tx_id), "COMPLETED"))
            .await
            .unwrap();
        assert_eq!(message.status, TelexStatus::Processed);
        assert_eq!(message.transaction_id.as_ref(), Some(&tx_id));
        assert_eq!(
            node.ledger().get_transaction(&tx_id).await.unwrap().status,
            TransactionStatus::Completed
        );
        assert_eq!(node.telex().messages_for_transaction(&tx_id).len(), 1);
    }

    #[tokio::test]
    async fn test_confirmation_for_unknown_transaction_stays_received() {
        let node = Node::in_memory(test_config());
        let unknown = TransactionId::generate();
        let message = node
            .receive_telex(confirmation("KTT-2", &format!("FT-{}", unknown), "FAILED"))
            .await
            .unwrap();
        assert_eq!(message.status, TelexStatus::Received);
        assert!(message.transaction_id.is_none());

        let garbled = node
            .receive_telex(confirmation("KTT-3", "not-a-reference", "COMPLETED"))
            .await
            .unwrap();
        assert_eq!(garbled.status, TelexStatus::Received);
    }

    async fn pending_edi_wire(node: &Node) -> TransactionId {
        let tx = Transaction::new(
            UserId::new(),
            Money::new(dec!(480), Currency::usd()),
            TransactionType::EdiWireTransfer,
            Some("Supplier invoice 88".into()),
        )
        .with_counterparty(Counterparty::at_institution("Globex", Some("778899".into()), None));
        node.ledger().record_transaction(tx).await.unwrap().transaction.id
    }

    #[tokio::test]
    async fn test_edi_send_and_acknowledgment_drive_ledger_status() {
        let node = running_node().await;
        node.edi().add_partner(
            EdiPartner::new("ACMEBANK", "Acme Bank", EdiFormat::X12)
                .with_account("021000021", "99887766"),
        );
        let tx_id = pending_edi_wire(&node).await;

        let order = node.send_edi(&tx_id, "ACMEBANK").await.unwrap();
        assert_eq!(order.status, EdiStatus::Sent);
        assert_eq!(order.source_transaction.as_ref(), Some(&tx_id));
        assert!(order.message.contains("*FWT*"));
        assert_eq!(
            node.ledger().get_transaction(&tx_id).await.unwrap().status,
            TransactionStatus::Processing
        );

        let ack = format!("ST*997*0001~AK2*820*{}~AK5*A~SE*4*0001~", order.control_reference());
        let report = node.receive_edi_acknowledgment("ACMEBANK", &ack).await.unwrap();
        assert_eq!(report.updated.len(), 1);
        assert_eq!(
            node.ledger().get_transaction(&tx_id).await.unwrap().status,
            TransactionStatus::Completed
        );

        // completed transactions are not sent again
        let err = node.send_edi(&tx_id, "ACMEBANK").await.unwrap_err();
        assert!(matches!(err, NodeError::Ledger(LedgerError::InvalidTransition { .. })));
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_edi_rejection_fails_transaction() {
        let node = running_node().await;
        node.edi()
            .add_partner(EdiPartner::new("EUROPAY", "Europay AG", EdiFormat::Edifact));
        let tx_id = pending_edi_wire(&node).await;
        let order = node.send_edi(&tx_id, "EUROPAY").await.unwrap();

        let contrl = format!(
            "UNH+1+CONTRL:D:3:UN'UCI+{}+EUROPAY+CLOSEDLOOP+4'UNT+3+1'",
            order.control_reference()
        );
        let report = node.receive_edi_acknowledgment("EUROPAY", &contrl).await.unwrap();
        assert!(!report.acknowledgment.is_success());
        assert_eq!(
            node.ledger().get_transaction(&tx_id).await.unwrap().status,
            TransactionStatus::Failed
        );
        assert!(matches!(
            node.send_edi(&tx_id, "NOBODY").await,
            Err(NodeError::Ledger(LedgerError::InvalidTransition { .. }))
        ));
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_import_rejects_non_payment_swift() {
        let node = Node::in_memory(test_config());
        let statement = INCOMING_MT103.replace("I103", "I940");
        let err = node.import_swift(&statement, UserId::new()).await.unwrap_err();
        assert!(matches!(err, NodeError::Swift(SwiftParseError::NotAPayment(_))));
    }

    #[tokio::test]
    async fn test_verify_ledger_clean() {
        let node = Node::in_memory(test_config());
        node.ledger()
            .open_account(UserId::new(), AccountType::Individual, dec!(10))
            .await
            .unwrap();
        assert!(node.verify_ledger().await.unwrap().is_empty());
    }
}
