//! Construction of unsigned release and migration transactions.
//!
//! Every node runs the same builds over the same UTXO snapshot, so the result must only
//! depend on the inputs: coins are selected greedily in [`Utxo::selection_order`] and fee
//! remainders always land on the first user output.

use crate::activations::{ConsensusRule, ForBlock};
use crate::config::BridgeConstants;
use crate::federation::Federation;
use crate::metrics::RELEASE_BUILDS;
use crate::pegout_size::{estimate_pegout_fee, signed_size};
use crate::signatures::{PegoutId, PendingSignatureTx};
use crate::spending::MultisigSpend;
use crate::wallet::{total_value, FederationWallet, Utxo, UtxoProvider};
use crate::Error;
use bitcoin::absolute::LockTime;
use bitcoin::{Address, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Success,
    /// Not enough funds even before paying the fee.
    InsufficientMoney,
    /// An output cannot absorb its share of the fee and stay above dust.
    CouldNotAdjustDownwards,
    DustySendRequested,
    ExceedMaxTransactionSize,
    UtxoProviderException,
}

impl ResponseCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseCode::Success => "success",
            ResponseCode::InsufficientMoney => "insufficient_money",
            ResponseCode::CouldNotAdjustDownwards => "could_not_adjust_downwards",
            ResponseCode::DustySendRequested => "dusty_send_requested",
            ResponseCode::ExceedMaxTransactionSize => "exceed_max_transaction_size",
            ResponseCode::UtxoProviderException => "utxo_provider_exception",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub response_code: ResponseCode,
    pub transaction: Option<Transaction>,
    /// Spent UTXOs, in input order.
    pub selected_utxos: Vec<Utxo>,
}

impl BuildResult {
    fn failure(response_code: ResponseCode) -> Self {
        Self {
            response_code,
            transaction: None,
            selected_utxos: vec![],
        }
    }

    fn success(transaction: Transaction, selected_utxos: Vec<Utxo>) -> Self {
        Self {
            response_code: ResponseCode::Success,
            transaction: Some(transaction),
            selected_utxos,
        }
    }

    pub fn is_success(&self) -> bool {
        self.response_code == ResponseCode::Success
    }

    /// Fee paid by the built transaction.
    pub fn fee(&self) -> Option<u64> {
        let transaction = self.transaction.as_ref()?;
        let spent = total_value(&self.selected_utxos)?;
        let paid = transaction
            .output
            .iter()
            .try_fold(0u64, |total, output| total.checked_add(output.value))?;
        spent.checked_sub(paid)
    }

    /// Entry to store while federators sign the built transaction.
    pub fn pending_signature_tx(&self) -> Option<PendingSignatureTx> {
        let transaction = self.transaction.clone()?;
        let prevout_values = self.selected_utxos.iter().map(|utxo| utxo.value).collect();
        Some(PendingSignatureTx::new(transaction, prevout_values))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRequest {
    pub destination: Address,
    pub amount: u64,
    pub source: Option<PegoutId>,
}

impl ReleaseRequest {
    pub fn new(destination: Address, amount: u64) -> Self {
        Self {
            destination,
            amount,
            source: None,
        }
    }

    pub fn with_source(mut self, source: PegoutId) -> Self {
        self.source = Some(source);
        self
    }
}

/// Builds the Bitcoin transactions paying out of a federation wallet.
#[derive(Debug, Clone)]
pub struct ReleaseTransactionBuilder<'a, P> {
    wallet: FederationWallet<'a, P>,
    change_federation: &'a Federation,
    fee_per_kb: u64,
    min_nondust_output: u64,
    max_transaction_size: usize,
    activations: ForBlock,
}

impl<'a, P: UtxoProvider> ReleaseTransactionBuilder<'a, P> {
    /// Fees are charged at `constants.fee_per_kb`.
    pub fn new(
        constants: &BridgeConstants,
        wallet: FederationWallet<'a, P>,
        change_federation: &'a Federation,
        activations: ForBlock,
    ) -> Self {
        Self {
            wallet,
            change_federation,
            fee_per_kb: constants.fee_per_kb,
            min_nondust_output: constants.min_nondust_output,
            max_transaction_size: constants.max_transaction_size,
            activations,
        }
    }

    pub fn wallet(&self) -> &FederationWallet<'a, P> {
        &self.wallet
    }

    /// Pays `amount` to `destination`. The fee comes out of the paid output and the change
    /// returns the whole difference to the federation.
    pub fn build_amount_to(
        &self,
        destination: &Address,
        amount: u64,
    ) -> Result<BuildResult, Error> {
        let result = self.build_pegouts(&[(destination.script_pubkey(), amount)])?;
        Ok(self.record("amount_to", result))
    }

    /// One output per request plus the change. The fee is split evenly between the request
    /// outputs and the remainder is charged to the first one.
    pub fn build_batched_pegouts(
        &self,
        requests: &[ReleaseRequest],
    ) -> Result<BuildResult, Error> {
        if requests.is_empty() {
            return Err(Error::IllegalState(
                "Cannot build a batched pegout without requests".to_string(),
            ));
        }
        let outputs = requests
            .iter()
            .map(|request| (request.destination.script_pubkey(), request.amount))
            .collect::<Vec<_>>();
        let result = self.build_pegouts(&outputs)?;
        Ok(self.record("batched_pegouts", result))
    }

    /// Sweeps the whole wallet into a single output to `destination`, which pays the fee.
    pub fn build_empty_wallet_to(&self, destination: &Address) -> Result<BuildResult, Error> {
        let result = self.build_sweep(destination, None, self.tx_version())?;
        Ok(self.record("empty_wallet", result))
    }

    /// Moves at least `value` out of the wallet to `destination` in a single output that takes
    /// everything selected, fee included.
    pub fn build_migration_transaction(
        &self,
        value: u64,
        destination: &Address,
    ) -> Result<BuildResult, Error> {
        let result = if value < self.min_nondust_output {
            BuildResult::failure(ResponseCode::DustySendRequested)
        } else {
            self.build_sweep(destination, Some(value), self.migration_tx_version())?
        };
        Ok(self.record("migration", result))
    }

    fn tx_version(&self) -> i32 {
        if self.activations.is_active(ConsensusRule::BtcTxVersion2) {
            2
        } else {
            1
        }
    }

    fn migration_tx_version(&self) -> i32 {
        if self.activations.is_active(ConsensusRule::MigrationTxVersion2) {
            self.tx_version()
        } else {
            1
        }
    }

    fn spendable(&self) -> Option<Vec<Utxo>> {
        match self.wallet.spendable() {
            Ok(utxos) => Some(utxos),
            Err(e) => {
                warn!("Unable to fetch federation UTXOs: {e}");
                None
            }
        }
    }

    fn build_pegouts(&self, requests: &[(ScriptBuf, u64)]) -> Result<BuildResult, Error> {
        if requests
            .iter()
            .any(|(_, amount)| *amount < self.min_nondust_output)
        {
            return Ok(BuildResult::failure(ResponseCode::DustySendRequested));
        }

        let Some(utxos) = self.spendable() else {
            return Ok(BuildResult::failure(ResponseCode::UtxoProviderException));
        };

        let Some(requested) = requests
            .iter()
            .try_fold(0u64, |total, (_, amount)| total.checked_add(*amount))
        else {
            debug!("Requested amounts overflow a u64");
            return Ok(BuildResult::failure(ResponseCode::InsufficientMoney));
        };
        let Some((selected, selected_value)) = select_coins(&utxos, requested) else {
            debug!("Cannot cover {requested} satoshis with the federation wallet");
            return Ok(BuildResult::failure(ResponseCode::InsufficientMoney));
        };

        let mut outputs = requests
            .iter()
            .map(|(script_pubkey, amount)| TxOut {
                value: *amount,
                script_pubkey: script_pubkey.clone(),
            })
            .collect::<Vec<_>>();
        if selected_value > requested {
            let change_script = self
                .change_federation
                .p2sh_script(&self.activations)
                .map_err(Error::from)?;
            outputs.push(TxOut {
                value: selected_value - requested,
                script_pubkey: change_script,
            });
        }

        let (mut tx, size) = self.assemble(self.tx_version(), &selected, outputs)?;
        if size > self.max_transaction_size {
            return Ok(BuildResult::failure(ResponseCode::ExceedMaxTransactionSize));
        }

        let Some(fee) = estimate_pegout_fee(self.fee_per_kb, size) else {
            return Ok(BuildResult::failure(ResponseCode::CouldNotAdjustDownwards));
        };
        if !self.charge_fee(&mut tx.output[..requests.len()], fee) {
            return Ok(BuildResult::failure(ResponseCode::CouldNotAdjustDownwards));
        }

        debug!(
            "Built release of {} inputs and {} outputs, {size} bytes signed, fee {fee}",
            tx.input.len(),
            tx.output.len()
        );
        Ok(BuildResult::success(tx, selected))
    }

    fn build_sweep(
        &self,
        destination: &Address,
        value: Option<u64>,
        version: i32,
    ) -> Result<BuildResult, Error> {
        let Some(utxos) = self.spendable() else {
            return Ok(BuildResult::failure(ResponseCode::UtxoProviderException));
        };
        if utxos.is_empty() {
            // an empty migration would move nothing, which is dust
            let code = match value {
                Some(_) => ResponseCode::DustySendRequested,
                None => ResponseCode::InsufficientMoney,
            };
            return Ok(BuildResult::failure(code));
        }

        let selection = match value {
            None => total_value(&utxos).map(|total| (utxos, total)),
            Some(value) => select_coins(&utxos, value),
        };
        let Some((selected, selected_value)) = selection else {
            return Ok(BuildResult::failure(ResponseCode::InsufficientMoney));
        };

        let output = TxOut {
            value: selected_value,
            script_pubkey: destination.script_pubkey(),
        };
        let (mut tx, size) = self.assemble(version, &selected, vec![output])?;
        if size > self.max_transaction_size {
            return Ok(BuildResult::failure(ResponseCode::ExceedMaxTransactionSize));
        }

        let Some(fee) = estimate_pegout_fee(self.fee_per_kb, size) else {
            return Ok(BuildResult::failure(ResponseCode::CouldNotAdjustDownwards));
        };
        if !self.charge_fee(&mut tx.output, fee) {
            return Ok(BuildResult::failure(ResponseCode::CouldNotAdjustDownwards));
        }

        debug!(
            "Built sweep of {} inputs, {selected_value} satoshis, fee {fee}",
            tx.input.len()
        );
        Ok(BuildResult::success(tx, selected))
    }

    /// Unsigned transaction spending `selected` and its size once signed.
    fn assemble(
        &self,
        version: i32,
        selected: &[Utxo],
        output: Vec<TxOut>,
    ) -> Result<(Transaction, usize), Error> {
        let spends = selected
            .iter()
            .map(|utxo| {
                let federation = self
                    .wallet
                    .federation_for_script(&utxo.script_pubkey)
                    .ok_or_else(|| {
                        Error::IllegalState(format!(
                            "UTXO {} is not owned by a watched federation",
                            utxo.outpoint
                        ))
                    })?;
                MultisigSpend::unsigned(federation, &self.activations)
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let input = selected
            .iter()
            .zip(&spends)
            .map(|(utxo, spend)| {
                let mut input = TxIn {
                    previous_output: utxo.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::default(),
                };
                spend.apply(&mut input)?;
                Ok(input)
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let tx = Transaction {
            version,
            lock_time: LockTime::ZERO,
            input,
            output,
        };
        let size = signed_size(&tx, &spends)?;
        Ok((tx, size))
    }

    /// Takes `fee` out of `outputs`, evenly, with the remainder on the first output. Leaves
    /// `outputs` untouched and returns false when an output would end up as dust.
    fn charge_fee(&self, outputs: &mut [TxOut], fee: u64) -> bool {
        let count = outputs.len() as u64;
        if count == 0 {
            return false;
        }
        let share = fee / count;
        let remainder = fee % count;

        let charged = outputs
            .iter()
            .enumerate()
            .map(|(index, output)| {
                let charge = if index == 0 { share + remainder } else { share };
                output
                    .value
                    .checked_sub(charge)
                    .filter(|value| *value >= self.min_nondust_output)
            })
            .collect::<Option<Vec<_>>>();

        match charged {
            Some(values) => {
                for (output, value) in outputs.iter_mut().zip(values) {
                    output.value = value;
                }
                true
            }
            None => {
                debug!("Outputs cannot absorb a fee of {fee} satoshis");
                false
            }
        }
    }

    fn record(&self, kind: &str, result: BuildResult) -> BuildResult {
        RELEASE_BUILDS
            .with_label_values(&[kind, result.response_code.as_str()])
            .inc();
        if result.is_success() {
            info!(
                "Release build {kind} succeeded with {} UTXOs",
                result.selected_utxos.len()
            );
        } else {
            info!("Release build {kind} failed: {:?}", result.response_code);
        }
        result
    }
}

/// Shortest prefix of `utxos` worth at least `target`, along with its value.
fn select_coins(utxos: &[Utxo], target: u64) -> Option<(Vec<Utxo>, u64)> {
    let mut total = 0u64;
    let mut selected = vec![];
    for utxo in utxos {
        if total >= target {
            break;
        }
        total = total.checked_add(utxo.value)?;
        selected.push(utxo.clone());
    }
    (total >= target).then_some((selected, total))
}
