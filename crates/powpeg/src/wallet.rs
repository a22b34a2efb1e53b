use crate::activations::ForBlock;
use crate::federation::{Federation, FederationError};
use bitcoin::{OutPoint, Script, ScriptBuf};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UtxoProviderError {
    #[error("UTXO source unavailable: {0}")]
    Unavailable(String),
    #[error("UTXO snapshot holds more than {} satoshis", u64::MAX)]
    ValueOverflow,
}

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Unable to derive federation scripts: {0}")]
    Federation(#[from] FederationError),
    #[error("UTXO provider error: {0}")]
    Provider(#[from] UtxoProviderError),
    #[error("Wallet watches no federation")]
    NoFederation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_pubkey: ScriptBuf,
    pub confirmations: u32,
}

impl Utxo {
    /// Order in which coins are selected: larger values first, ties broken by outpoint.
    pub fn selection_order(&self, other: &Self) -> Ordering {
        other
            .value
            .cmp(&self.value)
            .then_with(|| self.outpoint.txid.cmp(&other.outpoint.txid))
            .then_with(|| self.outpoint.vout.cmp(&other.outpoint.vout))
    }
}

/// Sum of the values of `utxos`, `None` when it overflows.
pub fn total_value(utxos: &[Utxo]) -> Option<u64> {
    utxos
        .iter()
        .try_fold(0u64, |total, utxo| total.checked_add(utxo.value))
}

/// Snapshot source of the UTXOs the federations can spend.
pub trait UtxoProvider {
    fn utxos(&self) -> Result<Vec<Utxo>, UtxoProviderError>;
}

impl UtxoProvider for Vec<Utxo> {
    fn utxos(&self) -> Result<Vec<Utxo>, UtxoProviderError> {
        Ok(self.clone())
    }
}

impl UtxoProvider for [Utxo] {
    fn utxos(&self) -> Result<Vec<Utxo>, UtxoProviderError> {
        Ok(self.to_vec())
    }
}

impl<T: UtxoProvider + ?Sized> UtxoProvider for &T {
    fn utxos(&self) -> Result<Vec<Utxo>, UtxoProviderError> {
        (**self).utxos()
    }
}

#[derive(Debug, Clone)]
struct WatchedFederation<'a> {
    federation: &'a Federation,
    output_script: ScriptBuf,
    redeem_script: ScriptBuf,
}

/// View over the UTXOs paying to a set of federations, the first one being the spending one.
#[derive(Debug, Clone)]
pub struct FederationWallet<'a, P> {
    federations: Vec<WatchedFederation<'a>>,
    provider: P,
    activations: ForBlock,
}

impl<'a, P: UtxoProvider> FederationWallet<'a, P> {
    pub fn new(
        federations: &[&'a Federation],
        provider: P,
        activations: ForBlock,
    ) -> Result<Self, WalletError> {
        if federations.is_empty() {
            return Err(WalletError::NoFederation);
        }

        let federations = federations
            .iter()
            .map(|federation| {
                Ok(WatchedFederation {
                    federation: *federation,
                    output_script: federation.p2sh_script(&activations)?,
                    redeem_script: federation.redeem_script(&activations)?,
                })
            })
            .collect::<Result<Vec<_>, FederationError>>()?;

        Ok(Self {
            federations,
            provider,
            activations,
        })
    }

    /// Wallet of the active federation, plus the retiring one while a handover is ongoing.
    pub fn live(
        active: &'a Federation,
        retiring: Option<&'a Federation>,
        provider: P,
        activations: ForBlock,
    ) -> Result<Self, WalletError> {
        let mut federations = vec![active];
        federations.extend(retiring);
        Self::new(&federations, provider, activations)
    }

    pub fn activations(&self) -> &ForBlock {
        &self.activations
    }

    pub fn federations(&self) -> impl Iterator<Item = &'a Federation> + '_ {
        self.federations.iter().map(|watched| watched.federation)
    }

    pub fn is_watched(&self, script_pubkey: &Script) -> bool {
        self.federation_for_script(script_pubkey).is_some()
    }

    pub fn federation_for_script(&self, script_pubkey: &Script) -> Option<&'a Federation> {
        self.federations
            .iter()
            .find(|watched| watched.output_script.as_script() == script_pubkey)
            .map(|watched| watched.federation)
    }

    pub fn federation_for_redeem_script(&self, redeem_script: &Script) -> Option<&'a Federation> {
        self.federations
            .iter()
            .find(|watched| watched.redeem_script.as_script() == redeem_script)
            .map(|watched| watched.federation)
    }

    /// Watched UTXOs in selection order. Their total always fits in a `u64`.
    pub fn spendable(&self) -> Result<Vec<Utxo>, UtxoProviderError> {
        let mut utxos = self
            .provider
            .utxos()?
            .into_iter()
            .filter(|utxo| utxo.value > 0 && self.is_watched(&utxo.script_pubkey))
            .collect::<Vec<_>>();
        if total_value(&utxos).is_none() {
            return Err(UtxoProviderError::ValueOverflow);
        }
        utxos.sort_by(Utxo::selection_order);
        debug!("Wallet holds {} spendable UTXOs", utxos.len());
        Ok(utxos)
    }

    pub fn balance(&self) -> Result<u64, UtxoProviderError> {
        total_value(&self.spendable()?).ok_or(UtxoProviderError::ValueOverflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{p2sh_erp_federation, standard_federation, utxo, FailingProvider};
    use bitcoin::Network;

    #[test]
    fn test_spendable_filters_and_sorts() {
        let federation = standard_federation(5, Network::Regtest);
        let activations = ForBlock::all_active(0);
        let script = federation.p2sh_script(&activations).unwrap();
        let foreign = ScriptBuf::new_p2sh(&ScriptBuf::new().script_hash());

        let utxos = vec![
            utxo(3, 0, 10_000, &script),
            utxo(1, 1, 50_000, &script),
            utxo(2, 0, 99_000, &foreign),
            utxo(1, 0, 50_000, &script),
            utxo(0, 0, 10_000, &script),
            utxo(4, 0, 0, &script),
        ];
        let wallet = FederationWallet::new(&[&federation], utxos, activations).unwrap();

        let spendable = wallet.spendable().unwrap();
        let order = spendable
            .iter()
            .map(|utxo| (utxo.value, utxo.outpoint.vout))
            .collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![(50_000, 0), (50_000, 1), (10_000, 0), (10_000, 0)]
        );
        assert_eq!(spendable[2].outpoint.txid, utxo(0, 0, 1, &script).outpoint.txid);
        assert_eq!(wallet.balance().unwrap(), 120_000);
    }

    #[test]
    fn test_live_wallet_watches_retiring_federation() {
        let active = p2sh_erp_federation(7, Network::Regtest);
        let retiring = standard_federation(5, Network::Regtest);
        let activations = ForBlock::all_active(0);
        let active_script = active.p2sh_script(&activations).unwrap();
        let retiring_script = retiring.p2sh_script(&activations).unwrap();

        let wallet = FederationWallet::live(
            &active,
            Some(&retiring),
            vec![utxo(1, 0, 1_000, &retiring_script)],
            activations.clone(),
        )
        .unwrap();

        assert_eq!(wallet.federation_for_script(&active_script), Some(&active));
        assert_eq!(wallet.federation_for_script(&retiring_script), Some(&retiring));
        assert_eq!(
            wallet.federation_for_redeem_script(&retiring.redeem_script(&activations).unwrap()),
            Some(&retiring)
        );
        assert_eq!(wallet.federations().count(), 2);
        assert_eq!(wallet.balance().unwrap(), 1_000);

        let active_only =
            FederationWallet::live(&active, None, Vec::<Utxo>::new(), activations).unwrap();
        assert!(!active_only.is_watched(&retiring_script));
    }

    #[test]
    fn test_provider_failure_is_reported() {
        let federation = standard_federation(3, Network::Regtest);
        let wallet =
            FederationWallet::new(&[&federation], FailingProvider, ForBlock::all_active(0))
                .unwrap();
        assert!(matches!(
            wallet.spendable(),
            Err(UtxoProviderError::Unavailable(_))
        ));
    }

    #[test]
    fn test_overflowing_snapshot_is_rejected() {
        let federation = standard_federation(3, Network::Regtest);
        let activations = ForBlock::all_active(0);
        let script = federation.p2sh_script(&activations).unwrap();
        let foreign = ScriptBuf::new_p2sh(&ScriptBuf::new().script_hash());

        let utxos = vec![utxo(1, 0, u64::MAX, &script), utxo(2, 0, 1, &script)];
        let wallet = FederationWallet::new(&[&federation], utxos, activations.clone()).unwrap();
        assert_eq!(wallet.spendable(), Err(UtxoProviderError::ValueOverflow));
        assert_eq!(wallet.balance(), Err(UtxoProviderError::ValueOverflow));

        // unwatched outputs do not count
        let utxos = vec![utxo(1, 0, u64::MAX, &script), utxo(2, 0, 1, &foreign)];
        let wallet = FederationWallet::new(&[&federation], utxos, activations).unwrap();
        assert_eq!(wallet.balance(), Ok(u64::MAX));
    }

    #[test]
    fn test_wallet_needs_a_federation() {
        let result = FederationWallet::new(&[], Vec::<Utxo>::new(), ForBlock::all_active(0));
        assert!(matches!(result, Err(WalletError::NoFederation)));
    }

    #[test]
    fn test_utxo_serde_roundtrip() {
        let script = ScriptBuf::new_p2sh(&ScriptBuf::new().script_hash());
        let original = utxo(7, 3, 12_345, &script);
        let json = serde_json::to_string(&original).unwrap();
        assert_eq!(serde_json::from_str::<Utxo>(&json).unwrap(), original);
    }
}
