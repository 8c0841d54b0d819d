//! Node services available to flows

use std::sync::Arc;

use crate::domain::contract::{ContractRegistry, LedgerTransaction};
use crate::domain::identity::{DigitalSignature, KeyPair, Party, PartyKey};
use crate::domain::repository::{IdentityRepository, TransactionRepository, VaultRepository};
use crate::domain::transaction::{SignedTransaction, WireTransaction};
use crate::CoreError;

/// Signs on behalf of the node
pub trait SigningService: Send + Sync {
    /// Key the node signs with
    fn public_key(&self) -> PartyKey;

    /// Sign arbitrary bytes
    fn sign(&self, content: &[u8]) -> Result<DigitalSignature, CoreError>;
}

impl SigningService for KeyPair {
    fn public_key(&self) -> PartyKey {
        KeyPair::public_key(self)
    }

    fn sign(&self, content: &[u8]) -> Result<DigitalSignature, CoreError> {
        Ok(KeyPair::sign(self, content))
    }
}

/// Everything a flow may use besides its sessions.
///
/// Passed explicitly to every flow step; cloning is cheap.
#[derive(Clone)]
pub struct ServiceHub {
    my_identity: Party,
    signer: Arc<dyn SigningService>,
    transactions: Arc<dyn TransactionRepository>,
    vault: Arc<dyn VaultRepository>,
    identities: Arc<dyn IdentityRepository>,
    contracts: Arc<ContractRegistry>,
}

impl ServiceHub {
    /// Create a new service hub
    pub fn new(
        my_identity: Party,
        signer: Arc<dyn SigningService>,
        transactions: Arc<dyn TransactionRepository>,
        vault: Arc<dyn VaultRepository>,
        identities: Arc<dyn IdentityRepository>,
        contracts: Arc<ContractRegistry>,
    ) -> Result<Self, CoreError> {
        if signer.public_key() != my_identity.owning_key {
            return Err(CoreError::ConfigurationError(format!(
                "Signing key does not belong to {}",
                my_identity
            )));
        }
        Ok(Self {
            my_identity,
            signer,
            transactions,
            vault,
            identities,
            contracts,
        })
    }

    /// This node's identity
    pub fn my_identity(&self) -> &Party {
        &self.my_identity
    }

    /// Validated transaction storage
    pub fn transactions(&self) -> &dyn TransactionRepository {
        self.transactions.as_ref()
    }

    /// The vault
    pub fn vault(&self) -> &dyn VaultRepository {
        self.vault.as_ref()
    }

    /// Identity lookup
    pub fn identities(&self) -> &dyn IdentityRepository {
        self.identities.as_ref()
    }

    /// Installed contracts
    pub fn contracts(&self) -> &ContractRegistry {
        &self.contracts
    }

    /// Sign bytes with the node's key
    pub fn sign(&self, content: &[u8]) -> Result<DigitalSignature, CoreError> {
        self.signer.sign(content)
    }

    /// Resolve a party from its key
    pub async fn party_from_key(&self, key: &PartyKey) -> Result<Option<Party>, CoreError> {
        if *key == self.my_identity.owning_key {
            return Ok(Some(self.my_identity.clone()));
        }
        self.identities.party_from_key(key).await
    }

    /// Resolve a transaction's inputs against local storage
    pub async fn resolve(&self, tx: &WireTransaction) -> Result<LedgerTransaction, CoreError> {
        LedgerTransaction::resolve(tx, self.transactions.as_ref()).await
    }

    /// Check signatures and ledger rules of a transaction
    pub async fn verify_transaction(
        &self,
        stx: &SignedTransaction,
        check_sufficient_signatures: bool,
    ) -> Result<(), CoreError> {
        if check_sufficient_signatures {
            stx.verify_required_signatures()?;
        } else {
            stx.verify_signatures()?;
        }
        let ltx = self.resolve(&stx.tx).await?;
        ltx.verify(&self.contracts)?;
        Ok(())
    }

    /// Store a validated transaction and update the vault.
    ///
    /// Returns `false` when the transaction was already recorded.
    pub async fn record_transaction(&self, stx: &SignedTransaction) -> Result<bool, CoreError> {
        let added = self.transactions.add(stx).await?;
        if added {
            self.vault.notify(stx).await?;
        }
        Ok(added)
    }
}

impl std::fmt::Debug for ServiceHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHub")
            .field("my_identity", &self.my_identity)
            .field("contracts", &self.contracts)
            .finish_non_exhaustive()
    }
}
