//! Wallet session: signing key, cached account sequence and the broadcaster
//! bound to that sequence.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    chain::{messages::subaccount_id, AccountInfo, AccountSource, TxBroadcaster},
    config::{Settings, WalletConfig},
    errors::Result,
    pause::Pause,
    signer::{SignRequest, SigningKey, TxSigner},
    types::{AccountNumber, Sequence},
};

/// Remote collaborators a session talks to.
#[derive(Clone)]
pub struct SessionDeps {
    pub accounts: Arc<dyn AccountSource>,
    pub transport: Arc<dyn TxBroadcaster>,
    pub signer: Arc<dyn TxSigner>,
    pub pause: Arc<dyn Pause>,
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub chain_id: String,
    pub gas_limit: u64,
    pub fee_denom: String,
    pub refresh_throttle: Duration,
    pub settle_delay: Duration,
}

impl SessionOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            chain_id: settings.endpoints.testnet_chain_id.clone(),
            gas_limit: settings.endpoints.gas_limit,
            fee_denom: settings.endpoints.fee_denom.clone(),
            refresh_throttle: settings.retry.refresh_throttle(),
            settle_delay: settings.retry.settle_delay(),
        }
    }
}

/// Signs and broadcasts under a fixed sequence. Rebuilt whenever the sequence
/// drifts from what the ledger expects.
pub struct Broadcaster {
    signer: Arc<dyn TxSigner>,
    transport: Arc<dyn TxBroadcaster>,
    key: SigningKey,
    chain_id: String,
    fee_denom: String,
    gas_limit: u64,
    gas_price: f64,
    account_number: AccountNumber,
    sequence: Sequence,
    generation: u64,
}

impl Broadcaster {
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn gas_price(&self) -> f64 {
        self.gas_price
    }

    /// Number of times the broadcaster has been rebuilt for this session.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Signs `messages` at the bound sequence and broadcasts the result.
    pub async fn send(&self, messages: &Value) -> Result<Value> {
        let request = SignRequest {
            chain_id: &self.chain_id,
            account_number: self.account_number,
            sequence: self.sequence,
            gas_price: self.gas_price,
            gas_limit: self.gas_limit,
            fee_denom: &self.fee_denom,
            messages,
        };
        let tx_bytes = self.signer.sign(&self.key, &request)?;
        self.transport.broadcast(&tx_bytes).await
    }
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("chain_id", &self.chain_id)
            .field("account_number", &self.account_number)
            .field("sequence", &self.sequence)
            .field("gas_price", &self.gas_price)
            .field("generation", &self.generation)
            .finish()
    }
}

pub struct WalletSession {
    wallet_id: String,
    name: String,
    key: SigningKey,
    address: String,
    eth_address: String,
    subaccount_id: String,
    account_number: AccountNumber,
    sequence: Sequence,
    broadcaster: Broadcaster,
    deps: SessionDeps,
    options: SessionOptions,
    last_refresh: Option<Instant>,
    refresh_count: u64,
    recreate_count: u64,
}

impl WalletSession {
    /// Derives the address and fetches account state. Fails if the account
    /// cannot be fetched; there is no local fallback.
    pub async fn initialize(
        wallet: &WalletConfig,
        deps: SessionDeps,
        options: SessionOptions,
    ) -> Result<Self> {
        let key = SigningKey::new(&wallet.private_key);
        let address = deps.signer.derive_address(&key)?;
        let eth_address = key.eth_address()?;
        let subaccount_id = subaccount_id(&eth_address, 0);

        let account = deps.accounts.fetch_account(&address).await?;
        let gas_price = deps.accounts.gas_price().await?;
        info!(
            wallet = %wallet.name,
            %address,
            sequence = %account.sequence,
            account_number = account.account_number.into_inner(),
            "wallet session initialized"
        );

        let broadcaster = Broadcaster {
            signer: deps.signer.clone(),
            transport: deps.transport.clone(),
            key: key.clone(),
            chain_id: options.chain_id.clone(),
            fee_denom: options.fee_denom.clone(),
            gas_limit: options.gas_limit,
            gas_price,
            account_number: account.account_number,
            sequence: account.sequence,
            generation: 0,
        };

        Ok(Self {
            wallet_id: wallet.id.clone(),
            name: wallet.name.clone(),
            key,
            address,
            eth_address,
            subaccount_id,
            account_number: account.account_number,
            sequence: account.sequence,
            broadcaster,
            deps,
            options,
            last_refresh: None,
            refresh_count: 0,
            recreate_count: 0,
        })
    }

    pub fn wallet_id(&self) -> &str {
        &self.wallet_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn eth_address(&self) -> &str {
        &self.eth_address
    }

    pub fn subaccount_id(&self) -> &str {
        &self.subaccount_id
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn account_number(&self) -> AccountNumber {
        self.account_number
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn refresh_count(&self) -> u64 {
        self.refresh_count
    }

    pub fn recreate_count(&self) -> u64 {
        self.recreate_count
    }

    pub fn pause(&self) -> &Arc<dyn Pause> {
        &self.deps.pause
    }

    /// Re-fetches the sequence. Without `force`, a call inside the throttle
    /// window of the previous refresh is a no-op. Returns whether a remote
    /// fetch happened.
    pub async fn refresh(&mut self, force: bool) -> Result<bool> {
        if !force {
            if let Some(last) = self.last_refresh {
                if last.elapsed() < self.options.refresh_throttle {
                    debug!(wallet = %self.name, "refresh throttled");
                    return Ok(false);
                }
            }
        }

        let account = self.fetch_account().await?;
        self.apply_account(account);
        self.deps.pause.pause(self.options.settle_delay).await;
        Ok(true)
    }

    /// Increments the local sequence after a successful broadcast.
    pub fn advance(&mut self) {
        self.sequence = self.sequence.next();
        self.broadcaster.sequence = self.sequence;
    }

    /// Full recovery: re-fetch sequence and gas price and rebuild the
    /// broadcaster bound to the new sequence.
    pub async fn recreate_broadcaster(&mut self) -> Result<()> {
        let account = self.fetch_account().await?;
        self.apply_account(account);
        let gas_price = match self.deps.accounts.gas_price().await {
            Ok(price) => price,
            Err(err) => {
                warn!(wallet = %self.name, "gas price refresh failed, keeping previous: {err}");
                self.broadcaster.gas_price
            }
        };

        self.broadcaster = Broadcaster {
            signer: self.deps.signer.clone(),
            transport: self.deps.transport.clone(),
            key: self.key.clone(),
            chain_id: self.options.chain_id.clone(),
            fee_denom: self.options.fee_denom.clone(),
            gas_limit: self.options.gas_limit,
            gas_price,
            account_number: self.account_number,
            sequence: self.sequence,
            generation: self.broadcaster.generation + 1,
        };
        self.recreate_count += 1;
        info!(
            wallet = %self.name,
            sequence = %self.sequence,
            generation = self.broadcaster.generation,
            "broadcaster recreated"
        );

        self.deps.pause.pause(self.options.settle_delay).await;
        Ok(())
    }

    async fn fetch_account(&mut self) -> Result<AccountInfo> {
        let account = self.deps.accounts.fetch_account(&self.address).await?;
        self.last_refresh = Some(Instant::now());
        self.refresh_count += 1;
        Ok(account)
    }

    fn apply_account(&mut self, account: AccountInfo) {
        if account.sequence != self.sequence {
            debug!(
                wallet = %self.name,
                local = %self.sequence,
                remote = %account.sequence,
                "sequence re-synced"
            );
        }
        self.sequence = account.sequence;
        self.account_number = account.account_number;
        self.broadcaster.sequence = account.sequence;
    }
}

impl fmt::Debug for WalletSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletSession")
            .field("wallet_id", &self.wallet_id)
            .field("address", &self.address)
            .field("sequence", &self.sequence)
            .field("broadcaster", &self.broadcaster)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        pause::RecordingPause,
        testing::{EchoSigner, ScriptedBroadcaster, StaticAccounts, TEST_PRIVATE_KEY},
    };

    fn options(throttle_ms: u64) -> SessionOptions {
        SessionOptions {
            chain_id: "injective-888".into(),
            gas_limit: 2_000_000,
            fee_denom: "inj".into(),
            refresh_throttle: Duration::from_millis(throttle_ms),
            settle_delay: Duration::from_millis(1000),
        }
    }

    fn wallet() -> WalletConfig {
        WalletConfig {
            id: "1".into(),
            name: "wallet_1".into(),
            private_key: TEST_PRIVATE_KEY.into(),
            enabled: true,
        }
    }

    async fn session(accounts: Arc<StaticAccounts>, throttle_ms: u64) -> (WalletSession, Arc<RecordingPause>) {
        let pause = Arc::new(RecordingPause::new());
        let deps = SessionDeps {
            accounts,
            transport: Arc::new(ScriptedBroadcaster::new()),
            signer: Arc::new(EchoSigner::new()),
            pause: pause.clone(),
        };
        let session = WalletSession::initialize(&wallet(), deps, options(throttle_ms))
            .await
            .unwrap();
        (session, pause)
    }

    #[tokio::test]
    async fn test_initialize_fetches_account() {
        let accounts = Arc::new(StaticAccounts::new(10, 77));
        let (session, _) = session(accounts.clone(), 2000).await;
        assert_eq!(session.sequence(), Sequence::new(10));
        assert_eq!(session.account_number(), AccountNumber::new(77));
        assert!(session.subaccount_id().ends_with(&"0".repeat(24)));
        assert_eq!(accounts.fetches(), 1);
    }

    #[tokio::test]
    async fn test_initialize_fails_without_account() {
        let accounts = Arc::new(StaticAccounts::new(0, 1));
        accounts.set_failing(true);
        let deps = SessionDeps {
            accounts,
            transport: Arc::new(ScriptedBroadcaster::new()),
            signer: Arc::new(EchoSigner::new()),
            pause: Arc::new(RecordingPause::new()),
        };
        assert!(WalletSession::initialize(&wallet(), deps, options(2000))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_refresh_is_throttled() {
        let accounts = Arc::new(StaticAccounts::new(5, 1));
        let (mut session, pause) = session(accounts.clone(), 2000).await;
        let before = accounts.fetches();

        assert!(session.refresh(false).await.unwrap());
        assert!(!session.refresh(false).await.unwrap());
        assert_eq!(accounts.fetches() - before, 1);
        assert_eq!(session.refresh_count(), 1);
        assert_eq!(pause.delays(), vec![Duration::from_millis(1000)]);

        assert!(session.refresh(true).await.unwrap());
        assert_eq!(accounts.fetches() - before, 2);
    }

    #[tokio::test]
    async fn test_refresh_resyncs_sequence() {
        let accounts = Arc::new(StaticAccounts::new(5, 1));
        let (mut session, _) = session(accounts.clone(), 0).await;
        session.advance();
        session.advance();
        assert_eq!(session.sequence(), Sequence::new(7));

        accounts.set_sequence(6);
        session.refresh(false).await.unwrap();
        assert_eq!(session.sequence(), Sequence::new(6));
        assert_eq!(session.broadcaster().sequence(), Sequence::new(6));
    }

    #[tokio::test]
    async fn test_recreate_broadcaster_rebinds() {
        let accounts = Arc::new(StaticAccounts::new(3, 1));
        let (mut session, _) = session(accounts.clone(), 2000).await;
        accounts.set_sequence(9);
        accounts.set_gas_price(500_000_000.0);

        session.recreate_broadcaster().await.unwrap();
        assert_eq!(session.broadcaster().generation(), 1);
        assert_eq!(session.broadcaster().sequence(), Sequence::new(9));
        assert_eq!(session.broadcaster().gas_price(), 500_000_000.0);
        assert_eq!(session.recreate_count(), 1);
    }
}
