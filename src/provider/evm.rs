use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;

use alloy::{
    consensus::Transaction as _,
    eips::BlockNumberOrTag,
    network::{EthereumWallet, TransactionBuilder},
    primitives::{Address, Bytes, B256, U256},
    providers::{Provider, ProviderBuilder},
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
    sol,
};

use crate::{configuration::Config, error::Error};

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract IErc20 {
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}

#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct TxInfo {
    pub hash: String,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub chain_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ReceiptInfo {
    pub status: bool,
    pub block_number: Option<u64>,
    pub transaction_hash: String,
}

#[derive(Debug, Clone)]
pub struct TxRequest {
    pub to: Address,
    pub value: U256,
    pub data: Option<Bytes>,
}

/// Chain capability consumed by the treasury reader, the deposit
/// webhook and both executors. All signing happens behind this seam.
#[async_trait]
pub trait EvmClient: Send + Sync {
    fn vault_address(&self) -> Address;
    fn chain_id(&self) -> u64;

    async fn get_native_balance(&self, address: Address)
        -> Result<U256, Error>;
    async fn get_code_len(&self, address: Address) -> Result<usize, Error>;
    async fn erc20_balance_of(
        &self,
        token: Address,
        owner: Address,
    ) -> Result<U256, Error>;
    async fn erc20_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, Error>;
    async fn erc20_approve(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> Result<ReceiptInfo, Error>;
    async fn erc20_transfer(
        &self,
        token: Address,
        to: Address,
        amount: U256,
    ) -> Result<ReceiptInfo, Error>;
    async fn send_transaction(
        &self,
        request: TxRequest,
    ) -> Result<ReceiptInfo, Error>;

    async fn latest_block(&self) -> Result<BlockInfo, Error>;
    async fn finalized_block(&self) -> Result<Option<BlockInfo>, Error>;
    async fn block_number(&self) -> Result<u64, Error>;
    async fn get_transaction(
        &self,
        hash: &str,
    ) -> Result<Option<TxInfo>, Error>;
    async fn get_transaction_receipt(
        &self,
        hash: &str,
    ) -> Result<Option<ReceiptInfo>, Error>;
}

fn evm_err(error: impl std::fmt::Display) -> Error {
    Error::Evm(error.to_string())
}

fn parse_hash(hash: &str) -> Result<B256, Error> {
    B256::from_str(hash.trim())
        .map_err(|_| Error::Evm(format!("invalid transaction hash {hash}")))
}

pub struct AlloyEvm<P> {
    provider: P,
    vault: Address,
    chain_id: u64,
}

/// Build the chain client from configuration. With a vault key the
/// provider carries a wallet and can submit; without one only reads
/// work, which is all the dry-run modes need.
pub fn connect(config: &Config) -> Result<Arc<dyn EvmClient>, Error> {
    let url = config.rpc_url.parse()?;

    match &config.vault_private_key {
        Some(key) => {
            let signer: PrivateKeySigner = key.parse().map_err(|_| {
                Error::ConfigurationError(String::from(
                    "vault private key is not a valid secp256k1 key",
                ))
            })?;
            let wallet = EthereumWallet::from(signer);
            let provider =
                ProviderBuilder::new().wallet(wallet).connect_http(url);
            Ok(Arc::new(AlloyEvm {
                provider,
                vault: config.vault_address,
                chain_id: config.chain_id,
            }))
        },
        None => {
            let provider = ProviderBuilder::new().connect_http(url);
            Ok(Arc::new(AlloyEvm {
                provider,
                vault: config.vault_address,
                chain_id: config.chain_id,
            }))
        },
    }
}

#[async_trait]
impl<P> EvmClient for AlloyEvm<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    fn vault_address(&self) -> Address {
        self.vault
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn get_native_balance(
        &self,
        address: Address,
    ) -> Result<U256, Error> {
        self.provider.get_balance(address).await.map_err(evm_err)
    }

    async fn get_code_len(&self, address: Address) -> Result<usize, Error> {
        let code = self
            .provider
            .get_code_at(address)
            .await
            .map_err(evm_err)?;
        Ok(code.len())
    }

    async fn erc20_balance_of(
        &self,
        token: Address,
        owner: Address,
    ) -> Result<U256, Error> {
        IErc20::new(token, &self.provider)
            .balanceOf(owner)
            .call()
            .await
            .map_err(evm_err)
    }

    async fn erc20_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, Error> {
        IErc20::new(token, &self.provider)
            .allowance(owner, spender)
            .call()
            .await
            .map_err(evm_err)
    }

    async fn erc20_approve(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> Result<ReceiptInfo, Error> {
        let pending = IErc20::new(token, &self.provider)
            .approve(spender, amount)
            .send()
            .await
            .map_err(evm_err)?;
        let receipt = pending.get_receipt().await.map_err(evm_err)?;
        if !receipt.status() {
            return Err(Error::Evm(format!(
                "approve reverted: {:#x}",
                receipt.transaction_hash
            )));
        }
        Ok(ReceiptInfo {
            status: true,
            block_number: receipt.block_number,
            transaction_hash: format!("{:#x}", receipt.transaction_hash),
        })
    }

    async fn erc20_transfer(
        &self,
        token: Address,
        to: Address,
        amount: U256,
    ) -> Result<ReceiptInfo, Error> {
        let pending = IErc20::new(token, &self.provider)
            .transfer(to, amount)
            .send()
            .await
            .map_err(evm_err)?;
        let receipt = pending.get_receipt().await.map_err(evm_err)?;
        if !receipt.status() {
            return Err(Error::Evm(format!(
                "transfer reverted: {:#x}",
                receipt.transaction_hash
            )));
        }
        Ok(ReceiptInfo {
            status: true,
            block_number: receipt.block_number,
            transaction_hash: format!("{:#x}", receipt.transaction_hash),
        })
    }

    async fn send_transaction(
        &self,
        request: TxRequest,
    ) -> Result<ReceiptInfo, Error> {
        let mut tx = TransactionRequest::default()
            .with_to(request.to)
            .with_value(request.value);
        if let Some(data) = request.data {
            tx = tx.with_input(data);
        }
        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(evm_err)?;
        let receipt = pending.get_receipt().await.map_err(evm_err)?;
        if !receipt.status() {
            return Err(Error::Evm(format!(
                "transaction reverted: {:#x}",
                receipt.transaction_hash
            )));
        }
        Ok(ReceiptInfo {
            status: true,
            block_number: receipt.block_number,
            transaction_hash: format!("{:#x}", receipt.transaction_hash),
        })
    }

    async fn latest_block(&self) -> Result<BlockInfo, Error> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Latest)
            .await
            .map_err(evm_err)?
            .ok_or_else(|| Error::Evm(String::from("no latest block")))?;
        Ok(BlockInfo {
            number: block.header.number,
            hash: format!("{:#x}", block.header.hash),
            timestamp: block.header.timestamp,
        })
    }

    async fn finalized_block(&self) -> Result<Option<BlockInfo>, Error> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Finalized)
            .await
            .map_err(evm_err)?;
        Ok(block.map(|block| BlockInfo {
            number: block.header.number,
            hash: format!("{:#x}", block.header.hash),
            timestamp: block.header.timestamp,
        }))
    }

    async fn block_number(&self) -> Result<u64, Error> {
        self.provider.get_block_number().await.map_err(evm_err)
    }

    async fn get_transaction(
        &self,
        hash: &str,
    ) -> Result<Option<TxInfo>, Error> {
        let hash = parse_hash(hash)?;
        let tx = self
            .provider
            .get_transaction_by_hash(hash)
            .await
            .map_err(evm_err)?;
        Ok(tx.map(|tx| TxInfo {
            hash: format!("{hash:#x}"),
            from: tx.inner.signer(),
            to: tx.to(),
            value: tx.value(),
            block_number: tx.block_number,
            block_hash: tx.block_hash.map(|hash| format!("{hash:#x}")),
            chain_id: tx.chain_id(),
        }))
    }

    async fn get_transaction_receipt(
        &self,
        hash: &str,
    ) -> Result<Option<ReceiptInfo>, Error> {
        let hash = parse_hash(hash)?;
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(evm_err)?;
        Ok(receipt.map(|receipt| ReceiptInfo {
            status: receipt.status(),
            block_number: receipt.block_number,
            transaction_hash: format!("{:#x}", receipt.transaction_hash),
        }))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct SentTx {
        pub kind: &'static str,
        pub token: Option<Address>,
        pub to: Address,
        pub value: U256,
        pub data: Option<Bytes>,
    }

    /// Test double over plain maps. Transfers debit/credit balances so
    /// post-swap refetches see the new state.
    #[derive(Debug, Default)]
    pub struct MockEvm {
        pub vault: Address,
        pub chain: u64,
        pub native_balances: Mutex<HashMap<Address, U256>>,
        pub token_balances: Mutex<HashMap<(Address, Address), U256>>,
        pub code_len: Mutex<HashMap<Address, usize>>,
        pub allowances: Mutex<HashMap<(Address, Address), U256>>,
        pub transactions: Mutex<HashMap<String, (TxInfo, ReceiptInfo)>>,
        pub sent: Mutex<Vec<SentTx>>,
        pub head: AtomicU64,
        counter: AtomicU64,
    }

    impl MockEvm {
        pub fn new(vault: Address, chain: u64) -> Self {
            MockEvm {
                vault,
                chain,
                head: AtomicU64::new(100),
                ..Default::default()
            }
        }

        pub fn set_native_balance(&self, address: Address, amount: U256) {
            self.native_balances.lock().unwrap().insert(address, amount);
        }

        pub fn set_token_balance(
            &self,
            token: Address,
            owner: Address,
            amount: U256,
        ) {
            self.code_len.lock().unwrap().insert(token, 1024);
            self.token_balances
                .lock()
                .unwrap()
                .insert((token, owner), amount);
        }

        pub fn insert_transaction(&self, info: TxInfo, receipt: ReceiptInfo) {
            self.transactions
                .lock()
                .unwrap()
                .insert(info.hash.to_lowercase(), (info, receipt));
        }

        fn next_receipt(&self) -> ReceiptInfo {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            ReceiptInfo {
                status: true,
                block_number: Some(self.head.load(Ordering::SeqCst)),
                transaction_hash: format!("0xmock{n:060x}"),
            }
        }
    }

    #[async_trait]
    impl EvmClient for MockEvm {
        fn vault_address(&self) -> Address {
            self.vault
        }

        fn chain_id(&self) -> u64 {
            self.chain
        }

        async fn get_native_balance(
            &self,
            address: Address,
        ) -> Result<U256, Error> {
            Ok(self
                .native_balances
                .lock()
                .unwrap()
                .get(&address)
                .copied()
                .unwrap_or(U256::ZERO))
        }

        async fn get_code_len(
            &self,
            address: Address,
        ) -> Result<usize, Error> {
            Ok(self
                .code_len
                .lock()
                .unwrap()
                .get(&address)
                .copied()
                .unwrap_or(0))
        }

        async fn erc20_balance_of(
            &self,
            token: Address,
            owner: Address,
        ) -> Result<U256, Error> {
            Ok(self
                .token_balances
                .lock()
                .unwrap()
                .get(&(token, owner))
                .copied()
                .unwrap_or(U256::ZERO))
        }

        async fn erc20_allowance(
            &self,
            token: Address,
            _owner: Address,
            spender: Address,
        ) -> Result<U256, Error> {
            Ok(self
                .allowances
                .lock()
                .unwrap()
                .get(&(token, spender))
                .copied()
                .unwrap_or(U256::ZERO))
        }

        async fn erc20_approve(
            &self,
            token: Address,
            spender: Address,
            amount: U256,
        ) -> Result<ReceiptInfo, Error> {
            self.allowances
                .lock()
                .unwrap()
                .insert((token, spender), amount);
            self.sent.lock().unwrap().push(SentTx {
                kind: "approve",
                token: Some(token),
                to: spender,
                value: amount,
                data: None,
            });
            Ok(self.next_receipt())
        }

        async fn erc20_transfer(
            &self,
            token: Address,
            to: Address,
            amount: U256,
        ) -> Result<ReceiptInfo, Error> {
            {
                let mut balances = self.token_balances.lock().unwrap();
                let from = balances
                    .get(&(token, self.vault))
                    .copied()
                    .unwrap_or(U256::ZERO);
                if from < amount {
                    return Err(Error::Evm(String::from(
                        "transfer amount exceeds balance",
                    )));
                }
                balances.insert((token, self.vault), from - amount);
                let credit = balances
                    .get(&(token, to))
                    .copied()
                    .unwrap_or(U256::ZERO);
                balances.insert((token, to), credit + amount);
            }
            self.sent.lock().unwrap().push(SentTx {
                kind: "transfer",
                token: Some(token),
                to,
                value: amount,
                data: None,
            });
            Ok(self.next_receipt())
        }

        async fn send_transaction(
            &self,
            request: TxRequest,
        ) -> Result<ReceiptInfo, Error> {
            {
                let mut balances = self.native_balances.lock().unwrap();
                let from = balances
                    .get(&self.vault)
                    .copied()
                    .unwrap_or(U256::ZERO);
                if from < request.value {
                    return Err(Error::Evm(String::from(
                        "insufficient native balance",
                    )));
                }
                balances.insert(self.vault, from - request.value);
                let credit = balances
                    .get(&request.to)
                    .copied()
                    .unwrap_or(U256::ZERO);
                balances.insert(request.to, credit + request.value);
            }
            self.sent.lock().unwrap().push(SentTx {
                kind: "send",
                token: None,
                to: request.to,
                value: request.value,
                data: request.data,
            });
            Ok(self.next_receipt())
        }

        async fn latest_block(&self) -> Result<BlockInfo, Error> {
            let number = self.head.load(Ordering::SeqCst);
            Ok(BlockInfo {
                number,
                hash: format!("0xblock{number:058x}"),
                timestamp: 1_700_000_000 + number,
            })
        }

        async fn finalized_block(&self) -> Result<Option<BlockInfo>, Error> {
            let number = self.head.load(Ordering::SeqCst).saturating_sub(10);
            Ok(Some(BlockInfo {
                number,
                hash: format!("0xblock{number:058x}"),
                timestamp: 1_700_000_000 + number,
            }))
        }

        async fn block_number(&self) -> Result<u64, Error> {
            Ok(self.head.load(Ordering::SeqCst))
        }

        async fn get_transaction(
            &self,
            hash: &str,
        ) -> Result<Option<TxInfo>, Error> {
            Ok(self
                .transactions
                .lock()
                .unwrap()
                .get(&hash.to_lowercase())
                .map(|(info, _)| info.clone()))
        }

        async fn get_transaction_receipt(
            &self,
            hash: &str,
        ) -> Result<Option<ReceiptInfo>, Error> {
            Ok(self
                .transactions
                .lock()
                .unwrap()
                .get(&hash.to_lowercase())
                .map(|(_, receipt)| receipt.clone()))
        }
    }
}
