use alloy::primitives::U256;
use tracing::{info, warn};

use crate::configuration::{AppState, State};
use crate::error::Error;
use crate::helpers::address_checksum;
use crate::provider::EvmClient;
use crate::types::{Asset, AssetBalance, AssetKind, TreasurySnapshot};

/// Read the vault's balances at the latest block. A single asset's
/// read failure yields a zero balance, never an error; only a missing
/// latest block is fatal.
pub async fn snapshot(
    evm: &dyn EvmClient,
    assets: &[Asset],
) -> Result<TreasurySnapshot, Error> {
    let vault = evm.vault_address();
    let latest = evm.latest_block().await?;
    let finalized_block_number = match evm.finalized_block().await {
        Ok(block) => block.map(|block| block.number),
        Err(error) => {
            warn!("finalized block unavailable: {}", error);
            None
        },
    };

    let mut balances = Vec::with_capacity(assets.len());
    for asset in assets {
        let minor_units = match asset.kind {
            AssetKind::Native => {
                match evm.get_native_balance(vault).await {
                    Ok(balance) => balance,
                    Err(error) => {
                        warn!(
                            "native balance read failed for {}: {}",
                            &asset.id, error
                        );
                        U256::ZERO
                    },
                }
            },
            AssetKind::Token => read_token_balance(evm, asset, vault).await,
        };
        balances.push(AssetBalance {
            asset_id: asset.id.clone(),
            symbol: asset.symbol.clone(),
            kind: asset.kind,
            decimals: asset.decimals,
            minor_units,
        });
    }

    Ok(TreasurySnapshot {
        wallet_address: address_checksum(&vault),
        block_number: latest.number,
        block_hash: latest.hash,
        block_timestamp: latest.timestamp,
        finalized_block_number,
        balances,
    })
}

/// Token reads are guarded by a code-at-address check so a
/// misconfigured asset degrades to a warning instead of RPC errors.
async fn read_token_balance(
    evm: &dyn EvmClient,
    asset: &Asset,
    vault: alloy::primitives::Address,
) -> U256 {
    let token = match asset.token_address {
        Some(token) => token,
        None => {
            warn!("token asset {} has no contract address", &asset.id);
            return U256::ZERO;
        },
    };
    match evm.get_code_len(token).await {
        Ok(0) => {
            warn!(
                "no contract code at {} for asset {}, reporting zero",
                token, &asset.id
            );
            U256::ZERO
        },
        Ok(_) => match evm.erc20_balance_of(token, vault).await {
            Ok(balance) => balance,
            Err(error) => {
                warn!("balanceOf failed for {}: {}", &asset.id, error);
                U256::ZERO
            },
        },
        Err(error) => {
            warn!("code read failed for {}: {}", &asset.id, error);
            U256::ZERO
        },
    }
}

/// Log balance movements against the previous snapshot and remember
/// the new one. Advisory only.
pub fn log_snapshot_diff(state: &AppState<State>, snapshot: &TreasurySnapshot) {
    let mut last = state.last_snapshot.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(previous) = last.as_ref() {
        for balance in &snapshot.balances {
            let before = previous.balance_of(&balance.asset_id);
            if before != balance.minor_units {
                info!(
                    "treasury {} moved {} -> {} (block {} -> {})",
                    &balance.asset_id,
                    before,
                    balance.minor_units,
                    previous.block_number,
                    snapshot.block_number,
                );
            }
        }
    }
    *last = Some(snapshot.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::Config;
    use crate::provider::testing::MockEvm;

    #[tokio::test]
    async fn test_snapshot_reads_all_assets() {
        let config = Config::for_tests();
        let evm = MockEvm::new(config.vault_address, config.chain_id);
        let usdc = config.get_asset("usdc").unwrap();

        evm.set_native_balance(
            config.vault_address,
            U256::from(2_000_000_000_000_000_000u128),
        );
        evm.set_token_balance(
            usdc.token_address.unwrap(),
            config.vault_address,
            U256::from(1_500_000u64),
        );

        let snapshot = snapshot(&evm, &config.assets).await.unwrap();
        assert_eq!(
            snapshot.balance_of("eth"),
            U256::from(2_000_000_000_000_000_000u128)
        );
        assert_eq!(snapshot.balance_of("usdc"), U256::from(1_500_000u64));
        assert!(snapshot.finalized_block_number.is_some());
        assert_eq!(
            snapshot.wallet_address,
            address_checksum(&config.vault_address)
        );
    }

    #[tokio::test]
    async fn test_codeless_token_reads_zero() {
        let config = Config::for_tests();
        let evm = MockEvm::new(config.vault_address, config.chain_id);
        evm.set_native_balance(config.vault_address, U256::from(1u64));
        // the usdc contract has no code registered in the mock

        let snapshot = snapshot(&evm, &config.assets).await.unwrap();
        assert_eq!(snapshot.balance_of("usdc"), U256::ZERO);
        assert_eq!(snapshot.balance_of("eth"), U256::from(1u64));
    }

    #[tokio::test]
    async fn test_misconfigured_token_without_address() {
        let config = Config::for_tests();
        let evm = MockEvm::new(config.vault_address, config.chain_id);
        let broken = Asset {
            id: String::from("broken"),
            kind: AssetKind::Token,
            symbol: String::from("BRK"),
            token_address: None,
            decimals: 18,
            price_feed_id: String::from("BRK-USD"),
        };

        let snapshot = snapshot(&evm, &[broken]).await.unwrap();
        assert_eq!(snapshot.balance_of("broken"), U256::ZERO);
    }
}
