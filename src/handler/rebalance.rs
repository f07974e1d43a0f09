use alloy::primitives::{Bytes, U256};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::info;

use crate::configuration::{AppState, Config, State};
use crate::dao::kv::price::PRICE_DECIMALS;
use crate::dao::JobHandle;
use crate::error::Error;
use crate::handler::treasury;
use crate::helpers::{
    address_checksum, clamp_percent, format_minor_units, now_ms,
    parse_address, round4,
};
use crate::model::{
    ActionResult, AssetTotal, JobPayload, PriceSnapshot, RebalanceMode,
    RebalanceOutcome, RebalanceReason,
};
use crate::provider::{PriceSource, QuoteSource, TxRequest};
use crate::types::{Asset, AssetKind, QuoteParams, TreasurySnapshot};

const MAX_QUOTE_ITERATIONS: u32 = 3;

/// Percent inputs are carried at 10⁴ so a consensus like 33.3333 keeps
/// its precision through integer target math.
const PERCENT_SCALE: u128 = 10_000;

pub const MSG_EXECUTION_DISABLED: &str = "execution disabled";
pub const MSG_WITHIN_TOLERANCE: &str = "within tolerance";
pub const MSG_ZERO_BALANCE: &str = "zero balance";
pub const MSG_ROUNDED_TO_ZERO: &str = "rounded to zero";

/// Consensus applied when nobody with weight has voted.
const DEFAULT_ETH_PERCENT: f64 = 50.0;

#[derive(Debug, Clone)]
struct Position {
    asset: Asset,
    balance: U256,
    price_raw: U256,
    current_usd_raw: u128,
    target_usd_raw: u128,
}

fn usd_raw(
    balance: U256,
    price_raw: U256,
    unit: U256,
) -> Result<u128, Error> {
    u128::try_from(balance * price_raw / unit)
        .map_err(|_| Error::Numeric(String::from("usd value out of range")))
}

/// Build per-asset positions with integer USD values at the shared
/// price scale, and exact targets: native gets the consensus percent,
/// the stablecoin the remainder, every other asset zero. The rounding
/// remainder lands on the first asset so targets sum exactly.
fn build_positions(
    config: &Config,
    snapshot: &TreasurySnapshot,
    prices: &HashMap<String, PriceSnapshot>,
    eth_percent: f64,
) -> Result<Vec<Position>, Error> {
    let native_scaled =
        (clamp_percent(eth_percent) * PERCENT_SCALE as f64).round() as u128;
    let stable_scaled = 100 * PERCENT_SCALE - native_scaled;

    let mut positions = Vec::with_capacity(config.assets.len());
    for asset in &config.assets {
        let price = prices
            .get(&asset.id)
            .ok_or_else(|| Error::PriceUnavailable(asset.id.clone()))?;
        if price.price_decimals != PRICE_DECIMALS {
            return Err(Error::PriceScaleMismatch);
        }
        let balance = snapshot.balance_of(&asset.id);
        positions.push(Position {
            current_usd_raw: usd_raw(
                balance,
                price.price_raw,
                asset.unit(),
            )?,
            balance,
            price_raw: price.price_raw,
            asset: asset.clone(),
            target_usd_raw: 0,
        });
    }

    let total: u128 = positions.iter().map(|p| p.current_usd_raw).sum();
    let mut assigned: u128 = 0;
    for position in positions.iter_mut() {
        let pct_scaled = match position.asset.kind {
            AssetKind::Native => native_scaled,
            AssetKind::Token if position.asset.id == config.stable_asset_id => {
                stable_scaled
            },
            AssetKind::Token => 0,
        };
        position.target_usd_raw =
            total * pct_scaled / (100 * PERCENT_SCALE);
        assigned += position.target_usd_raw;
    }
    if let Some(first) = positions.first_mut() {
        first.target_usd_raw += total - assigned;
    }

    Ok(positions)
}

fn tolerance_usd_raw(
    total_usd_raw: u128,
    tolerance_percent: f64,
    min_usd_delta: u64,
) -> u128 {
    let basis_points = (tolerance_percent * 100.0).round().max(0.0) as u128;
    let from_percent = total_usd_raw * basis_points / 10_000;
    let floor =
        u128::from(min_usd_delta) * 10u128.pow(u32::from(PRICE_DECIMALS));
    from_percent.max(floor)
}

/// First overweight and first underweight asset in configuration
/// order. None when either side is within tolerance.
fn select_pair(
    positions: &[Position],
    tolerance: u128,
) -> Option<(usize, usize)> {
    let seller = positions.iter().position(|p| {
        p.current_usd_raw > p.target_usd_raw
            && p.current_usd_raw - p.target_usd_raw > tolerance
    })?;
    let buyer = positions.iter().position(|p| {
        p.target_usd_raw > p.current_usd_raw
            && p.target_usd_raw - p.current_usd_raw > tolerance
    })?;
    Some((seller, buyer))
}

/// Grow the sell amount by the mean residual imbalance of the two
/// sides, capping at the seller's balance. Returns the new amount and
/// whether the cap was hit.
fn next_sell_amount(
    sell_amount: U256,
    seller_balance: U256,
    seller_delta: i128,
    buyer_delta: i128,
    seller_unit: U256,
    seller_price_raw: U256,
) -> (U256, bool) {
    let adjustment_usd =
        (seller_delta.unsigned_abs() + buyer_delta.unsigned_abs()) / 2;
    let adjustment_minor =
        U256::from(adjustment_usd) * seller_unit / seller_price_raw;
    let grown = sell_amount + adjustment_minor;
    if grown >= seller_balance {
        (seller_balance, true)
    } else {
        (grown, false)
    }
}

fn totals(positions: &[Position]) -> Vec<AssetTotal> {
    let total: u128 = positions.iter().map(|p| p.current_usd_raw).sum();
    positions
        .iter()
        .map(|p| AssetTotal {
            asset_id: p.asset.id.clone(),
            symbol: p.asset.symbol.clone(),
            balance_minor_units: p.balance,
            usd_raw: U256::from(p.current_usd_raw),
            percent: if total > 0 {
                round4(p.current_usd_raw as f64 / total as f64 * 100.0)
            } else {
                0.0
            },
        })
        .collect()
}

fn quote_params(config: &Config, seller: &Asset, buyer: &Asset, sell_amount: U256) -> QuoteParams {
    QuoteParams {
        sell_token: seller.quote_token(),
        buy_token: buyer.quote_token(),
        sell_amount,
        taker: address_checksum(&config.vault_address),
        chain_id: config.chain_id,
        slippage_bps: config.slippage_bps,
    }
}

/// Run one rebalance job: aggregate consensus, read treasury state and
/// prices, plan at most one swap, and execute or dry-run it. Every
/// terminal path records an outcome; errors bubble to the worker which
/// fails the job without an outcome write.
pub async fn execute(
    state: &AppState<State>,
    handle: &JobHandle,
    quoter: &dyn QuoteSource,
    price_source: &dyn PriceSource,
) -> Result<RebalanceOutcome, Error> {
    let config = &state.config;
    let reason = match &handle.job.payload {
        JobPayload::Rebalance(payload) => payload.reason,
        JobPayload::Settlement(_) => {
            return Err(Error::JobPayload(String::from(
                "rebalance job carries a settlement payload",
            )))
        },
    };

    // zero-deposit votes cannot race a settlement here: both run under
    // the queue gate
    state
        .store
        .votes
        .sweep_stale(&config.proposal_id, &state.store.deposits)
        .await?;
    let results = state
        .store
        .votes
        .aggregate(&config.proposal_id, &state.store.deposits)
        .await?;
    let eth_percent = if results.totals.total_weight > 0.0 {
        results.totals.weighted_eth_percent
    } else {
        DEFAULT_ETH_PERCENT
    };

    handle.heartbeat().await?;
    let snapshot = treasury::snapshot(state.evm.as_ref(), &config.assets).await?;
    treasury::log_snapshot_diff(state, &snapshot);
    handle.heartbeat().await?;
    let prices = state
        .store
        .prices
        .get_prices(price_source, &config.assets, config.price_cache_ttl)
        .await?;
    handle.heartbeat().await?;

    let positions =
        build_positions(config, &snapshot, &prices, eth_percent)?;
    let total_usd: u128 =
        positions.iter().map(|p| p.current_usd_raw).sum();

    if total_usd == 0 {
        return record_skip(state, handle, reason, &positions, MSG_ZERO_BALANCE)
            .await;
    }

    let tolerance = tolerance_usd_raw(
        total_usd,
        config.tolerance_percent,
        config.min_usd_delta,
    );
    let (seller_index, buyer_index) =
        match select_pair(&positions, tolerance) {
            Some(pair) => pair,
            None => {
                return record_skip(
                    state,
                    handle,
                    reason,
                    &positions,
                    MSG_WITHIN_TOLERANCE,
                )
                .await
            },
        };
    let seller = &positions[seller_index];
    let buyer = &positions[buyer_index];

    let seller_over = seller.current_usd_raw - seller.target_usd_raw;
    let buyer_under = buyer.target_usd_raw - buyer.current_usd_raw;
    let usd_to_swap = seller_over.min(buyer_under);
    let mut sell_amount =
        U256::from(usd_to_swap) * seller.asset.unit() / seller.price_raw;
    if sell_amount.is_zero() {
        return record_skip(
            state,
            handle,
            reason,
            &positions,
            MSG_ROUNDED_TO_ZERO,
        )
        .await;
    }

    info!(
        "rebalance planning: consensus {}%, selling {} of {} for {}",
        eth_percent, sell_amount, &seller.asset.id, &buyer.asset.id
    );

    // the oracle price and the venue price differ, so converge on the
    // sell amount against live quotes instead of trusting one shot
    let mut capped = false;
    let mut iterations = 0;
    let quote = loop {
        iterations += 1;
        handle.heartbeat().await?;
        let quote = quoter
            .swap_quote(&quote_params(
                config,
                &seller.asset,
                &buyer.asset,
                sell_amount,
            ))
            .await?;
        handle.heartbeat().await?;

        if capped || iterations >= MAX_QUOTE_ITERATIONS {
            break quote;
        }

        let seller_usd_after = usd_raw(
            seller.balance - sell_amount,
            seller.price_raw,
            seller.asset.unit(),
        )?;
        let buyer_usd_after = usd_raw(
            buyer.balance + quote.buy_amount,
            buyer.price_raw,
            buyer.asset.unit(),
        )?;
        let seller_delta =
            seller_usd_after as i128 - seller.target_usd_raw as i128;
        let buyer_delta =
            buyer_usd_after as i128 - buyer.target_usd_raw as i128;

        if seller_delta.unsigned_abs() <= tolerance
            && buyer_delta.unsigned_abs() <= tolerance
        {
            break quote;
        }
        // seller flipped underweight: selling more cannot help
        if seller_delta <= 0 {
            break quote;
        }

        let (grown, hit_cap) = next_sell_amount(
            sell_amount,
            seller.balance,
            seller_delta,
            buyer_delta,
            seller.asset.unit(),
            seller.price_raw,
        );
        if grown == sell_amount {
            break quote;
        }
        sell_amount = grown;
        capped = hit_cap;
        info!(
            "quote iteration {}: adjusting sell amount to {}{}",
            iterations,
            sell_amount,
            if capped { " (capped at balance)" } else { "" },
        );
    };

    let action = ActionResult {
        sell_asset: seller.asset.id.clone(),
        buy_asset: buyer.asset.id.clone(),
        sell_amount_minor_units: sell_amount,
        buy_amount_minor_units: quote.buy_amount,
        sell_amount_formatted: format_minor_units(
            sell_amount,
            seller.asset.decimals,
        ),
        transaction_hash: None,
        sources: quote.route_sources(),
    };

    if !config.rebalance_execute {
        let outcome = RebalanceOutcome {
            job_id: handle.job.id.clone(),
            reason,
            mode: RebalanceMode::DryRun,
            timestamp: now_ms(),
            totals: totals(&positions),
            message: Some(String::from(MSG_EXECUTION_DISABLED)),
            actions: vec![action],
        };
        state
            .store
            .rebalances
            .record(&outcome, config.rebalance_history_limit)
            .await?;
        info!("rebalance dry-run recorded for job {}", &handle.job.id);
        return Ok(outcome);
    }

    if let AssetKind::Token = seller.asset.kind {
        let token = seller.asset.token_address.ok_or_else(|| {
            Error::ConfigurationError(format!(
                "token asset {} has no address",
                &seller.asset.id
            ))
        })?;
        let spender = parse_address(quote.allowance_spender())?;
        handle.heartbeat().await?;
        let allowance = state
            .evm
            .erc20_allowance(token, config.vault_address, spender)
            .await?;
        handle.heartbeat().await?;
        if allowance < sell_amount {
            info!(
                "approving {} of {} for spender {}",
                sell_amount, &seller.asset.id, spender
            );
            state.evm.erc20_approve(token, spender, sell_amount).await?;
            handle.heartbeat().await?;
        }
    }

    let to = parse_address(&quote.transaction.to)?;
    let data = Bytes::from_str(&quote.transaction.data).map_err(|_| {
        Error::Evm(String::from("aggregator returned invalid calldata"))
    })?;
    // selling the native asset: the submission must carry the sell
    // amount as value, whatever the quote's transaction says
    let value = match seller.asset.kind {
        AssetKind::Native => sell_amount,
        AssetKind::Token => quote.transaction.value.unwrap_or(U256::ZERO),
    };

    handle.heartbeat().await?;
    let receipt = state
        .evm
        .send_transaction(TxRequest {
            to,
            value,
            data: Some(data),
        })
        .await?;
    info!(
        "rebalance swap confirmed: {} sold {} {}",
        &receipt.transaction_hash, sell_amount, &seller.asset.symbol
    );
    handle.heartbeat().await?;

    // post-swap totals from fresh state; a price missing on refetch
    // falls back to the pre-swap snapshot rather than failing the job
    let snapshot_after =
        treasury::snapshot(state.evm.as_ref(), &config.assets).await?;
    treasury::log_snapshot_diff(state, &snapshot_after);
    let mut prices_after = state
        .store
        .prices
        .get_prices(price_source, &config.assets, config.price_cache_ttl)
        .await?;
    for (asset_id, price) in prices {
        prices_after.entry(asset_id).or_insert(price);
    }
    let positions_after =
        build_positions(config, &snapshot_after, &prices_after, eth_percent)?;

    let outcome = RebalanceOutcome {
        job_id: handle.job.id.clone(),
        reason,
        mode: RebalanceMode::Executed,
        timestamp: now_ms(),
        totals: totals(&positions_after),
        message: None,
        actions: vec![ActionResult {
            transaction_hash: Some(receipt.transaction_hash),
            ..action
        }],
    };
    state
        .store
        .rebalances
        .record(&outcome, config.rebalance_history_limit)
        .await?;
    Ok(outcome)
}

async fn record_skip(
    state: &AppState<State>,
    handle: &JobHandle,
    reason: RebalanceReason,
    positions: &[Position],
    message: &str,
) -> Result<RebalanceOutcome, Error> {
    let outcome = RebalanceOutcome {
        job_id: handle.job.id.clone(),
        reason,
        mode: RebalanceMode::Skipped,
        timestamp: now_ms(),
        totals: totals(positions),
        message: Some(message.to_string()),
        actions: Vec::new(),
    };
    state
        .store
        .rebalances
        .record(&outcome, state.config.rebalance_history_limit)
        .await?;
    info!("rebalance skipped: {}", message);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::Config;
    use crate::model::{JobKind, RebalancePayload};
    use crate::provider::{testing::MockEvm, MemoryKv, StorePool, HTTP};
    use crate::types::{
        AllowanceIssue, QuoteIssues, QuoteTransaction, SwapQuote,
    };
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    const ROUTER: &str = "0x00000000000000000000000000000000000000f1";
    const ETH: u128 = 1_000_000_000_000_000_000;

    struct MapPriceSource(HashMap<String, String>);

    impl MapPriceSource {
        fn base() -> Self {
            let mut prices = HashMap::new();
            prices.insert(String::from("ETH-USD"), String::from("2000"));
            prices.insert(String::from("USDC-USD"), String::from("1"));
            MapPriceSource(prices)
        }

        fn missing_usdc() -> Self {
            let mut prices = HashMap::new();
            prices.insert(String::from("ETH-USD"), String::from("2000"));
            MapPriceSource(prices)
        }
    }

    #[async_trait]
    impl PriceSource for MapPriceSource {
        async fn get_spot_price(
            &self,
            pair: &str,
        ) -> Result<String, Error> {
            self.0
                .get(pair)
                .cloned()
                .ok_or_else(|| Error::PriceUnavailable(pair.to_string()))
        }
    }

    struct SeqQuoter {
        responses: Mutex<VecDeque<SwapQuote>>,
        calls: Mutex<Vec<QuoteParams>>,
    }

    impl SeqQuoter {
        fn with(quotes: Vec<SwapQuote>) -> Self {
            SeqQuoter {
                responses: Mutex::new(quotes.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl QuoteSource for SeqQuoter {
        async fn swap_quote(
            &self,
            params: &QuoteParams,
        ) -> Result<SwapQuote, Error> {
            self.calls.lock().unwrap().push(params.clone());
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                Ok(responses.pop_front().unwrap())
            } else {
                responses.front().cloned().ok_or(Error::Aggregator {
                    status: 500,
                    body: String::from("no quote configured"),
                })
            }
        }
    }

    fn swap_quote(
        sell: u128,
        buy: u128,
        spender: Option<&str>,
    ) -> SwapQuote {
        SwapQuote {
            buy_amount: U256::from(buy),
            sell_amount: U256::from(sell),
            issues: spender.map(|spender| QuoteIssues {
                allowance: Some(AllowanceIssue {
                    spender: Some(spender.to_string()),
                }),
            }),
            transaction: QuoteTransaction {
                to: ROUTER.to_string(),
                data: String::from("0xdeadbeef"),
                gas: None,
                gas_price: None,
                value: None,
            },
            route: None,
        }
    }

    fn app(mock: Arc<MockEvm>, execute: bool) -> AppState<State> {
        let mut config = Config::for_tests();
        config.rebalance_execute = execute;
        let store = StorePool::new(MemoryKv::handle());
        let http = HTTP::new(config.clone());
        AppState::new(State::new(config, store, mock, http))
    }

    async fn claim(state: &AppState<State>) -> JobHandle {
        state
            .store
            .queue
            .enqueue(
                JobKind::Rebalance,
                JobPayload::Rebalance(RebalancePayload {
                    reason: RebalanceReason::Manual,
                    context: None,
                }),
                None,
            )
            .await
            .unwrap();
        state
            .store
            .queue
            .claim_next(state.config.worker_lock_ttl, state.config.job_max_age)
            .await
            .unwrap()
            .unwrap()
    }

    fn usdc_address(state: &AppState<State>) -> alloy::primitives::Address {
        state.config.get_asset("usdc").unwrap().token_address.unwrap()
    }

    #[tokio::test]
    async fn test_balanced_vault_skips_without_quoting() {
        let mock = Arc::new(MockEvm::new(
            Config::for_tests().vault_address,
            8453,
        ));
        let state = app(mock.clone(), true);
        mock.set_native_balance(state.config.vault_address, U256::from(ETH));
        mock.set_token_balance(
            usdc_address(&state),
            state.config.vault_address,
            U256::from(2_000_000_000u64),
        );

        let handle = claim(&state).await;
        let quoter = SeqQuoter::with(Vec::new());
        let outcome = execute(&state, &handle, &quoter, &MapPriceSource::base())
            .await
            .unwrap();

        assert_eq!(outcome.mode, RebalanceMode::Skipped);
        assert_eq!(outcome.message.as_deref(), Some(MSG_WITHIN_TOLERANCE));
        assert_eq!(quoter.call_count(), 0);
        assert!(mock.sent.lock().unwrap().is_empty());

        let last = state.store.rebalances.last().await.unwrap().unwrap();
        assert_eq!(last.job_id, handle.job.id);
        handle.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_vault_skips_with_zero_balance() {
        let mock = Arc::new(MockEvm::new(
            Config::for_tests().vault_address,
            8453,
        ));
        let state = app(mock.clone(), true);

        let handle = claim(&state).await;
        let quoter = SeqQuoter::with(Vec::new());
        let outcome = execute(&state, &handle, &quoter, &MapPriceSource::base())
            .await
            .unwrap();

        assert_eq!(outcome.mode, RebalanceMode::Skipped);
        assert_eq!(outcome.message.as_deref(), Some(MSG_ZERO_BALANCE));
        handle.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_native_sell_executes_with_value_override() {
        let mock = Arc::new(MockEvm::new(
            Config::for_tests().vault_address,
            8453,
        ));
        let state = app(mock.clone(), true);
        // all value in the native asset, consensus defaults to 50/50
        mock.set_native_balance(
            state.config.vault_address,
            U256::from(2 * ETH),
        );
        mock.set_token_balance(
            usdc_address(&state),
            state.config.vault_address,
            U256::ZERO,
        );

        let handle = claim(&state).await;
        let quoter =
            SeqQuoter::with(vec![swap_quote(ETH, 1_990_000_000, None)]);
        let outcome = execute(&state, &handle, &quoter, &MapPriceSource::base())
            .await
            .unwrap();

        assert_eq!(outcome.mode, RebalanceMode::Executed);
        assert_eq!(quoter.call_count(), 1);
        assert_eq!(outcome.actions.len(), 1);
        assert_eq!(
            outcome.actions[0].sell_amount_minor_units,
            U256::from(ETH)
        );
        assert!(outcome.actions[0].transaction_hash.is_some());

        // the quote said value 0; selling native must override it
        let sent = mock.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, "send");
        assert_eq!(sent[0].value, U256::from(ETH));
        assert_eq!(
            sent[0].to,
            parse_address(ROUTER).unwrap()
        );
        handle.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_seller_flip_accepts_current_quote() {
        let mock = Arc::new(MockEvm::new(
            Config::for_tests().vault_address,
            8453,
        ));
        let state = app(mock.clone(), true);
        mock.set_native_balance(
            state.config.vault_address,
            U256::from(2 * ETH),
        );
        mock.set_token_balance(
            usdc_address(&state),
            state.config.vault_address,
            U256::ZERO,
        );

        let handle = claim(&state).await;
        // short fill: buyer stays $70 under target, beyond the $40
        // tolerance, but the seller is no longer overweight
        let quoter =
            SeqQuoter::with(vec![swap_quote(ETH, 1_930_000_000, None)]);
        let outcome = execute(&state, &handle, &quoter, &MapPriceSource::base())
            .await
            .unwrap();

        assert_eq!(outcome.mode, RebalanceMode::Executed);
        assert_eq!(quoter.call_count(), 1);
        handle.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_token_sell_approves_before_swapping() {
        let mock = Arc::new(MockEvm::new(
            Config::for_tests().vault_address,
            8453,
        ));
        let state = app(mock.clone(), true);
        mock.set_native_balance(state.config.vault_address, U256::ZERO);
        mock.set_token_balance(
            usdc_address(&state),
            state.config.vault_address,
            U256::from(4_000_000_000u64),
        );

        let spender = "0x00000000000000000000000000000000000000f2";
        let handle = claim(&state).await;
        let quoter = SeqQuoter::with(vec![swap_quote(
            2_000_000_000,
            ETH,
            Some(spender),
        )]);
        let outcome = execute(&state, &handle, &quoter, &MapPriceSource::base())
            .await
            .unwrap();

        assert_eq!(outcome.mode, RebalanceMode::Executed);
        let sent = mock.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind, "approve");
        assert_eq!(sent[0].to, parse_address(spender).unwrap());
        assert_eq!(sent[0].value, U256::from(2_000_000_000u64));
        assert_eq!(sent[1].kind, "send");
        assert_eq!(sent[1].value, U256::ZERO);
        handle.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_dry_run_plans_without_submitting() {
        let mock = Arc::new(MockEvm::new(
            Config::for_tests().vault_address,
            8453,
        ));
        let state = app(mock.clone(), false);
        mock.set_native_balance(
            state.config.vault_address,
            U256::from(2 * ETH),
        );
        mock.set_token_balance(
            usdc_address(&state),
            state.config.vault_address,
            U256::ZERO,
        );

        let handle = claim(&state).await;
        let quoter =
            SeqQuoter::with(vec![swap_quote(ETH, 1_990_000_000, None)]);
        let outcome = execute(&state, &handle, &quoter, &MapPriceSource::base())
            .await
            .unwrap();

        assert_eq!(outcome.mode, RebalanceMode::DryRun);
        assert_eq!(
            outcome.message.as_deref(),
            Some(MSG_EXECUTION_DISABLED)
        );
        assert_eq!(outcome.actions.len(), 1);
        assert!(outcome.actions[0].transaction_hash.is_none());
        assert!(mock.sent.lock().unwrap().is_empty());
        handle.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_price_aborts_before_any_write() {
        let mock = Arc::new(MockEvm::new(
            Config::for_tests().vault_address,
            8453,
        ));
        let state = app(mock.clone(), true);
        mock.set_native_balance(state.config.vault_address, U256::from(ETH));

        let handle = claim(&state).await;
        let quoter = SeqQuoter::with(Vec::new());
        let result = execute(
            &state,
            &handle,
            &quoter,
            &MapPriceSource::missing_usdc(),
        )
        .await;

        assert!(matches!(result, Err(Error::PriceUnavailable(_))));
        assert!(state.store.rebalances.last().await.unwrap().is_none());
        handle.fail(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_mixed_price_scales_abort() {
        let mock = Arc::new(MockEvm::new(
            Config::for_tests().vault_address,
            8453,
        ));
        let state = app(mock.clone(), true);
        mock.set_native_balance(state.config.vault_address, U256::from(ETH));

        // a historical snapshot written at a different scale
        let stale_scale = PriceSnapshot {
            asset_id: String::from("usdc"),
            symbol: String::from("USDC"),
            price_usd: 1.0,
            source: String::from("coinbase-spot"),
            updated_at: now_ms(),
            expires_at: now_ms() + 60_000,
            price_decimals: 6,
            price_raw: U256::from(1_000_000u64),
        };
        state
            .store
            .kv
            .set(
                &crate::keys::price_snapshot("usdc"),
                &serde_json::to_string(&stale_scale).unwrap(),
                crate::provider::SetOptions::default(),
            )
            .await
            .unwrap();

        let handle = claim(&state).await;
        let quoter = SeqQuoter::with(Vec::new());
        let result =
            execute(&state, &handle, &quoter, &MapPriceSource::base()).await;

        assert!(matches!(result, Err(Error::PriceScaleMismatch)));
        handle.fail(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_voted_consensus_shifts_targets() {
        let mock = Arc::new(MockEvm::new(
            Config::for_tests().vault_address,
            8453,
        ));
        let state = app(mock.clone(), true);
        // vault is all native; a unanimous 100% native vote means no
        // rebalance is needed at all
        mock.set_native_balance(
            state.config.vault_address,
            U256::from(2 * ETH),
        );
        mock.set_token_balance(
            usdc_address(&state),
            state.config.vault_address,
            U256::ZERO,
        );

        state
            .store
            .deposits
            .record_deposit(&crate::model::DepositTransaction {
                hash: String::from("0x77"),
                from: String::from("0xVoterA"),
                to: String::from(
                    "0x00000000000000000000000000000000000000aa",
                ),
                value_minor_units: U256::from(ETH),
                block_number: 90,
                block_hash: String::from("0xblock"),
                timestamp: now_ms(),
                chain_id: 8453,
                confirmations: 3,
            })
            .await
            .unwrap();
        state
            .store
            .votes
            .record_vote(&crate::model::AllocationVote {
                proposal_id: state.config.proposal_id.clone(),
                address: String::from("0xVoterA"),
                eth_percent: 100,
                weight: 0.0,
                deposit_minor_units: U256::ZERO,
                timestamp: now_ms(),
            })
            .await
            .unwrap();

        let handle = claim(&state).await;
        let quoter = SeqQuoter::with(Vec::new());
        let outcome = execute(&state, &handle, &quoter, &MapPriceSource::base())
            .await
            .unwrap();

        assert_eq!(outcome.mode, RebalanceMode::Skipped);
        assert_eq!(outcome.message.as_deref(), Some(MSG_WITHIN_TOLERANCE));
        handle.ack().await.unwrap();
    }

    #[test]
    fn test_tolerance_floor_and_percent() {
        let usd = |dollars: u128| dollars * 10u128.pow(8);
        // 1% of $4000 wins over the $5 floor
        assert_eq!(tolerance_usd_raw(usd(4_000), 1.0, 5), usd(40));
        // 1% of $100 loses to the $5 floor
        assert_eq!(tolerance_usd_raw(usd(100), 1.0, 5), usd(5));
        assert_eq!(tolerance_usd_raw(0, 1.0, 5), usd(5));
    }

    #[test]
    fn test_next_sell_amount_grows_by_mean_residual() {
        let unit = U256::from(ETH);
        let price = U256::from(200_000_000_000u64); // $2000
        let usd = |dollars: i128| dollars * 10i128.pow(8);

        let (grown, capped) = next_sell_amount(
            U256::from(ETH),
            U256::from(10 * ETH),
            usd(100),
            usd(-50),
            unit,
            price,
        );
        // mean of $100 and $50 is $75 -> 0.0375 native
        assert_eq!(
            grown,
            U256::from(ETH) + U256::from(37_500_000_000_000_000u128)
        );
        assert!(!capped);

        let (at_cap, capped) = next_sell_amount(
            U256::from(ETH),
            U256::from(ETH) + U256::from(1u64),
            usd(10_000),
            usd(-10_000),
            unit,
            price,
        );
        assert_eq!(at_cap, U256::from(ETH) + U256::from(1u64));
        assert!(capped);
    }

    #[test]
    fn test_pair_selection_is_config_ordered() {
        let config = Config::for_tests();
        let asset = |id: &str| config.get_asset(id).unwrap().clone();
        let position = |id: &str, current: u128, target: u128| Position {
            asset: asset(id),
            balance: U256::ZERO,
            price_raw: U256::from(100_000_000u64),
            current_usd_raw: current,
            target_usd_raw: target,
        };

        let positions = vec![
            position("eth", 300, 100),
            position("usdc", 0, 200),
        ];
        assert_eq!(select_pair(&positions, 10), Some((0, 1)));

        // everything inside the band: nothing to do
        let balanced = vec![
            position("eth", 105, 100),
            position("usdc", 95, 100),
        ];
        assert_eq!(select_pair(&balanced, 10), None);

        // an overweight asset without any underweight counterpart
        let oneside = vec![
            position("eth", 300, 100),
            position("usdc", 95, 100),
        ];
        assert_eq!(select_pair(&oneside, 10), None);
    }
}
