use alloy::primitives::{Address, U256};
use alloy::signers::local::PrivateKeySigner;
use std::collections::HashMap;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{env, fs};
use tracing::warn;

use crate::error::Error;
use crate::helpers::{formatter, parse_tuple_string, Formatter};
use crate::provider::{EvmClient, StorePool, HTTP};
use crate::types::{Asset, AssetKind, QuoteParams, TreasurySnapshot};

#[derive(Debug)]
pub struct AppState<T>(Arc<T>);

impl<T> AppState<T> {
    pub fn new(state: T) -> AppState<T> {
        AppState(Arc::new(state))
    }
}

impl<T> Clone for AppState<T> {
    fn clone(&self) -> AppState<T> {
        AppState(Arc::clone(&self.0))
    }
}

impl<T> Deref for AppState<T> {
    type Target = Arc<T>;

    fn deref(&self) -> &Arc<T> {
        &self.0
    }
}

pub struct State {
    pub config: Config,
    pub store: StorePool,
    pub evm: Arc<dyn EvmClient>,
    pub http: HTTP,
    /// Last observed treasury snapshot, kept only for diff logging.
    pub last_snapshot: Mutex<Option<TreasurySnapshot>>,
}

impl State {
    pub fn new(
        config: Config,
        store: StorePool,
        evm: Arc<dyn EvmClient>,
        http: HTTP,
    ) -> State {
        State {
            config,
            store,
            evm,
            http,
            last_snapshot: Mutex::new(None),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,

    pub rpc_url: String,
    pub chain_id: u64,
    pub vault_private_key: Option<String>,
    pub vault_address: Address,

    pub assets: Vec<Asset>,
    pub hash_map_assets: HashMap<String, Asset>,
    pub stable_asset_id: String,
    pub proposal_id: String,

    pub required_deposit_minor_units: U256,
    pub required_confirmations: u64,

    pub rebalance_execute: bool,
    pub settlement_execute: bool,
    pub slippage_bps: u32,
    pub tolerance_percent: f64,
    pub min_usd_delta: u64,
    pub rebalance_history_limit: usize,
    pub settlement_max_age: Duration,

    pub spot_price_url: String,
    pub aggregator_url: String,
    pub price_cache_ttl: Duration,

    pub request_lock_ttl: Duration,
    pub worker_lock_ttl: Duration,
    pub job_dedupe_ttl: Duration,
    pub job_max_age: Duration,
}

impl Config {
    pub fn get_spot_price_url(&self, pair: &str) -> String {
        let url = &self.spot_price_url;
        formatter(url.to_string(), &[Formatter::Str(pair.to_string())])
    }

    pub fn get_quote_url(&self, params: &QuoteParams) -> String {
        format!(
            "{}/swap/allowance-holder/quote?chainId={}&sellToken={}&buyToken={}&sellAmount={}&taker={}&slippageBps={}",
            self.aggregator_url.trim_end_matches('/'),
            params.chain_id,
            params.sell_token,
            params.buy_token,
            params.sell_amount,
            params.taker,
            params.slippage_bps,
        )
    }

    pub fn get_asset(&self, id: &str) -> Result<&Asset, Error> {
        match self.hash_map_assets.get(id) {
            Some(asset) => Ok(asset),
            None => Err(Error::UnknownAsset(id.to_string())),
        }
    }

    pub fn native_asset(&self) -> Result<&Asset, Error> {
        self.assets
            .iter()
            .find(|asset| asset.kind == AssetKind::Native)
            .ok_or_else(|| {
                Error::ConfigurationError(String::from(
                    "no native asset configured",
                ))
            })
    }

    pub fn stable_asset(&self) -> Result<&Asset, Error> {
        self.get_asset(&self.stable_asset_id)
    }
}

pub fn get_configuration() -> Result<Config, Error> {
    let server_host =
        env::var("SERVER_HOST").unwrap_or_else(|_| String::from("0.0.0.0"));
    let port: u16 = env::var("PORT")
        .unwrap_or_else(|_| String::from("8080"))
        .parse()?;
    let allowed_origins = env::var("ALLOWED_ORIGINS")
        .unwrap_or_else(|_| String::from("*"))
        .split(',')
        .map(|item| item.to_string())
        .collect::<Vec<String>>();

    let rpc_url = env::var("RPC_URL")
        .unwrap_or_else(|_| String::from("https://mainnet.base.org"));
    let chain_id: u64 = env::var("CHAIN_ID")
        .unwrap_or_else(|_| String::from("8453"))
        .parse()?;

    let vault_private_key = env::var("VAULT_PRIVATE_KEY").ok();
    let vault_address =
        resolve_vault_address(vault_private_key.as_deref())?;

    let assets = get_assets()?;
    let mut hash_map_assets: HashMap<String, Asset> = HashMap::new();
    for asset in &assets {
        hash_map_assets.insert(asset.id.to_string(), asset.clone());
    }

    let stable_asset_id =
        env::var("STABLE_ASSET").unwrap_or_else(|_| String::from("usdc"));
    if !hash_map_assets.contains_key(&stable_asset_id) {
        return Err(Error::ConfigurationError(format!(
            "stable asset {} is not in the asset list",
            stable_asset_id
        )));
    }
    let proposal_id = env::var("PROPOSAL_ID")
        .unwrap_or_else(|_| String::from("allocation-main"));

    let required_deposit_minor_units = U256::from_str(
        &env::var("REQUIRED_DEPOSIT_WEI")
            .unwrap_or_else(|_| String::from("100000000000000")),
    )
    .map_err(|_| {
        Error::ConfigurationError(String::from(
            "REQUIRED_DEPOSIT_WEI is not an integer",
        ))
    })?;
    let required_confirmations: u64 = env::var("REQUIRED_CONFIRMATIONS")
        .unwrap_or_else(|_| String::from("1"))
        .parse()?;

    let rebalance_execute: bool = env::var("REBALANCE_EXECUTE")
        .unwrap_or_else(|_| String::from("false"))
        .parse()
        .unwrap_or(false);
    let settlement_execute: bool = env::var("SETTLEMENT_EXECUTE")
        .unwrap_or_else(|_| String::from("false"))
        .parse()
        .unwrap_or(false);

    if (rebalance_execute || settlement_execute)
        && vault_private_key.is_none()
    {
        return Err(Error::ConfigurationError(String::from(
            "execute mode requires VAULT_PRIVATE_KEY",
        )));
    }

    let slippage_bps: u32 = env::var("SLIPPAGE_BPS")
        .unwrap_or_else(|_| String::from("100"))
        .parse::<u32>()?
        .clamp(1, 500);
    let tolerance_percent: f64 = env::var("TOLERANCE_PERCENT")
        .unwrap_or_else(|_| String::from("1.0"))
        .parse()?;
    let min_usd_delta: u64 = env::var("MIN_USD_DELTA")
        .unwrap_or_else(|_| String::from("5"))
        .parse()?;
    let rebalance_history_limit: usize =
        env::var("REBALANCE_HISTORY_LIMIT")
            .unwrap_or_else(|_| String::from("20"))
            .parse()?;
    let settlement_max_age = duration_var("SETTLEMENT_MAX_AGE_SECONDS", 300)?;

    let spot_price_url = env::var("SPOT_PRICE_URL").unwrap_or_else(|_| {
        String::from("https://api.coinbase.com/v2/prices/$0/spot")
    });
    let aggregator_url = env::var("AGGREGATOR_URL")
        .unwrap_or_else(|_| String::from("https://api.0x.org"));
    let price_cache_ttl = duration_var("PRICE_CACHE_TTL_SECONDS", 60)?;

    let request_lock_ttl = duration_var("REQUEST_LOCK_TTL_SECONDS", 30)?;
    let worker_lock_ttl = duration_var("WORKER_LOCK_TTL_SECONDS", 120)?;
    let job_dedupe_ttl = duration_var("JOB_DEDUPE_TTL_SECONDS", 60)?;
    let job_max_age = duration_var("JOB_MAX_AGE_SECONDS", 300)?;

    let config = Config {
        server_host,
        port,
        allowed_origins,
        rpc_url,
        chain_id,
        vault_private_key,
        vault_address,
        assets,
        hash_map_assets,
        stable_asset_id,
        proposal_id,
        required_deposit_minor_units,
        required_confirmations,
        rebalance_execute,
        settlement_execute,
        slippage_bps,
        tolerance_percent,
        min_usd_delta,
        rebalance_history_limit,
        settlement_max_age,
        spot_price_url,
        aggregator_url,
        price_cache_ttl,
        request_lock_ttl,
        worker_lock_ttl,
        job_dedupe_ttl,
        job_max_age,
    };

    Ok(config)
}

/// Load `.env` from the crate directory into the process environment.
/// Absence is fine; deployments set real environment variables.
pub fn set_configuration() -> Result<(), Error> {
    let directory = env!("CARGO_MANIFEST_DIR");
    let path = format!("{}/.env", directory);

    if let Ok(config_string) = fs::read_to_string(path) {
        parse_config_string(config_string)?;
    }

    Ok(())
}

fn parse_config_string(config: String) -> Result<(), Error> {
    let params: Vec<Option<(&str, &str)>> = config
        .split('\n')
        .filter(|s| !s.trim_start().starts_with('#'))
        .map(|s| {
            let element = s.find('=');
            if let Some(e) = element {
                return Some(s.split_at(e));
            }
            None
        })
        .map(|value| {
            if let Some((k, v)) = value {
                return Some((k.trim(), &v[1..]));
            }
            None
        })
        .collect();

    for (key, value) in params.into_iter().flatten() {
        env::set_var(key, value.trim());
    }

    Ok(())
}

fn duration_var(name: &str, default_secs: u64) -> Result<Duration, Error> {
    let seconds: u64 = env::var(name)
        .unwrap_or_else(|_| default_secs.to_string())
        .parse()?;
    Ok(Duration::from_secs(seconds))
}

/// The vault address comes from the signing key; an explicit override
/// must match the derived address or the override wins with a warning.
fn resolve_vault_address(
    vault_private_key: Option<&str>,
) -> Result<Address, Error> {
    let derived = match vault_private_key {
        Some(key) => Some(
            PrivateKeySigner::from_str(key)
                .map_err(|_| {
                    Error::ConfigurationError(String::from(
                        "VAULT_PRIVATE_KEY is not a valid secp256k1 key",
                    ))
                })?
                .address(),
        ),
        None => None,
    };

    let explicit = match env::var("VAULT_ADDRESS") {
        Ok(value) => Some(Address::from_str(value.trim()).map_err(|_| {
            Error::ConfigurationError(String::from(
                "VAULT_ADDRESS is not a valid address",
            ))
        })?),
        Err(_) => None,
    };

    match (derived, explicit) {
        (Some(derived), Some(explicit)) => {
            if derived != explicit {
                warn!(
                    "vault address override {} does not match derived {}; using override",
                    explicit, derived
                );
            }
            Ok(explicit)
        },
        (Some(derived), None) => Ok(derived),
        (None, Some(explicit)) => Ok(explicit),
        (None, None) => Err(Error::ConfigurationError(String::from(
            "one of VAULT_PRIVATE_KEY or VAULT_ADDRESS is required",
        ))),
    }
}

/// Asset list from a tuple string:
/// `(id,kind,symbol,decimals,priceFeedId,address)`, address empty for
/// the native asset.
fn get_assets() -> Result<Vec<Asset>, Error> {
    let raw = env::var("ASSETS").unwrap_or_else(|_| {
        String::from(
            "(eth,native,ETH,18,ETH-USD,),\
             (usdc,token,USDC,6,USDC-USD,0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913)",
        )
    });

    let mut assets: Vec<Asset> = Vec::new();
    for tuple in parse_tuple_string(raw) {
        let items: Vec<&str> = tuple.split(',').collect();
        if items.len() != 6 {
            return Err(Error::ConfigurationError(format!(
                "asset tuple needs 6 fields: ({})",
                tuple
            )));
        }
        let kind = AssetKind::from_str(items[1].trim()).map_err(|_| {
            Error::ConfigurationError(format!(
                "asset kind must be native or token: {}",
                items[1]
            ))
        })?;
        let token_address = match kind {
            AssetKind::Native => None,
            AssetKind::Token => {
                Some(Address::from_str(items[5].trim()).map_err(|_| {
                    Error::ConfigurationError(format!(
                        "token asset {} needs a contract address",
                        items[0]
                    ))
                })?)
            },
        };
        assets.push(Asset {
            id: items[0].trim().to_owned(),
            kind,
            symbol: items[2].trim().to_owned(),
            decimals: items[3].trim().parse()?,
            price_feed_id: items[4].trim().to_owned(),
            token_address,
        });
    }

    let natives = assets
        .iter()
        .filter(|asset| asset.kind == AssetKind::Native)
        .count();
    if natives != 1 {
        return Err(Error::ConfigurationError(format!(
            "exactly one native asset required, found {}",
            natives
        )));
    }

    Ok(assets)
}

#[cfg(test)]
impl Config {
    /// Two-asset Base configuration used across handler tests.
    pub fn for_tests() -> Config {
        let assets = vec![
            Asset {
                id: String::from("eth"),
                kind: AssetKind::Native,
                symbol: String::from("ETH"),
                token_address: None,
                decimals: 18,
                price_feed_id: String::from("ETH-USD"),
            },
            Asset {
                id: String::from("usdc"),
                kind: AssetKind::Token,
                symbol: String::from("USDC"),
                token_address: Some(
                    Address::from_str(
                        "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
                    )
                    .unwrap(),
                ),
                decimals: 6,
                price_feed_id: String::from("USDC-USD"),
            },
        ];
        let mut hash_map_assets = HashMap::new();
        for asset in &assets {
            hash_map_assets.insert(asset.id.clone(), asset.clone());
        }
        Config {
            server_host: String::from("127.0.0.1"),
            port: 0,
            allowed_origins: vec![String::from("*")],
            rpc_url: String::from("http://127.0.0.1:8545"),
            chain_id: 8453,
            vault_private_key: None,
            vault_address: Address::from_str(
                "0x00000000000000000000000000000000000000aa",
            )
            .unwrap(),
            assets,
            hash_map_assets,
            stable_asset_id: String::from("usdc"),
            proposal_id: String::from("allocation-main"),
            required_deposit_minor_units: U256::from(
                100_000_000_000_000u128,
            ),
            required_confirmations: 1,
            rebalance_execute: true,
            settlement_execute: true,
            slippage_bps: 100,
            tolerance_percent: 1.0,
            min_usd_delta: 5,
            rebalance_history_limit: 20,
            settlement_max_age: Duration::from_secs(300),
            spot_price_url: String::from(
                "https://api.coinbase.com/v2/prices/$0/spot",
            ),
            aggregator_url: String::from("https://api.0x.org"),
            price_cache_ttl: Duration::from_secs(60),
            request_lock_ttl: Duration::from_secs(30),
            worker_lock_ttl: Duration::from_secs(120),
            job_dedupe_ttl: Duration::from_secs(60),
            job_max_age: Duration::from_secs(300),
        }
    }
}
