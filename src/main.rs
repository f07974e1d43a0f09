use tracing::{error, info, Level};

use wagmi_treasury::{
    configuration::{
        get_configuration, set_configuration, AppState, State,
    },
    error::Error,
    handler::worker,
    provider::{self, MemoryKv, StorePool, HTTP},
    server,
};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let result = app_main().await;

    if let Err(err) = &result {
        error!("{}", err);
    }

    result
}

async fn app_main() -> Result<(), Error> {
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_level(true)
        .with_max_level(Level::INFO)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    set_configuration()?;
    let config = get_configuration()?;
    info!(
        "vault {} on chain {}, rebalance execute {}, settlement execute {}",
        config.vault_address,
        config.chain_id,
        config.rebalance_execute,
        config.settlement_execute,
    );

    let store = StorePool::new(MemoryKv::handle());
    let evm = provider::connect(&config)?;
    let http = HTTP::new(config.clone());
    let state = State::new(config, store, evm, http);
    let app_state = AppState::new(state);

    let (_, _) = tokio::try_join!(
        worker::worker_task(app_state.clone()),
        server::server_task(&app_state),
    )?;

    Ok(())
}
