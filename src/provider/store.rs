use crate::{
    dao::OperationLock,
    model::{
        AllocationVote, Job, PriceSnapshot, RebalanceOutcome,
        SettlementStatus, Store, UserStats,
    },
    provider::KvHandle,
};

/// Every typed store over the one shared driver handle, constructed
/// once at startup and injected through `State`.
#[derive(Debug)]
pub struct StorePool {
    pub deposits: Store<UserStats>,
    pub votes: Store<AllocationVote>,
    pub queue: Store<Job>,
    pub locks: Store<OperationLock>,
    pub prices: Store<PriceSnapshot>,
    pub settlements: Store<SettlementStatus>,
    pub rebalances: Store<RebalanceOutcome>,
    pub kv: KvHandle,
}

impl StorePool {
    pub fn new(kv: KvHandle) -> StorePool {
        StorePool {
            deposits: Store::new(kv.clone()),
            votes: Store::new(kv.clone()),
            queue: Store::new(kv.clone()),
            locks: Store::new(kv.clone()),
            prices: Store::new(kv.clone()),
            settlements: Store::new(kv.clone()),
            rebalances: Store::new(kv.clone()),
            kv,
        }
    }
}
