use std::marker::{self, PhantomData};

use crate::provider::KvHandle;

/// Typed accessor over the shared key-value driver handle. Each entity
/// gets its operations through an `impl Store<Entity>` block in `dao`.
#[derive(Debug)]
pub struct Store<T> {
    pub kv: KvHandle,
    _phantomdata: marker::PhantomData<T>,
}

impl<T> Store<T> {
    pub fn new(kv: KvHandle) -> Self {
        Store {
            kv,
            _phantomdata: PhantomData,
        }
    }
}
