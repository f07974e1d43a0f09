pub use self::kv::lock::{LockOperation, OperationLock};
pub use self::kv::queue::JobHandle;

pub mod kv;
