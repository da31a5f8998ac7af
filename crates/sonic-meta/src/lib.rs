pub mod etcd;
pub mod memory;
pub mod types;

pub use etcd::EtcdMetaStore;
pub use memory::MemoryMetaStore;
pub use types::{get_json, put_json, CreateOutcome, MetaStore};
