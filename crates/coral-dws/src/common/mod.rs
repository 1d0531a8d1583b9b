pub use wrapped::WrappedRcRefCell;

pub type Map<K, V> = hashbrown::HashMap<K, V>;
pub type Set<T> = hashbrown::HashSet<T>;

pub mod backoff;
pub mod config;
pub mod error;
pub mod hostlist;
pub mod ids;
pub mod rpc;
pub mod setup;
mod wrapped;
