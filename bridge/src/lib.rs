//! Native-handle bridge for a moving collector.
//!
//! Guest values live in a copying heap and move on every collection. Native
//! extension code instead holds [`NativeHandle`]s: stable, reference counted
//! records that the runtime keeps pointing at the current copy. Runtime code
//! in Rust keeps its own temporaries alive with [`RootFrame`]s.

pub mod capi;
mod error;
mod handles;
mod identity;
mod roots;
mod runtime;
mod settings;
pub mod workload;

pub use error::{Error, Result};
pub use handles::{
    HANDLE_CHUNK_SIZE, HANDLE_QUARANTINE, HandleFlags, HandleStats, HandleTable, NativeBuffer,
    NativeHandle,
};
pub use identity::IdentityTable;
pub use roots::{ROOT_CHUNK_CAPACITY, Root, RootFrame, RootStack};
pub use runtime::{Runtime, SharedRuntime};
pub use settings::RuntimeSettings;

pub use heap::{GcStats, HeapSettings};
pub use num_bigint::BigInt;
pub use object::{Cell, CellKind};
