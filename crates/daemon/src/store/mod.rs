// Persistence: per-entity JSON indexes, the generic durable store, and the
// typed stores layered on it.

pub mod durable;
pub mod hash;
pub mod index;
pub mod settings;
pub mod work;

pub use durable::{Absorb, ChangeListener, DurableStore, Snapshot};
pub use index::{IndexFile, LoadedIndex};
pub use settings::FileSettingsStore;
pub use work::WorkStore;
