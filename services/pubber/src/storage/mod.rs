pub mod persistent;

pub use persistent::{PersistentStore, StoreError};
