//! A concurrent in-memory learned index.
//!
//! Keys are routed to leaves by linear models instead of comparison trees: a
//! sparse three-tier root directory and learned inner nodes predict the slot
//! of a key to within a bounded probe, and each leaf keeps its records in
//! one of two layouts. The *write-optimized* layout is a log of sorted
//! pieces absorbing appends; the *read-optimized* layout places records in
//! model-addressed buckets. Every leaf tracks its recent read/write mix in a
//! rolling window and migrates live between the two layouts when the mix
//! flips, without ever blocking readers.
//!
//! Readers are optimistic throughout: they validate versioned locks instead
//! of taking them, and displaced node bodies are reclaimed through a
//! three-epoch ring once no reader can still observe them.
//!
//! ```
//! use adaptree::{Adaptree, Index, Record};
//!
//! let records: Vec<Record> = (1..=1000u64).map(|k| Record::new(k, k * 2)).collect();
//! let tree = Adaptree::with_records(&records, Default::default()).unwrap();
//!
//! assert_eq!(tree.lookup(500), Some(1000));
//! tree.insert(1001, 7);
//! assert!(tree.remove(1));
//! assert_eq!(tree.scan(999, 3).len(), 3);
//! ```

mod config;
mod model;
mod morph;
mod record;
mod sync;
mod tree;

pub use config::{ConfigError, TreeOptions};
pub use model::FitError;
pub use record::{Key, Record, Value, KEY_MAX, KEY_MIN, NO_VALUE};
pub use tree::{Adaptree, BuildError, Index};

#[cfg(feature = "internal-api")]
pub use tree::{Layout, TreeInfo};
