//! Cluster Mode - hash slot routing
//!
//! - Slot table loaded from `CLUSTER SLOTS`, swapped in whole
//! - MOVED / ASK redirects and TRYAGAIN / CLUSTERDOWN backoff
//! - Replica selection for read-only commands

pub mod client;
pub mod redirect;
pub mod slot_table;

pub use client::ClusterClient;
pub use redirect::Redirect;
pub use slot_table::SlotTable;
