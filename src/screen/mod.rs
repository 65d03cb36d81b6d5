//! Variable screening and the pooling resolver.

mod pooling;
mod rules;

pub use pooling::{
    normalize_base_name, resolve_pools, PoolCatalog, PoolGroup, PoolMember, ScreenOutcome,
    SynonymTable,
};
pub use rules::{screen_variable, AllowList, ScreenReason, ScreeningDecision};
