//! Pure, deterministic logic. No filesystem or process access except the
//! read-only canonicalization in `path`.

pub mod ledger;
pub mod path;
pub mod policy;
pub mod security;
pub mod types;
