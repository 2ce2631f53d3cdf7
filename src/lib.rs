//! A persistent, client-side cache of remote-object revisions.
//!
//! Two alternating append-only segment files hold the records; an
//! in-memory index maps each object id to a signed byte offset, the sign
//! carrying which segment the record lives in. The cache owns no network
//! or session logic; it is consumed by a caller that drives the RPC
//! layer, reacts to invalidation callbacks, and supplies its own logger
//! sink via `tracing`.
//!
//! ```no_run
//! use objcache::{Cache, CacheConfig};
//!
//! # fn main() -> objcache::Result<()> {
//! let cache = Cache::new(CacheConfig::new("prod").with_client_tag("client-42"))?;
//! let entries = cache.open()?;
//! cache.verify(|oid, serial, vserial| {
//!     let _ = (oid, serial, vserial);
//! });
//! let _ = entries;
//! # Ok(())
//! # }
//! ```

mod cache;
mod error;
mod paths;
mod record;
mod scanner;
mod segment;

pub use cache::{Cache, CacheConfig, DEFAULT_TOTAL_SIZE_BYTES};
pub use error::{CacheError, Result};
pub use paths::{CLIENT_HOME_VAR, INSTANCE_HOME_VAR};
pub use record::{Oid, Serial};
