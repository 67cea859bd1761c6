mod data;
mod entry;
mod handle;
mod interval;
mod keys;
mod memory;

pub use data::{global, http_date, init_global, parse_http_date, CacheData, CacheHealth, WriteParams};
pub use entry::{Body, CacheInfo, CacheRecord, CacheView, CachedData, Classification};
pub use handle::{Cache, DataSource, GatewayResponse};
pub use interval::{next_boundary, utc_offset_minutes};
pub use keys::KeyHasher;
pub use memory::{MemCacheInfo, MemLookup, MemoryCache};
