//! Routing metadata: chunk layouts, the authority that owns them, the
//! router-side cache, and shard targeting.

pub mod authority;
pub mod cache;
pub mod chunk;
pub mod predicate;
pub mod resolver;
pub mod table;

pub use authority::{InMemoryMetadataAuthority, MetadataAuthority};
pub use cache::{RoutingCacheStats, RoutingLookup, RoutingTableCache};
pub use chunk::{ChunkRange, KeyBound, ShardKeyPattern};
pub use predicate::{KeyInterval, KeyPredicate, extract_key_predicate};
pub use resolver::ShardSetResolver;
pub use table::{CollectionRoutingInfo, ShardedLayout};
