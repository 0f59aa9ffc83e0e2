//! Multi-server memcached binary-protocol client.
//!
//! Keys route to servers by consistent hashing; each server gets a bounded
//! pool of persistent connections. Requests are pipelined per connection
//! and correlated positionally: the i-th response frame on a connection
//! belongs to the i-th queued request, with quiet (no-reply-on-success)
//! commands inferred from the next replying response. A health monitor
//! quarantines failing servers and folds them back in once they answer
//! probes again.
//!
//! ```no_run
//! use memclient::{MemcachedClient, ServerAddress};
//!
//! # async fn demo() {
//! let client = MemcachedClient::builder("user-cache")
//!     .servers([ServerAddress::new("cache1", 11211), ServerAddress::new("cache2", 11211)])
//!     .build()
//!     .await;
//!
//! client.set("name", &"foo".to_string(), 300, false).await;
//! let value: Option<String> = client.get("name").await;
//! # let _ = value;
//! # }
//! ```

mod codec;
mod connection;
mod hash_ring;
mod health;
mod inflight;

pub mod client;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod server_list;
pub mod value;

pub use client::{Builder, MemcachedClient};
pub use error::Error;
pub use protocol::{Opcode, Status};
pub use server_list::{
    format_server_list, parse_server_list, CacheServerListListener, ServerAddress,
    ServerListListener,
};
pub use value::{CacheValue, ValueWithCas, FLAG_NUMERIC, FLAG_RAW, FLAG_UTF8};
