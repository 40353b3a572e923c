//! Client driver for the Quarry database.
//!
//! Quarry speaks a length-prefixed binary protocol over TCP. This crate
//! implements the client side of it:
//! - `buffer`: bit-exact framing of wire messages
//! - `protocol`: message encoding/decoding
//! - `scram`: SCRAM-SHA-256 authentication
//! - `descriptor` / `codec` / `value`: type-descriptor negotiation and the
//!   value codecs built from it, cached process-wide by descriptor id
//! - `statement`: per-connection prepared-plan cache
//! - `connection`: the connection state machine
//! - `pool`: bounded connection pool and the transactional retry engine
//!
//! # Example
//!
//! ```no_run
//! use quarry::{connect, Context, Options};
//!
//! # async fn example() -> quarry::Result<()> {
//! let ctx = Context::background();
//! let pool = connect(&ctx, Options::default()).await?;
//!
//! let mut greeting = String::new();
//! pool.query_one(&ctx, "SELECT 'hello'", &mut greeting, &[]).await?;
//!
//! pool.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod codec;
pub mod connection;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod scram;
pub mod statement;
pub mod value;


pub use codec::{Codec, CodecRegistry, ScalarKind, Shape, ShapePlan};
pub use context::Context;
pub use descriptor::{Descriptor, DescriptorId};
pub use error::{Error, ErrorCode, Result};
pub use pool::{connect, Options, Pool, PoolConn, Tx, DEFAULT_MAX_CONNS, DEFAULT_MIN_CONNS};
pub use protocol::Cardinality;
pub use value::{BigInt, FromValue, IntoValue, ObjectField, RangeValue, Value};
