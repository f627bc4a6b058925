//! # dispersy-engine
//!
//! Runtime for the Dispersy decentralized message synchronization engine.
//!
//! Peers join communities identified by the hash of a master key, exchange
//! signed messages and converge on a shared log by advertising bloom filters
//! of what they hold. Messages that arrive before their prerequisites are
//! parked and replayed once the missing identity, proof or sequence number
//! shows up.
//!
//! ## Features
//!
//! - **Cooperative Scheduler**: one worker thread runs every callback, ordered by deadline and priority
//! - **Bloom Sync**: global-time buckets advertised to random candidates
//! - **Permission Timeline**: authorize and revoke with proof requests for missing grants
//! - **Delayed Packets**: automatic requests for missing members, proofs and sequence numbers
//! - **Multi-member Messages**: co-signatures collected with a timeout
//!
//! ## Example
//!
//! ```ignore
//! use dispersy_engine::{Dispersy, EngineConfig, MemoryDatabase, MockTransport};
//!
//! let dispersy = Dispersy::new(
//!     EngineConfig::default(),
//!     Arc::new(MemoryDatabase::new()),
//!     Arc::new(MockTransport::new()),
//! );
//! dispersy.start()?;
//! let community = dispersy.create_community(&me, define)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod community;
pub mod config;
mod dispersy;
pub mod error;
pub mod identity;
pub mod logging;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use community::{Community, SignatureCallback, Verdict};
pub use config::{
    ConfigError, DelayConfig, EngineConfig, SchedulerConfig, SignatureConfig, SyncConfig,
};
pub use dispersy::{CommunityHandle, Dispersy, SYNC_TASK};
pub use error::{DispersyError, Result, SchedulerError, StoreError, TaskError};
pub use identity::MemberCache;
pub use scheduler::{Priority, Resumable, Scheduler, SchedulerState, Step, Task, TaskId};
pub use store::{Candidate, CommunityRow, Database, MemoryDatabase, StoredMessage};
pub use transport::{MockTransport, Transport, TransportError};
