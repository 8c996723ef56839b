//! Router Module
//!
//! A router owns one key range on this host and answers GET, PUT and LIST
//! for it. Requests for keys it does not own go back to the connection
//! manager, which relays them to the owner.
//!
//! ## Request Flow
//! ```text
//!  inbound channel ──▶ worker ──▶ validate ──▶ owns key?
//!                                               │yes          │no
//!                                               ▼             ▼
//!                                         cache / store   directory lookup
//!                                               │          (refresh once)
//!                                               ▼             │
//!                                            reply       forward via manager
//! ```
//!
//! ## Locking
//! One `RwLock<()>` per router: PUTs and range changes take the write
//! side, GETs and LISTs the read side. Routers share no locks.

mod envelope;
mod gate;
#[allow(clippy::module_inception)]
mod router;

pub use envelope::{CancelToken, Envelope};
pub use router::{Claim, Router, RouterDeps, RouterOptions};

pub(crate) use gate::Queued;
