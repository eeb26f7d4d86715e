//! Leader lifecycle for the ChronoGrid metadata service.
//!
//! Each replica runs a `Member` that campaigns for a leader key on the
//! KV backend using a TTL lease, and a `LeaderWatcher` that drives the
//! election so the elected meta-leader always coincides with the
//! consensus backend's own leader. Leadership is published over a
//! `watch` channel consumed by the service layer.
//!
//! - **`lease`** — granted lease with a background keep-alive loop
//! - **`member`** — one replica: campaign, reset, observe the leader key
//! - **`watch_leader`** — the election state machine

pub mod error;
pub mod lease;
pub mod member;
pub mod watch_leader;

pub use error::{MemberError, MemberResult};
pub use lease::Lease;
pub use member::{LeaderResponse, LeadershipState, Member, MemberDescriptor};
pub use watch_leader::{ElectionContext, LeaderWatcher};
