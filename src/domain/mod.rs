//! Domain types and pure business rules.
//!
//! Entities, DTOs, the ride state machine, the pricing transform and the
//! reference registry. Nothing in here touches the database or the network.

pub mod bid;
pub mod events;
pub mod money;
pub mod refs;
pub mod ride;
pub mod settlement;
