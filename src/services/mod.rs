//! Service layer: business operations and external collaborators

pub mod bids;
pub mod booking;
pub mod broadcast;
pub mod cache;
pub mod codec;
pub mod events;
pub mod notifications;
pub mod payments;
pub mod rides;
pub mod settlement;
pub mod vendor;
