//! Core infrastructure shared across the Overpass API client crates.
//!
//! This crate provides:
//! - [`clock`]: a monotonic time source that tests can substitute with a virtual clock
//! - [`events`]: a minimal observability event system used by the runner and client

pub mod clock;
pub mod events;

pub use clock::{Clock, MockClock, SystemClock};
pub use events::{ClientEvent, EventListener, EventListeners, FnListener};
