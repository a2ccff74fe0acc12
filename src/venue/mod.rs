//! Venue client implementations

pub mod simulated;

pub use simulated::SimulatedVenue;
