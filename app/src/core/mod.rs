pub mod poll;
pub mod resilience;
pub mod unit;
