pub mod adapter;
pub mod errors;
pub mod estimate;
pub mod events;
pub mod ids;
pub mod workflow;
