pub mod fallback;
pub mod status;
pub mod usage;
