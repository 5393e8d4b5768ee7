pub mod hash;
pub mod paths;
pub mod progress;
