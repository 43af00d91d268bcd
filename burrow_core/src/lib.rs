pub mod error;
pub mod frame;
pub mod policy;
pub mod target;
pub mod utils;
