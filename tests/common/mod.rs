#![allow(dead_code)]

pub mod builders;
pub mod executors;
pub mod strategies;

pub use builders::*;
pub use executors::*;
pub use strategies::*;
