#[macro_use]
extern crate log;

pub mod kernel;
pub mod system;
