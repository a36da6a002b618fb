#[macro_use]
extern crate log;

pub mod batch;
pub mod model;
