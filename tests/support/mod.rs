#![allow(dead_code)]

mod harness;
mod proxy_client;
mod upstream;

pub use harness::*;
pub use proxy_client::*;
pub use upstream::*;
