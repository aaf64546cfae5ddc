pub mod anchor;
pub mod collapse;
pub mod config;
pub mod crypto;
pub mod error;
pub mod evidence;
pub mod guard;
pub mod pipeline;
pub mod server;
pub mod snapshot;
pub mod state;
pub mod storage;
pub mod trigger;

#[cfg(test)]
mod testing;
