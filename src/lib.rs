pub mod auth;
pub mod config;
pub mod playback;
pub mod provider;
pub mod server;
pub mod session;
pub mod share;

#[cfg(test)]
mod test_util;
