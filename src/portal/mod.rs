pub mod client;
pub mod envelope;
pub mod error;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;
