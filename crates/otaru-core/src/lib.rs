pub mod cachedblobstore;
pub mod chunkstore;
pub mod clock;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod statesnapshot;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
