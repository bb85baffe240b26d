#![forbid(unsafe_code)]

pub mod anki;
pub mod chunk;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod formats;
pub mod logging;
pub mod normalize;
pub mod openai;
pub mod pipeline;
pub mod review;
pub mod store;
pub mod sync;
pub mod synthesize;
