#![forbid(unsafe_code)]

//! Video delivery for the feeds backend: on-demand adaptive downloads with
//! progress reporting, a TTL cache of finished files, and a range-aware
//! stream proxy.

pub mod broadcast;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod progress;
pub mod proxy;
pub mod quality;
pub mod ytdlp;
