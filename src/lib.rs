//! Notion-backed task reminder core.
//!
//! Links a Notion workspace through a browser-delegated OAuth handshake that
//! rendezvous over a one-time relay, keeps the resulting credential, and
//! mirrors the task database into an optimistic local list.

pub mod app;
pub mod broadcast;
pub mod config;
pub mod credential;
pub mod handshake;
pub mod integrations;
pub mod logging;
pub mod models;
pub mod relay;
pub mod runtime;
pub mod sync;
pub mod task_store;

#[cfg(test)]
pub(crate) mod testing;
