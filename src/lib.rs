//! # codex-lb
//!
//! A reverse-proxy load balancer that fronts a pool of Codex/ChatGPT
//! backend accounts, selecting among them per request and failing over on
//! rate limits, quota exhaustion, and auth errors.
//!
//! ## Modules
//! - `account`: account records and the durable accounts store
//! - `usage`: per-account usage history
//! - `sticky`: session affinity (in-memory or DB-backed)
//! - `token`: OAuth refresh with per-account locking
//! - `mark`: in-memory runtime account state and cooldown tracking
//! - `snapshot`: cached, generation-invalidated selection snapshots
//! - `selection`: the account selection strategies
//! - `logs`: buffered request logging
//! - `usage_refresh`: background usage-polling loop
//! - `reconciler`: converges stale blocked accounts back to active
//! - `proxy`: the request pipeline and its `AppState`
//! - `debug`: the `/debug/lb/*` and `/api/*` operator surface
//! - `app`: process assembly and the server lifecycle
//! - `cli`: the `codex-lb` command-line surface

pub mod account;
pub mod app;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod debug;
pub mod error;
pub mod logs;
pub mod mark;
pub mod proxy;
pub mod reconciler;
pub mod selection;
pub mod settings;
pub mod snapshot;
pub mod sticky;
pub mod token;
pub mod usage;
pub mod usage_refresh;

pub use config::Config;
