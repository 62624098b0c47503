// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Parley Core - Assistant Request Runtime
//!
//! This crate processes voice/chat assistant protocol messages. Each message
//! loads the state of one user from a key-value store, runs a scenario that
//! produces zero or more commands, saves the updated state with optimistic
//! concurrency and sends the composed replies back over the transport the
//! message arrived on.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │   HTTP clients           │        │   Kafka topics           │
//! │   (server::http)         │        │   (transport::kafka)     │
//! └──────────────────────────┘        └──────────────────────────┘
//!              │ 200/204/400/500                   │ keyed records
//!              ▼                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Pipeline                                 │
//! │  parse → validate → load → scenario → save (CAS) → compose       │
//! │                       ▲                     │                    │
//! │                       └──── collision ──────┘                    │
//! └─────────────────────────────────────────────────────────────────┘
//!              │                                   │
//!              ▼                                   ▼
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │   Adapter                │        │   Scenario               │
//! │   memory | replicated    │        │   (user code)            │
//! └──────────────────────────┘        └──────────────────────────┘
//! ```
//!
//! # Request outcomes
//!
//! | Outcome | HTTP | Kafka |
//! |---------|------|-------|
//! | One reply | 200 with the reply | one record |
//! | Several replies | 500 `BAD_ANSWER` | one record per reply |
//! | No reply | 204 `NOTHING_FOUND` | nothing |
//! | Malformed or invalid message | 400 `ERROR` | dropped, counted |
//! | Reply failed outgoing validation | 500 `BAD_ANSWER` | dropped, counted |
//!
//! # User state
//!
//! A user is keyed by `{userId}_{userChannel}`. The stored blob holds the
//! persistent [`variables::Variables`], the per-message
//! [`variables::MidVariables`] and scenario-owned data. Saves compare the
//! stored blob against the one read at load time; a mismatch reloads the user
//! and runs the scenario again, up to `user_save_collisions_tries` attempts.
//!
//! # Configuration
//!
//! Process settings come from `PARLEY_*` environment variables, scenario-facing
//! settings from the `template_settings` object of the JSON file named by
//! `PARLEY_SETTINGS_PATH`. See [`config`].

pub mod adapters;
pub mod clock;
pub mod config;
pub mod error;
pub mod frame;
pub mod masking;
pub mod message;
pub mod metrics;
pub mod outgoing;
pub mod pipeline;
pub mod runtime;
pub mod scenario;
pub mod server;
pub mod stats;
pub mod transport;
pub mod user;
pub mod variables;

pub use error::{Error, Result};
