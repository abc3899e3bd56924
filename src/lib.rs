//! # Personal knowledge base
//!
//! Stores files, extracts and indexes their text, organizes them with tags
//! and projects, tracks time on a calendar, and answers questions about all
//! of it through an LLM chat.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌────────────────┐
//! │  upload  │──▶│   storage    │──▶│  SQLite + FTS5 │
//! │ CLI/HTTP │   │ extract+index│   │ files, tags,   │
//! └──────────┘   └──────┬───────┘   │ projects, ...  │
//!                       │ tasks     └───────▲────────┘
//!                       ▼                   │
//!        ┌────────────────────────────────┐ │
//!        │ one worker per kind            │─┘
//!        │ ocr · transcription ·          │
//!        │ summarization · chat           │──▶ task events (SSE)
//!        └────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! pkb init
//! pkb add ~/scans/receipt.png --folder finance --depth deep
//! pkb serve                       # HTTP API + workers
//! pkb search receipt --tag finance
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`storage`] | Uploads, imports and deletion of stored bytes |
//! | [`extract`] | Local text extraction by file type |
//! | [`index`] | Indexing at a depth and the FTS table |
//! | [`search`] | Full-text search with filters |
//! | [`tags`], [`projects`] | Organizing files |
//! | [`calendar`] | Activities, timer and time reports |
//! | [`tasks`] | Persisted single-worker task queues |
//! | [`workers`] | The four queues and their services |
//! | [`ocr`], [`transcription`], [`summarize`], [`chat`] | Task handlers |
//! | [`llm`] | Chat-completion client |
//! | [`server`] | HTTP API |
//! | [`cli`] | `pkb` command implementations |

pub mod app;
pub mod calendar;
pub mod chat;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod files;
pub mod index;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod ocr;
pub mod progress;
pub mod projects;
pub mod search;
pub mod server;
pub mod storage;
pub mod summarize;
pub mod tags;
pub mod tasks;
pub mod transcription;
pub mod workers;
