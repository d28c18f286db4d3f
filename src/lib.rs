//! # Reprise
//!
//! An asset continuity engine for recurring archive photos.
//!
//! Reprise ingests scanned photographs into threads, normalizes each image
//! into a canonical rendition, fingerprints it twice (SHA-256 of the
//! normalized bytes, plus a 64-bit DCT perceptual hash), and answers
//! continuity queries: every other thread where the same photo, or a
//! visually near-identical one, appears, ordered oldest first.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────┐
//! │   Upload     │──▶│ Fingerprint  │──▶│  SQLite   │
//! │ (CLI / HTTP) │   │ SHA256+pHash │   │ + media/  │
//! └──────────────┘   └──────────────┘   └────┬──────┘
//!                                            │ rebuild
//!                      ┌─────────────────────┤
//!                      ▼                     ▼
//!                 ┌──────────┐        ┌────────────┐
//!                 │ Resolver │◀───────│ Continuity │
//!                 │ (chains) │        │   Index    │
//!                 └──────────┘        └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rpr init                          # create database
//! rpr thread new --title "Kornmarkt, market day" --year 1925
//! rpr post <thread-id> --author otto --image scan1.jpg
//! rpr continuity <thread-id>        # where else does this photo appear?
//! rpr verify                        # sweep database and media root
//! rpr serve                         # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`phash`] | 64-bit DCT perceptual hashing |
//! | [`fingerprint`] | Image normalization and fingerprint extraction |
//! | [`store`] | SQLite thread/post/asset store |
//! | [`index`] | In-memory continuity index (exact + near lookup) |
//! | [`media`] | Content-addressed rendition storage |
//! | [`continuity`] | Cross-thread chain resolution |
//! | [`engine`] | Coordinating engine and error taxonomy |
//! | [`server`] | JSON/multipart HTTP server |
//! | [`verify`] | Integrity sweep |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod continuity;
pub mod db;
pub mod engine;
pub mod fingerprint;
pub mod index;
pub mod media;
pub mod migrate;
pub mod models;
pub mod phash;
pub mod server;
pub mod store;
pub mod verify;
