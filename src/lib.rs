//! # sitechat
//!
//! A retrieval-augmented chat agent for websites. Visitors ask questions
//! in a widget; the agent answers from a private knowledge base, business
//! facts, and the page they are on, and hands the conversation to a human
//! when asked.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────────┐
//! │  Uploads   │──▶│  Ingestion   │──▶│    SQLite     │
//! │ PDF/DOCX/… │   │ Chunk+Embed  │   │  FTS5 + Vec   │
//! └────────────┘   └──────────────┘   └───────┬───────┘
//!                                             │ Retriever
//!                  ┌──────────────┐   ┌───────▼───────┐
//!   widget ──────▶ │ ChatService  │──▶│     Agent     │──▶ OpenAI / Anthropic
//!  (HTTP/SSE)      │ limits, log  │   │ route → tools │
//!                  └──────────────┘   │ → synthesize  │
//!                                     └───────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! sitechat init                         # create database
//! sitechat kb import ./docs             # ingest documents
//! sitechat search "return policy"
//! sitechat chat "Do you ship to Canada?"
//! sitechat serve                        # widget endpoints on [server].bind
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Conversations, messages, files, chunks, embeddings |
//! | [`error`] | Chat and ingestion error types |
//! | [`store`] | Persistence trait with SQLite and in-memory backends |
//! | [`blob`] | Uploaded document bytes |
//! | [`provider`] | Vendor-neutral chat, streaming, and embeddings |
//! | [`tools`] | Tool registry and built-in tools |
//! | [`extract`] | PDF, DOCX, and HTML text extraction |
//! | [`chunk`] | Paragraph/sentence chunking |
//! | [`embedding`] | Batched embedding with retry, vector math |
//! | [`ingest`] | Ingestion pipeline |
//! | [`retrieval`] | Vector search with keyword fallback |
//! | [`agent`] | Two-phase routing and synthesis |
//! | [`chat`] | Send, stream, widget config, escalation contact |
//! | [`widget`] | Widget configuration view and page rules |
//! | [`app`] | Component wiring |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod agent;
pub mod app;
pub mod blob;
pub mod chat;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod provider;
pub mod retrieval;
pub mod server;
pub mod store;
pub mod tools;
pub mod widget;

#[cfg(test)]
mod testing;
