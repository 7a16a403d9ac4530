//! Stock analysis orchestrator
//!
//! A single coordinator drives each conversation thread through routing,
//! parallel specialist analysis, trade proposal, human approval and order
//! execution, streaming typed events to the caller and checkpointing the
//! thread after every stage transition.
//!
//! PIPELINE:
//! INPUT → SCOPE → ROUTE → DISPATCH → PROPOSE → (suspend) → DECIDE → EXECUTE

pub mod agent;
pub mod api;
pub mod approval;
pub mod broker;
pub mod catalog;
pub mod classifier;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod execution;
pub mod gemini;
pub mod graph;
pub mod llm;
pub mod memory;
pub mod models;
pub mod planner;
pub mod specialist;
pub mod state;
pub mod tools;

pub use error::Result;
