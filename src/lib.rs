//! edtriage: emergency department triage engine
//!
//! Classifies arriving patients into an Emergency Severity Index level,
//! keeps the treatment queue ordered as their condition and wait change,
//! and raises alerts for critical patients and an overloaded department.

pub mod alerts;
pub mod api;
pub mod config;
pub mod error;
pub mod history;
pub mod notify;
pub mod patient;
pub mod queue;
pub mod refresher;
pub mod service;
pub mod storage;
pub mod triage;

pub use error::{Result, TriageError};
pub use service::TriageService;
