//! Core library for the work-integrated-learning placement engine:
//! capacity-controlled enrollment, verified attendance sessions, and monthly
//! stipend classification, plus the HTTP router the API service mounts.

pub mod config;
pub mod error;
pub mod telemetry;
pub mod workflows;
