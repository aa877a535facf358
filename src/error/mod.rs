//! Error handling module for the data layer.
//!
//! This module provides:
//! - The crate-wide [`DataLayerError`] type and [`Result`] alias
//! - [`RethrownError`], which wraps failures from a partition cursor together
//!   with the collections, databases and query that were being read
//! - Structured information extraction from MongoDB driver errors
//!
//! # Example
//!
//! ```rust,no_run
//! use fhir_datalayer::error::DataLayerError;
//! use fhir_datalayer::error::mongo::extract_error_info;
//!
//! fn handle_error(err: &DataLayerError) {
//!     if let DataLayerError::Rethrown(rethrown) = err {
//!         eprintln!("failed reading {:?}", rethrown.collections);
//!     }
//! }
//!
//! fn describe(err: &mongodb::error::Error) {
//!     let info = extract_error_info(err);
//!     println!("{}", info.to_json().unwrap_or_default());
//! }
//! ```

pub mod kinds;
pub mod mongo;

pub use kinds::{ConfigError, ConnectionError, DataLayerError, Result, RethrownError, ValidationError};
pub use mongo::{ErrorDetails, ErrorInfo};
