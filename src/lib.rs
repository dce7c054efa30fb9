//! Import encrypted group databases from a chat client's local storage and
//! analyse the resulting membership graph per account.

pub mod cipher;
pub mod config;
pub mod db;
pub mod error;
pub mod etl;
pub mod header;
pub mod key;
mod migrations;
pub mod pipeline;
pub mod queries;
pub mod store;

pub use cipher::{CipherParams, DecryptBackend, Decryptor};
pub use config::{load_config, Config};
pub use error::{ErrorReport, PipelineError};
pub use etl::{ImportPayload, LoadReport};
pub use header::strip_header;
pub use key::derive_key;
pub use pipeline::{import_structured, run_import, ImportOutcome, ImportRequest, Stage};
pub use queries::QueryEngine;
pub use store::{AccountStore, AccountSummary};
