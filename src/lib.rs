//! Contract Mock
//!
//! An API virtualization and contract-testing engine. Service
//! specifications are imported into one canonical model of services,
//! operations and recorded exchanges, which is then used both to answer
//! mock requests and to replay recorded requests against real endpoints.
//!
//! # Features
//!
//! - **Spec Import**: AsyncAPI and OpenAPI 3 documents, JSON or YAML
//! - **Dispatching**: URI parts, query args, JSON body and header based exchange selection
//! - **Dynamic Responses**: `{{ }}` expressions with request accessors and functions
//! - **Contract Testing**: HTTP and SOAP runners with cancellation and retries
//!
//! # Example
//!
//! ```yaml
//! asyncapi: 2.0.0
//! info:
//!   title: User signed-up API
//!   version: 0.1.1
//! channels:
//!   user/signedup:
//!     subscribe:
//!       message:
//!         payload:
//!           type: object
//!         examples:
//!           - name: laurent
//!             payload: {"fullName": "Laurent Broudoux"}
//! ```

pub mod config;
pub mod dispatch;
pub mod importer;
pub mod model;
pub mod runner;
pub mod server;
pub mod store;
pub mod template;
pub mod uri;

pub use config::EngineConfig;
pub use dispatch::{DispatchEngine, MatchOutcome, RuntimeRequest};
pub use importer::{import_document, ImportError, ImportOutcome};
pub use runner::{HttpTransport, RunnerRegistry, TestExecutor, TestRequest};
pub use server::{MockServer, ServeOutcome};
pub use store::{InMemoryServiceStore, ServiceRepository};
pub use template::TemplateEngine;
