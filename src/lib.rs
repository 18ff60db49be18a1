pub mod action;
pub mod artifact;
pub mod billing;
pub mod canary;
pub mod composition;
pub mod config;
pub mod error;
pub mod exports;
pub mod lockfile;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod service;
pub mod template;
pub mod validation;

pub use artifact::Artifact;
pub use composition::{Composition, compose};
pub use config::PipelineConfig;
pub use error::CompositionError;
pub use exports::{DeploymentLedger, EndpointValue, ExportName};
pub use pipeline::{PipelineComposer, StageHandle};
pub use service::ServiceDefinition;
pub use template::Template;
