use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CompositionError, Result};
use crate::template::get_artifact_att;

/// Named handle to a blob produced by one action and consumed by others.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Artifact {
    name: String,
}

impl Artifact {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A file inside this artifact, e.g. a template emitted by a build.
    pub fn at_path(&self, file: impl Into<String>) -> ArtifactPath {
        ArtifactPath {
            artifact: self.clone(),
            file: file.into(),
        }
    }

    /// Storage location, only known once the pipeline runs. Rendered as
    /// artifact attributes, never as a concrete bucket/key.
    pub fn location(&self) -> ArtifactLocation {
        ArtifactLocation {
            artifact: self.clone(),
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPath {
    pub artifact: Artifact,
    pub file: String,
}

impl ArtifactPath {
    /// `Artifact::file` notation used by the deploy action configuration.
    pub fn render(&self) -> String {
        format!("{}::{}", self.artifact.name(), self.file)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationAttribute {
    BucketName,
    ObjectKey,
}

impl LocationAttribute {
    pub fn as_str(self) -> &'static str {
        match self {
            LocationAttribute::BucketName => "BucketName",
            LocationAttribute::ObjectKey => "ObjectKey",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLocation {
    pub artifact: Artifact,
}

impl ArtifactLocation {
    pub fn attribute(&self, attribute: LocationAttribute) -> Value {
        get_artifact_att(self.artifact.name(), attribute.as_str())
    }
}

/// Where an artifact was produced: stage position and run-order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Producer {
    pub stage: usize,
    pub action: String,
    pub run_order: u32,
}

/// Tracks which action produced each artifact so consumers can be checked
/// against the produce-before-consume rule.
#[derive(Debug, Clone, Default)]
pub struct ArtifactRegistry {
    producers: HashMap<String, Producer>,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn producer(&self, artifact: &Artifact) -> Option<&Producer> {
        self.producers.get(artifact.name())
    }

    pub fn is_produced(&self, artifact: &Artifact) -> bool {
        self.producers.contains_key(artifact.name())
    }

    pub fn check_output(&self, artifact: &Artifact) -> Result<()> {
        if self.is_produced(artifact) {
            return Err(CompositionError::duplicate("artifact", artifact.name()));
        }
        Ok(())
    }

    /// A consumer at `(stage, run_order)` may only read artifacts produced in
    /// an earlier stage, or earlier in the run-order of the same stage.
    pub fn check_input(
        &self,
        artifact: &Artifact,
        consumer: &str,
        stage: usize,
        run_order: u32,
    ) -> Result<()> {
        let visible = self.producer(artifact).is_some_and(|producer| {
            producer.stage < stage || (producer.stage == stage && producer.run_order < run_order)
        });
        if visible {
            Ok(())
        } else {
            Err(CompositionError::DanglingArtifact {
                action: consumer.to_string(),
                artifact: artifact.name().to_string(),
            })
        }
    }

    pub fn record(&mut self, artifact: &Artifact, producer: Producer) -> Result<()> {
        self.check_output(artifact)?;
        self.producers.insert(artifact.name().to_string(), producer);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn producer(stage: usize, run_order: u32) -> Producer {
        Producer {
            stage,
            action: "Producer".into(),
            run_order,
        }
    }

    #[test]
    fn consumers_see_earlier_stages_only() {
        let mut registry = ArtifactRegistry::new();
        let artifact = Artifact::new("CdkBuildOutput");
        registry.record(&artifact, producer(1, 1)).unwrap();

        assert!(registry.check_input(&artifact, "Deploy", 2, 1).is_ok());
        assert!(registry.check_input(&artifact, "SameWave", 1, 1).is_err());
        assert!(registry.check_input(&artifact, "LaterWave", 1, 2).is_ok());
        assert!(registry.check_input(&artifact, "Earlier", 0, 5).is_err());
    }

    #[test]
    fn artifacts_are_produced_once() {
        let mut registry = ArtifactRegistry::new();
        let artifact = Artifact::new("Out");
        registry.record(&artifact, producer(0, 1)).unwrap();
        let err = registry.record(&artifact, producer(1, 1)).unwrap_err();
        assert_eq!(err, CompositionError::duplicate("artifact", "Out"));
    }
}
