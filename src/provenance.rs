use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::governance::AssetRef;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Integrity {
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Provenance captured alongside an immutable version snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub integrity: Integrity,
}

/// Pluggable provenance capture, invoked at version-creation time.
#[async_trait]
pub trait ProvenanceExtractor: Send + Sync {
    async fn extract(&self, asset: &AssetRef, snapshot: &Value) -> anyhow::Result<Provenance>;
}

pub fn content_digest(snapshot: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(snapshot.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Fixed source metadata, for catalogs whose origin is known at deploy time.
#[derive(Debug, Clone)]
pub struct StaticExtractor {
    pub source_type: String,
    pub source_uri: Option<String>,
}

#[async_trait]
impl ProvenanceExtractor for StaticExtractor {
    async fn extract(&self, asset: &AssetRef, _snapshot: &Value) -> anyhow::Result<Provenance> {
        Ok(Provenance {
            source_type: self.source_type.clone(),
            source_uri: self.source_uri.clone(),
            source_id: Some(asset.default_uid()),
            observed_at: Some(Utc::now()),
            ..Default::default()
        })
    }
}

/// Derives a revision from the snapshot content itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHashExtractor;

#[async_trait]
impl ProvenanceExtractor for ContentHashExtractor {
    async fn extract(&self, asset: &AssetRef, snapshot: &Value) -> anyhow::Result<Provenance> {
        Ok(Provenance {
            source_type: "content-hash".to_string(),
            source_id: Some(asset.default_uid()),
            revision_id: Some(content_digest(snapshot)),
            observed_at: Some(Utc::now()),
            ..Default::default()
        })
    }
}

/// Composes another extractor with a snapshot hash. A successful extraction
/// is stamped verified with the hash; an extraction failure downgrades to an
/// unverified record carrying the error, rather than failing the version.
pub struct VerifyingExtractor {
    inner: Arc<dyn ProvenanceExtractor>,
}

impl VerifyingExtractor {
    pub fn new(inner: Arc<dyn ProvenanceExtractor>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ProvenanceExtractor for VerifyingExtractor {
    async fn extract(&self, asset: &AssetRef, snapshot: &Value) -> anyhow::Result<Provenance> {
        match self.inner.extract(asset, snapshot).await {
            Ok(mut provenance) => {
                provenance.integrity = Integrity {
                    verified: true,
                    method: Some("sha256".to_string()),
                    details: Some(content_digest(snapshot)),
                };
                Ok(provenance)
            }
            Err(err) => Ok(Provenance {
                source_type: "unknown".to_string(),
                source_id: Some(asset.default_uid()),
                integrity: Integrity {
                    verified: false,
                    method: None,
                    details: Some(err.to_string()),
                },
                ..Default::default()
            }),
        }
    }
}
