//! Spec document loading

use crate::error::SpecError;
use crate::types::SpecDocument;
use std::fs;
use std::path::Path;

pub fn parse_spec_file<P: AsRef<Path>>(path: P) -> Result<SpecDocument, SpecError> {
    let shown = path.as_ref().display().to_string();
    let content = fs::read_to_string(&path).map_err(|source| SpecError::Io {
        path: shown.clone(),
        source,
    })?;

    let doc: SpecDocument = serde_json::from_str(&content).map_err(|source| SpecError::Json {
        path: Some(shown.clone()),
        source,
    })?;
    tracing::debug!(path = %shown, entities = doc.entities.len(), "parsed spec file");
    Ok(doc)
}

pub fn parse_spec_content(content: &str) -> Result<SpecDocument, SpecError> {
    serde_json::from_str(content).map_err(|source| SpecError::Json { path: None, source })
}

/// Concatenate several documents, keeping declaration order.
pub fn merge_documents(docs: impl IntoIterator<Item = SpecDocument>) -> SpecDocument {
    SpecDocument {
        entities: docs.into_iter().flat_map(|d| d.entities).collect(),
    }
}
