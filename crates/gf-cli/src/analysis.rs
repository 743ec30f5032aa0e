//! Analysis document: everything needed to build a likelihood session.

use anyhow::{Context, Result};
use gf_likelihood::{BackgroundModel, BackgroundModelSpec, InternalModel, LikeSession, SessionConfig};
use gf_response::{DetectorResponse, DetectorResponseSpec, SourceCatalog, SourceCatalogSpec};
use gf_sky::{BinList, SkyMapCollectionSpec};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisDocument {
    pub response: DetectorResponseSpec,
    pub maps: SkyMapCollectionSpec,
    #[serde(default)]
    pub sources: SourceCatalogSpec,
    /// Bins to analyse; all bins present in both maps and response when absent.
    #[serde(default)]
    pub bins: Option<BinList>,
    #[serde(default)]
    pub background_model: Option<BackgroundModelSpec>,
    #[serde(default = "default_true")]
    pub common_norm_free: bool,
    #[serde(default)]
    pub background_norm_free: bool,
    #[serde(default)]
    pub session: SessionConfig,
}

impl AnalysisDocument {
    pub fn read(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let doc = serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))?;
        Ok(doc)
    }

    pub fn build_session(&self) -> Result<LikeSession> {
        let response = DetectorResponse::from_spec(&self.response)?;
        let maps = self.maps.build()?;
        let bins = match &self.bins {
            Some(bins) => bins.clone(),
            None => &maps.bin_list()? & response.bins(),
        };
        tracing::info!(bins = bins.len(), nside = self.maps.nside, "building likelihood session");

        let internal = match &self.background_model {
            Some(spec) => InternalModel::with_background_model(
                BackgroundModel::from_spec(spec)?,
                self.common_norm_free,
                self.background_norm_free,
            ),
            None => InternalModel::new(self.common_norm_free, self.background_norm_free),
        };
        let catalog = Arc::new(SourceCatalog::new(self.sources.clone())?);
        let session = LikeSession::new(response, &maps, &bins, catalog, internal, self.session.clone())?;
        Ok(session)
    }
}
