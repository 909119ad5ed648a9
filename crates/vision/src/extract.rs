//! Derivation of the named views from one camera frame.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;
use video_ingest::Frame;

use crate::{
    error::PipelineError,
    geometry::{Quadrilateral, Size, warp_perspective},
};

pub const MAIN_VIEW: &str = "main";
pub const ROI_VIEW: &str = "roi";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewKind {
    /// The working-resolution frame as captured.
    Identity,
    /// The region of interest rectified to `output`.
    Perspective { output: Size },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewSpec {
    pub name: String,
    pub kind: ViewKind,
}

impl ViewSpec {
    pub fn identity(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ViewKind::Identity,
        }
    }

    pub fn perspective(name: impl Into<String>, output: Size) -> Self {
        Self {
            name: name.into(),
            kind: ViewKind::Perspective { output },
        }
    }
}

#[derive(Clone, Debug)]
pub struct ViewExtractor {
    views: Vec<ViewSpec>,
}

impl ViewExtractor {
    pub fn new(views: Vec<ViewSpec>) -> Result<Self, PipelineError> {
        if views.is_empty() {
            return Err(PipelineError::Config("at least one view is required".into()));
        }
        let mut seen = BTreeSet::new();
        for view in &views {
            if !seen.insert(view.name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "view {:?} is defined twice",
                    view.name
                )));
            }
        }
        Ok(Self { views })
    }

    /// Full-frame "main" view plus the rectified "roi" view.
    pub fn standard(roi_output: Size) -> Self {
        Self {
            views: vec![
                ViewSpec::identity(MAIN_VIEW),
                ViewSpec::perspective(ROI_VIEW, roi_output),
            ],
        }
    }

    pub fn names(&self) -> BTreeSet<&str> {
        self.views.iter().map(|view| view.name.as_str()).collect()
    }

    pub fn views(&self) -> &[ViewSpec] {
        &self.views
    }

    /// Split `frame` into every named view.
    ///
    /// Warped views are computed first so the frame itself can be moved into
    /// an identity view. A view whose transform fails is left out for this
    /// tick.
    pub fn extract(&self, frame: Frame, roi: &Quadrilateral) -> BTreeMap<String, Frame> {
        let mut out = BTreeMap::new();
        for view in &self.views {
            if let ViewKind::Perspective { output } = view.kind {
                match warp_perspective(&frame, roi, output) {
                    Ok(warped) => {
                        out.insert(view.name.clone(), warped);
                    }
                    Err(err) => warn!(view = %view.name, "Skipping view this tick: {err}"),
                }
            }
        }

        let identities: Vec<&str> = self
            .views
            .iter()
            .filter(|view| view.kind == ViewKind::Identity)
            .map(|view| view.name.as_str())
            .collect();
        if let Some((last, rest)) = identities.split_last() {
            for name in rest {
                out.insert((*name).to_string(), frame.clone());
            }
            out.insert((*last).to_string(), frame);
        }
        out
    }
}
