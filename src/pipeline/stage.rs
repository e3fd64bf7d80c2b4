//! Pipeline stages and the transition rules between them.
//!
//! ```text
//! Idle ─▶ Uploading ─▶ Parsing ─▶ Detecting ─┬──────────────▶ Polling ─▶ Completed
//!                                            └─▶ Reducing ─▶─┘
//!   (any non-terminal stage) ─────────────────────────────────────────▶ Failed
//! ```
//!
//! The detection-only and detect+reduce flows share one state machine; the
//! [`FlowKind`] decides whether `Reducing` sits between `Detecting` and
//! `Polling`. A stage never regresses, and the only jump allowed is to
//! `Failed`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of a document's journey through the pipeline.
///
/// The derived `Ord` follows pipeline order, with `Failed` sorting after
/// `Completed` so that every legal sequence of observed stages is
/// non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Idle,
    Uploading,
    Parsing,
    Detecting,
    Reducing,
    Polling,
    Completed,
    Failed,
}

impl Stage {
    /// `Completed` and `Failed` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    /// The stage that follows `self` on the success path of `flow`; `None`
    /// from a terminal stage.
    pub fn next(self, flow: FlowKind) -> Option<Stage> {
        match self {
            Stage::Idle => Some(Stage::Uploading),
            Stage::Uploading => Some(Stage::Parsing),
            Stage::Parsing => Some(Stage::Detecting),
            Stage::Detecting => match flow {
                FlowKind::DetectOnly => Some(Stage::Polling),
                FlowKind::DetectAndReduce => Some(Stage::Reducing),
            },
            Stage::Reducing => Some(Stage::Polling),
            Stage::Polling => Some(Stage::Completed),
            Stage::Completed | Stage::Failed => None,
        }
    }

    /// Whether `self -> to` is a legal transition for `flow`.
    pub fn can_transition(self, to: Stage, flow: FlowKind) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to == Stage::Failed {
            return true;
        }
        if self == Stage::Reducing && flow == FlowKind::DetectOnly {
            return false;
        }
        self.next(flow) == Some(to)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "Idle",
            Stage::Uploading => "Uploading",
            Stage::Parsing => "Parsing",
            Stage::Detecting => "Detecting",
            Stage::Reducing => "Reducing",
            Stage::Polling => "Polling",
            Stage::Completed => "Completed",
            Stage::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Which chain of remote jobs a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    /// Upload, parse, submit a detection job and poll it. (default)
    #[default]
    DetectOnly,
    /// Upload, parse, submit detection, then a rewrite ("reduce") job, and
    /// poll the rewrite job.
    DetectAndReduce,
}

impl FlowKind {
    /// Every stage this flow passes through on success, in order.
    pub fn success_path(self) -> Vec<Stage> {
        let mut path = vec![Stage::Idle];
        let mut current = Stage::Idle;
        while let Some(next) = current.next(self) {
            path.push(next);
            current = next;
        }
        path
    }
}
