//! Lifecycle states and other closed value sets
//!
//! Every enum here round-trips through its snake_case string form, which is also
//! the representation stored in SQLite.

use serde::{Deserialize, Serialize};

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(format!("unknown {}: {}", stringify!($name), s)),
                }
            }
        }

        impl rusqlite::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: String| rusqlite::types::FromSqlError::Other(e.into()))
            }
        }
    };
}

string_enum!(
    /// Ingestion job status
    JobStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        DeadLetter => "dead_letter",
    }
);

string_enum!(
    /// Reprocess job status
    ReprocessStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Unresolved => "unresolved",
    }
);

string_enum!(
    ReprocessTriggerMode {
        Manual => "manual",
        AutoThreshold => "auto_threshold",
    }
);

string_enum!(
    TranslationStatus {
        Translated => "translated",
        NeedsReprocess => "needs_reprocess",
        Unresolved => "unresolved",
    }
);

string_enum!(
    RelevanceState {
        Accepted => "accepted",
        Borderline => "borderline",
        Filtered => "filtered",
    }
);

string_enum!(
    /// Human review state of any reviewable object
    ReviewerState {
        Proposed => "proposed",
        Approved => "approved",
        Rejected => "rejected",
        NeedsRevision => "needs_revision",
    }
);

string_enum!(
    PublishState {
        Blocked => "blocked",
        Eligible => "eligible",
        Published => "published",
    }
);

string_enum!(
    ReviewDecisionKind {
        Approve => "approve",
        Reject => "reject",
        NeedsRevision => "needs_revision",
    }
);

string_enum!(
    /// Object types that pass through human review
    ReviewableType {
        Passage => "passage",
        Tag => "tag",
        Link => "link",
        Flag => "flag",
    }
);

string_enum!(
    MemberRole {
        Primary => "primary",
        Secondary => "secondary",
    }
);

string_enum!(
    GroupStatus {
        Active => "active",
        NeedsReview => "needs_review",
        Archived => "archived",
    }
);

string_enum!(
    /// Outcome of registering a source
    RegisterOutcome {
        Created => "created",
        ExactDuplicate => "exact_duplicate",
        AlternateWitness => "alternate_witness",
    }
);

string_enum!(
    /// Commonality confidence bucket
    ConfidenceBucket {
        High => "high",
        Medium => "medium",
        Exploratory => "exploratory",
    }
);

string_enum!(
    RelationType {
        IsVersionOf => "isVersionOf",
        IsRelatedTo => "isRelatedTo",
        SharesPatternWith => "sharesPatternWith",
        IsDerivativeOf => "isDerivativeOf",
    }
);

impl ReviewDecisionKind {
    /// Reject and needs_revision must carry reviewer notes.
    pub fn requires_notes(&self) -> bool {
        matches!(self, Self::Reject | Self::NeedsRevision)
    }

    /// The reviewer state a decision moves an object into.
    pub fn target_state(&self) -> ReviewerState {
        match self {
            Self::Approve => ReviewerState::Approved,
            Self::Reject => ReviewerState::Rejected,
            Self::NeedsRevision => ReviewerState::NeedsRevision,
        }
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::DeadLetter)
    }
}

impl ReprocessStatus {
    /// Open jobs block a second job for the same passage.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}
