//! Prefixed identifiers for every persisted entity
//!
//! Ids are plain strings of the form `<prefix>_<16 hex>` so the object type of any id
//! can be recovered from the id alone (see [`infer_object_type`]).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Build a random prefixed id, e.g. `src_3f9a0c1d2e4b5a69`.
pub fn prefixed_id(prefix: &str) -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &simple[..16])
}

/// Build a deterministic prefixed id from the given parts.
///
/// The same parts always produce the same id.
pub fn stable_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("{}_{}", prefix, &digest[..16])
}

/// Lowercase hex sha256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Create a new random id
            pub fn new() -> Self {
                Self(prefixed_id($prefix))
            }

            /// Wrap an existing id string
            pub fn from_string(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl rusqlite::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                self.0.to_sql()
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
                String::column_result(value).map(Self)
            }
        }
    };
}

define_id!(TextId, "txt");
define_id!(SourceId, "src");
define_id!(
    /// Passage ids are derived from the source and span (see `quality::extraction`),
    /// so re-extracting the same text yields the same ids.
    PassageId,
    "psg"
);
define_id!(JobId, "job");
define_id!(AttemptId, "att");
define_id!(ReprocessJobId, "rpj");
define_id!(RevisionId, "trv");
define_id!(TagId, "tag");
define_id!(LinkId, "lnk");
define_id!(FlagId, "flg");
define_id!(TraceId, "trc");
define_id!(PendingTermId, "vpt");
define_id!(GroupId, "wgr");
define_id!(ConsolidatedId, "cps");
define_id!(ReviewId, "rev");
define_id!(AuditId, "aud");
define_id!(PackageId, "pkg");
define_id!(ProfileId, "tpf");

/// Recover the object type name from a prefixed id.
pub fn infer_object_type(id: &str) -> Option<&'static str> {
    let (prefix, _) = id.split_once('_')?;
    let kind = match prefix {
        "txt" => "text",
        "src" => "source",
        "psg" => "passage",
        "job" => "job",
        "att" => "attempt",
        "rpj" => "reprocess_job",
        "trv" => "translation_revision",
        "tag" => "tag",
        "lnk" => "link",
        "flg" => "flag",
        "trc" => "trace",
        "vpt" => "pending_term",
        "wgr" => "witness_group",
        "cps" => "consolidated_passage",
        "rev" => "review",
        "aud" => "audit_event",
        "pkg" => "publish_package",
        "tpf" => "tuning_profile",
        _ => return None,
    };
    Some(kind)
}
