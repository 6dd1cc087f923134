//! Revision tokens and replication resolution.
//!
//! A revision is `<generation>-<digest>`. Every local edit advances the
//! generation by one; the digest binds the new revision to its parent and
//! its body, so two replicas producing the same edit agree on the token.

use crate::document::{Body, ReplicatedDocument};
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Hex characters kept from the SHA-256 digest.
const DIGEST_LEN: usize = 32;

/// Opaque version token of a document.
///
/// Ordering is by generation, then digest. That order decides which side
/// wins when two replicas edited the same document independently.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision {
    generation: u64,
    digest: String,
}

impl Revision {
    /// Computes the revision that follows `parent` for `body`.
    ///
    /// `parent` is `None` for the first revision of a document.
    #[must_use]
    pub fn next(parent: Option<&Revision>, body: &Body) -> Self {
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update([0u8]);
        // Map keys are sorted, so equal bodies hash equally.
        hasher.update(serde_json::to_vec(body).unwrap_or_default());
        let hash = hasher.finalize();

        let mut digest = String::with_capacity(DIGEST_LEN);
        for byte in hash.iter().take(DIGEST_LEN / 2) {
            digest.push_str(&format!("{byte:02x}"));
        }

        Self {
            generation: parent.map_or(1, |p| p.generation + 1),
            digest,
        }
    }

    /// Returns the generation (number of edits in this revision's history).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the digest part.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Debug for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Revision({self})")
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for Revision {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::invalid_document(format!("malformed revision: {s:?}"));
        let (generation, digest) = s.split_once('-').ok_or_else(invalid)?;
        let generation: u64 = generation.parse().map_err(|_| invalid())?;
        if generation == 0 || digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(invalid());
        }
        Ok(Self {
            generation,
            digest: digest.to_ascii_lowercase(),
        })
    }
}

impl TryFrom<String> for Revision {
    type Error = CoreError;

    fn try_from(value: String) -> CoreResult<Self> {
        value.parse()
    }
}

impl From<Revision> for String {
    fn from(revision: Revision) -> Self {
        revision.to_string()
    }
}

/// Outcome of offering a replicated document to a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The replica has no document with this id.
    Insert,
    /// The incoming revision descends from the replica's current one.
    FastForward,
    /// Both sides edited independently and the incoming revision wins.
    WinsDivergence,
    /// The replica already holds this revision or a descendant of it.
    AlreadyCurrent,
    /// Both sides edited independently and the replica's revision wins.
    Superseded,
}

impl Resolution {
    /// Returns true if the incoming document should replace the current one.
    #[must_use]
    pub fn applies(self) -> bool {
        matches!(
            self,
            Resolution::Insert | Resolution::FastForward | Resolution::WinsDivergence
        )
    }
}

/// Decides what a replica holding `current` does with `incoming`.
///
/// Divergent edits are settled by last-write-wins on the revision order:
/// the higher generation wins, ties go to the larger digest. No merge is
/// attempted and the losing edit is dropped.
#[must_use]
pub fn resolve(current: Option<&ReplicatedDocument>, incoming: &ReplicatedDocument) -> Resolution {
    let Some(current) = current else {
        return Resolution::Insert;
    };

    if current.descends_from(incoming.revision()) {
        Resolution::AlreadyCurrent
    } else if incoming.ancestors.contains(current.revision()) {
        Resolution::FastForward
    } else if incoming.revision() > current.revision() {
        Resolution::WinsDivergence
    } else {
        Resolution::Superseded
    }
}
