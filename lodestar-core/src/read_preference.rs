//! Read preference: which cluster members may serve a read.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use lodestar_bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::{DriverError, DriverResult};

/// Smallest accepted max staleness.
pub const SMALLEST_MAX_STALENESS: Duration = Duration::from_secs(90);

/// Idle write period servers use to advance their last write time.
pub const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

/// Which members a read may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadMode {
    /// Primary only.
    #[default]
    Primary,
    /// Primary, falling back to secondaries.
    PrimaryPreferred,
    /// Secondaries only.
    Secondary,
    /// Secondaries, falling back to the primary.
    SecondaryPreferred,
    /// Any data-bearing member within the latency window.
    Nearest,
}

impl ReadMode {
    /// Wire name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::PrimaryPreferred => "primaryPreferred",
            Self::Secondary => "secondary",
            Self::SecondaryPreferred => "secondaryPreferred",
            Self::Nearest => "nearest",
        }
    }
}

impl fmt::Display for ReadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of `name: value` tags a server must carry. The empty set matches
/// every server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    /// Create an empty tag set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tag.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Whether every tag of this set is present on `server_tags`.
    pub fn matches(&self, server_tags: &TagSet) -> bool {
        self.0
            .iter()
            .all(|(k, v)| server_tags.0.get(k).is_some_and(|sv| sv == v))
    }

    /// Whether the set has no tags.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Look up a tag.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    fn to_document(&self) -> Document {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Immutable read routing policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ReadPreference {
    mode: ReadMode,
    tag_sets: Vec<TagSet>,
    max_staleness: Option<Duration>,
}

impl ReadPreference {
    /// Create a read preference for `mode` with no tags or staleness bound.
    pub fn new(mode: ReadMode) -> Self {
        Self {
            mode,
            tag_sets: Vec::new(),
            max_staleness: None,
        }
    }

    /// Primary only.
    pub fn primary() -> Self {
        Self::new(ReadMode::Primary)
    }

    /// Primary preferred.
    pub fn primary_preferred() -> Self {
        Self::new(ReadMode::PrimaryPreferred)
    }

    /// Secondary only.
    pub fn secondary() -> Self {
        Self::new(ReadMode::Secondary)
    }

    /// Secondary preferred.
    pub fn secondary_preferred() -> Self {
        Self::new(ReadMode::SecondaryPreferred)
    }

    /// Nearest.
    pub fn nearest() -> Self {
        Self::new(ReadMode::Nearest)
    }

    /// Replace the ordered tag set list.
    pub fn with_tag_sets(mut self, tag_sets: Vec<TagSet>) -> Self {
        self.tag_sets = tag_sets;
        self
    }

    /// Bound how far behind the primary a secondary may be.
    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
        self.max_staleness = Some(max_staleness);
        self
    }

    /// The mode.
    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    /// The ordered tag sets.
    pub fn tag_sets(&self) -> &[TagSet] {
        &self.tag_sets
    }

    /// The staleness bound, if any.
    pub fn max_staleness(&self) -> Option<Duration> {
        self.max_staleness
    }

    /// Whether this is plain `Primary`.
    pub fn is_primary(&self) -> bool {
        self.mode == ReadMode::Primary
    }

    /// Check internal consistency against the cluster's heartbeat frequency.
    pub fn validate(&self, heartbeat_frequency: Duration) -> DriverResult<()> {
        if self.mode == ReadMode::Primary {
            if !self.tag_sets.is_empty() {
                return Err(DriverError::config(
                    "tag sets are not allowed with the primary read mode",
                ));
            }
            if self.max_staleness.is_some() {
                return Err(DriverError::config(
                    "max staleness is not allowed with the primary read mode",
                ));
            }
        }
        if let Some(max_staleness) = self.max_staleness {
            let floor = SMALLEST_MAX_STALENESS.max(heartbeat_frequency + IDLE_WRITE_PERIOD);
            if max_staleness < floor {
                return Err(DriverError::config(format!(
                    "max staleness of {}s is below the minimum of {}s",
                    max_staleness.as_secs(),
                    floor.as_secs()
                )));
            }
        }
        Ok(())
    }

    /// The `$readPreference` document sent with commands.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("mode", self.mode.as_str());
        if !self.tag_sets.is_empty() {
            let tags: Vec<Bson> = self
                .tag_sets
                .iter()
                .map(|t| Bson::Document(t.to_document()))
                .collect();
            doc.insert("tags", tags);
        }
        if let Some(max_staleness) = self.max_staleness {
            doc.insert("maxStalenessSeconds", max_staleness.as_secs() as i64);
        }
        doc
    }
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mode)?;
        if !self.tag_sets.is_empty() {
            write!(f, " tags={:?}", self.tag_sets)?;
        }
        if let Some(max_staleness) = self.max_staleness {
            write!(f, " maxStaleness={}s", max_staleness.as_secs())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestar_bson::doc;
    use pretty_assertions::assert_eq;

    const HEARTBEAT: Duration = Duration::from_secs(10);

    #[test]
    fn test_default_is_primary() {
        let pref: ReadPreference = Default::default();
        assert!(pref.is_primary());
        assert!(pref.validate(HEARTBEAT).is_ok());
    }

    #[test]
    fn test_primary_rejects_tags_and_staleness() {
        let tagged = ReadPreference::primary().with_tag_sets(vec![TagSet::new().with("dc", "east")]);
        assert!(tagged.validate(HEARTBEAT).is_err());

        let stale = ReadPreference::primary().with_max_staleness(Duration::from_secs(120));
        assert!(stale.validate(HEARTBEAT).is_err());
    }

    #[test]
    fn test_max_staleness_floor() {
        let low = ReadPreference::secondary().with_max_staleness(Duration::from_secs(89));
        assert!(low.validate(HEARTBEAT).is_err());

        let ok = ReadPreference::secondary().with_max_staleness(Duration::from_secs(90));
        assert!(ok.validate(HEARTBEAT).is_ok());

        // A slow heartbeat raises the floor.
        let slow = Duration::from_secs(100);
        assert!(ok.validate(slow).is_err());
    }

    #[test]
    fn test_tag_matching() {
        let server: TagSet = [("dc", "east"), ("rack", "1")].into_iter().collect();
        assert!(TagSet::new().matches(&server));
        assert!(TagSet::new().with("dc", "east").matches(&server));
        assert!(!TagSet::new().with("dc", "west").matches(&server));
        assert!(!TagSet::new().with("zone", "a").matches(&server));
    }

    #[test]
    fn test_to_document() {
        let pref = ReadPreference::secondary_preferred()
            .with_tag_sets(vec![TagSet::new().with("dc", "east"), TagSet::new()])
            .with_max_staleness(Duration::from_secs(120));
        assert_eq!(
            pref.to_document(),
            doc! {
                "mode" => "secondaryPreferred",
                "tags" => vec![Bson::Document(doc! { "dc" => "east" }), Bson::Document(Document::new())],
                "maxStalenessSeconds" => 120i64,
            }
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(ReadPreference::nearest().to_string(), "nearest");
    }
}
