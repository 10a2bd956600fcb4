//! Test identities, the discovered test universe, and test-id lists.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable unique identifier of one discovered test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(Uuid);

impl TestId {
    /// Fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Deterministic identifier built from a small integer; handy for hosts and tests that
    /// number their tests.
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Underlying UUID.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One discovered test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDescription {
    /// Stable identifier.
    pub id: TestId,
    /// Human-readable name.
    pub name: String,
    /// Source file declaring the test.
    #[serde(default)]
    pub source_file: String,
}

impl TestDescription {
    /// Build a description.
    pub fn new(id: TestId, name: impl Into<String>, source_file: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            source_file: source_file.into(),
        }
    }
}

/// The test universe discovered once per session.
///
/// Registration is append-only; once the orchestrator has finished discovery the set is held
/// behind an `Arc` and never mutated again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestSet {
    tests: BTreeMap<TestId, TestDescription>,
}

impl TestSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a test. Returns `false` (and keeps the first registration) when the id is
    /// already known.
    pub fn register(&mut self, test: TestDescription) -> bool {
        if self.tests.contains_key(&test.id) {
            return false;
        }
        self.tests.insert(test.id, test);
        true
    }

    /// Number of known tests.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// True when no test is known.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Lookup by id.
    pub fn get(&self, id: &TestId) -> Option<&TestDescription> {
        self.tests.get(id)
    }

    /// True when `id` is a known test.
    pub fn contains(&self, id: &TestId) -> bool {
        self.tests.contains_key(id)
    }

    /// Known ids in order.
    pub fn ids(&self) -> impl Iterator<Item = &TestId> {
        self.tests.keys()
    }

    /// Known tests in id order.
    pub fn iter(&self) -> impl Iterator<Item = &TestDescription> {
        self.tests.values()
    }

    /// Display name for `id`, falling back to the id itself for unknown tests.
    pub fn name_of(&self, id: &TestId) -> String {
        self.tests
            .get(id)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| id.to_string())
    }
}

impl FromIterator<TestDescription> for TestSet {
    fn from_iter<I: IntoIterator<Item = TestDescription>>(iter: I) -> Self {
        let mut set = Self::new();
        for test in iter {
            set.register(test);
        }
        set
    }
}

/// A set of tests: either exactly the listed ones, or every test of the live universe.
///
/// `Everything` is resolved lazily against a [`TestSet`], so "ran everything" can be expressed
/// without knowing the full id list up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ids", rename_all = "snake_case")]
pub enum TestsGuidList {
    /// Every test of the universe.
    Everything,
    /// Exactly these tests.
    Explicit(BTreeSet<TestId>),
}

impl Default for TestsGuidList {
    fn default() -> Self {
        Self::no_test()
    }
}

impl TestsGuidList {
    /// The empty list.
    pub fn no_test() -> Self {
        Self::Explicit(BTreeSet::new())
    }

    /// The "every test" sentinel.
    pub fn every_test() -> Self {
        Self::Everything
    }

    /// Explicit list from any sequence of ids; duplicates collapse.
    pub fn from_ids<I: IntoIterator<Item = TestId>>(ids: I) -> Self {
        Self::Explicit(ids.into_iter().collect())
    }

    /// True for the sentinel.
    pub fn is_every_test(&self) -> bool {
        matches!(self, Self::Everything)
    }

    /// True for an explicit empty list. The sentinel is never considered empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Everything => false,
            Self::Explicit(ids) => ids.is_empty(),
        }
    }

    /// Membership test against the live universe.
    pub fn contains(&self, id: &TestId, universe: &TestSet) -> bool {
        match self {
            Self::Everything => universe.contains(id),
            Self::Explicit(ids) => ids.contains(id),
        }
    }

    /// Number of tests once resolved against `universe`.
    pub fn count(&self, universe: &TestSet) -> usize {
        match self {
            Self::Everything => universe.len(),
            Self::Explicit(ids) => ids.len(),
        }
    }

    /// Enumerate the ids, resolving the sentinel against `universe`.
    pub fn resolve(&self, universe: &TestSet) -> BTreeSet<TestId> {
        match self {
            Self::Everything => universe.ids().copied().collect(),
            Self::Explicit(ids) => ids.clone(),
        }
    }

    /// Explicit ids, or `None` for the sentinel.
    pub fn explicit_ids(&self) -> Option<&BTreeSet<TestId>> {
        match self {
            Self::Everything => None,
            Self::Explicit(ids) => Some(ids),
        }
    }

    /// True iff every test of `other` is in `self`.
    pub fn is_included(&self, other: &TestsGuidList, universe: &TestSet) -> bool {
        match (self, other) {
            (Self::Everything, _) => true,
            (Self::Explicit(mine), Self::Everything) => universe.ids().all(|id| mine.contains(id)),
            (Self::Explicit(mine), Self::Explicit(theirs)) => theirs.is_subset(mine),
        }
    }

    /// Union of both lists.
    pub fn merge(&self, other: &TestsGuidList) -> TestsGuidList {
        match (self, other) {
            (Self::Everything, _) | (_, Self::Everything) => Self::Everything,
            (Self::Explicit(a), Self::Explicit(b)) => Self::Explicit(a.union(b).copied().collect()),
        }
    }

    /// Intersection of both lists.
    pub fn intersect(&self, other: &TestsGuidList) -> TestsGuidList {
        match (self, other) {
            (Self::Everything, other) | (other, Self::Everything) => other.clone(),
            (Self::Explicit(a), Self::Explicit(b)) => {
                Self::Explicit(a.intersection(b).copied().collect())
            }
        }
    }

    /// True when both lists share at least one test of `universe`.
    pub fn intersects(&self, other: &TestsGuidList, universe: &TestSet) -> bool {
        match (self, other) {
            (Self::Everything, Self::Everything) => !universe.is_empty(),
            (Self::Everything, Self::Explicit(ids)) | (Self::Explicit(ids), Self::Everything) => {
                ids.iter().any(|id| universe.contains(id))
            }
            (Self::Explicit(a), Self::Explicit(b)) => a.intersection(b).next().is_some(),
        }
    }

    /// Add one id. No-op on the sentinel.
    pub fn insert(&mut self, id: TestId) {
        if let Self::Explicit(ids) = self {
            ids.insert(id);
        }
    }
}

impl FromIterator<TestId> for TestsGuidList {
    fn from_iter<I: IntoIterator<Item = TestId>>(iter: I) -> Self {
        Self::from_ids(iter)
    }
}
