//! Tags
//!
//! A tag is the identity and validity descriptor every reactive value
//! exposes. The runtime never looks at values; it only looks at tags:
//!
//! - which tags a computation read (its dependencies),
//! - when a tag last changed (its `last_updated` timestamp).
//!
//! # Kinds
//!
//! - **Cell**: a mutable leaf. Its dependencies are itself until it is
//!   frozen, after which it has none.
//! - **Formula**: the tags read during the formula's last successful
//!   evaluation, or `Uninitialized` before the first one.
//! - **Static**: no dependencies, never changes.
//! - **Delegate**: the union of a fixed list of target tags. Custom
//!   primitives built out of several cells expose one of these.
//!
//! Tags are reference counted. A formula tag holds its dependency tags, but
//! no tag ever points back to its dependents, so tag graphs cannot form
//! reference cycles.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use serde::Serialize;
use smallvec::SmallVec;

use super::clock::Timestamp;

/// Counter for generating process-unique tag IDs.
static TAG_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a tag.
///
/// IDs are unique across every runtime in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TagId(u64);

impl TagId {
    fn next() -> Self {
        Self(TAG_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag#{}", self.0)
    }
}

/// The variant of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TagKind {
    /// Mutable leaf.
    Cell,
    /// Memoized derived computation.
    Formula,
    /// Immutable, dependency-free.
    Static,
    /// Alias for a fixed set of other tags.
    Delegate,
}

/// An immutable, ordered, duplicate-free set of tags.
///
/// Produced when an autotracking frame completes. Cloning is cheap.
#[derive(Clone)]
pub struct DependencySet {
    tags: Rc<[Tag]>,
}

impl DependencySet {
    /// The empty set.
    pub fn empty() -> Self {
        Self {
            tags: Rc::from(Vec::new()),
        }
    }

    pub(crate) fn from_unique(tags: Vec<Tag>) -> Self {
        Self {
            tags: Rc::from(tags),
        }
    }

    /// Number of tags in the set.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Iterate over the tags in the order they were first read.
    pub fn iter(&self) -> std::slice::Iter<'_, Tag> {
        self.tags.iter()
    }

    /// Whether a tag with the given ID is in the set.
    pub fn contains(&self, id: TagId) -> bool {
        self.tags.iter().any(|tag| tag.id() == id)
    }

    /// The latest `last_updated` among the members, or
    /// [`Timestamp::INITIAL`] for the empty set.
    pub fn last_updated(&self) -> Timestamp {
        self.tags
            .iter()
            .map(Tag::last_updated)
            .max()
            .unwrap_or(Timestamp::INITIAL)
    }
}

impl Default for DependencySet {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for DependencySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.tags.iter().map(Tag::id))
            .finish()
    }
}

/// The dependencies of a tag.
#[derive(Debug, Clone)]
pub enum Dependencies {
    /// A formula that has never completed an evaluation.
    Uninitialized,
    /// A known dependency set.
    Initialized(DependencySet),
}

impl Dependencies {
    /// Whether the dependencies are known.
    pub fn is_initialized(&self) -> bool {
        matches!(self, Dependencies::Initialized(_))
    }

    /// The dependency set, if known.
    pub fn as_set(&self) -> Option<&DependencySet> {
        match self {
            Dependencies::Initialized(set) => Some(set),
            Dependencies::Uninitialized => None,
        }
    }
}

enum TagBody {
    Cell { frozen: Cell<bool> },
    Formula { dependencies: RefCell<Option<DependencySet>> },
    Static,
    Delegate { targets: Vec<Tag> },
}

struct TagInner {
    id: TagId,
    description: String,
    /// Last write for cells, creation time for static tags. For formulas,
    /// the latest timestamp of any dependency set they ever held, so a
    /// dependency dropped on re-evaluation still counts. Unused by
    /// delegates.
    last_updated: Cell<Timestamp>,
    body: TagBody,
}

/// Identity and validity descriptor of a reactive value.
///
/// Equality and hashing are by identity.
#[derive(Clone)]
pub struct Tag {
    inner: Rc<TagInner>,
}

impl Tag {
    fn with_body(description: String, created_at: Timestamp, body: TagBody) -> Self {
        Self {
            inner: Rc::new(TagInner {
                id: TagId::next(),
                description,
                last_updated: Cell::new(created_at),
                body,
            }),
        }
    }

    /// Create a cell tag, stamped with its creation time.
    ///
    /// Custom primitives that store their own data use this and call
    /// [`Runtime::record_write`](super::Runtime::record_write) on mutation.
    pub fn cell(description: impl Into<String>, created_at: Timestamp) -> Self {
        Self::with_body(
            description.into(),
            created_at,
            TagBody::Cell {
                frozen: Cell::new(false),
            },
        )
    }

    pub(crate) fn formula(description: impl Into<String>) -> Self {
        Self::with_body(
            description.into(),
            Timestamp::INITIAL,
            TagBody::Formula {
                dependencies: RefCell::new(None),
            },
        )
    }

    /// Create a static tag. It has no dependencies and never changes.
    pub fn new_static(description: impl Into<String>) -> Self {
        Self::with_body(description.into(), Timestamp::INITIAL, TagBody::Static)
    }

    /// Create a delegate tag whose dependencies are the union of `targets`.
    pub fn delegate(description: impl Into<String>, targets: Vec<Tag>) -> Self {
        Self::with_body(
            description.into(),
            Timestamp::INITIAL,
            TagBody::Delegate { targets },
        )
    }

    /// The tag's unique ID.
    pub fn id(&self) -> TagId {
        self.inner.id
    }

    /// Human-readable description, used in errors and logs.
    pub fn description(&self) -> &str {
        &self.inner.description
    }

    /// The tag's kind.
    pub fn kind(&self) -> TagKind {
        match self.inner.body {
            TagBody::Cell { .. } => TagKind::Cell,
            TagBody::Formula { .. } => TagKind::Formula,
            TagBody::Static => TagKind::Static,
            TagBody::Delegate { .. } => TagKind::Delegate,
        }
    }

    /// Whether two handles refer to the same tag.
    pub fn ptr_eq(&self, other: &Tag) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// The tag's direct dependencies.
    pub fn dependencies(&self) -> Dependencies {
        match &self.inner.body {
            TagBody::Cell { frozen } => {
                if frozen.get() {
                    Dependencies::Initialized(DependencySet::empty())
                } else {
                    Dependencies::Initialized(DependencySet::from_unique(vec![self.clone()]))
                }
            }
            TagBody::Formula { dependencies } => match &*dependencies.borrow() {
                Some(set) => Dependencies::Initialized(set.clone()),
                None => Dependencies::Uninitialized,
            },
            TagBody::Static => Dependencies::Initialized(DependencySet::empty()),
            TagBody::Delegate { targets } => {
                let mut union: IndexMap<TagId, Tag> = IndexMap::new();
                for target in targets {
                    match target.dependencies() {
                        Dependencies::Uninitialized => return Dependencies::Uninitialized,
                        Dependencies::Initialized(set) => {
                            for tag in set.iter() {
                                union.entry(tag.id()).or_insert_with(|| tag.clone());
                            }
                        }
                    }
                }
                Dependencies::Initialized(DependencySet::from_unique(
                    union.into_values().collect(),
                ))
            }
        }
    }

    /// When this tag, or anything it depends on, last changed.
    pub fn last_updated(&self) -> Timestamp {
        match &self.inner.body {
            TagBody::Cell { .. } | TagBody::Static => self.inner.last_updated.get(),
            TagBody::Formula { dependencies } => match &*dependencies.borrow() {
                Some(set) => self.inner.last_updated.get().max(set.last_updated()),
                None => self.inner.last_updated.get(),
            },
            TagBody::Delegate { targets } => targets
                .iter()
                .map(Tag::last_updated)
                .max()
                .unwrap_or(Timestamp::INITIAL),
        }
    }

    /// Whether this is a frozen cell.
    pub fn is_frozen(&self) -> bool {
        match &self.inner.body {
            TagBody::Cell { frozen } => frozen.get(),
            _ => false,
        }
    }

    /// Whether nothing reachable from this tag can ever change again.
    ///
    /// Constant tags are never recorded as dependencies.
    pub fn is_constant(&self) -> bool {
        let mut stack: SmallVec<[Tag; 16]> = SmallVec::new();
        let mut seen: IndexMap<TagId, ()> = IndexMap::new();
        stack.push(self.clone());

        while let Some(tag) = stack.pop() {
            if seen.insert(tag.id(), ()).is_some() {
                continue;
            }
            match &tag.inner.body {
                TagBody::Cell { frozen } => {
                    if !frozen.get() {
                        return false;
                    }
                }
                TagBody::Formula { dependencies } => match &*dependencies.borrow() {
                    Some(set) => stack.extend(set.iter().cloned()),
                    None => return false,
                },
                TagBody::Static => {}
                TagBody::Delegate { targets } => stack.extend(targets.iter().cloned()),
            }
        }

        true
    }

    /// Every tag reachable from this one, including itself, in pre-order.
    pub fn reachable(&self) -> IndexMap<TagId, Tag> {
        let mut visited: IndexMap<TagId, Tag> = IndexMap::new();
        let mut stack: SmallVec<[Tag; 16]> = SmallVec::new();
        stack.push(self.clone());

        while let Some(tag) = stack.pop() {
            if visited.contains_key(&tag.id()) {
                continue;
            }
            match &tag.inner.body {
                TagBody::Formula { dependencies } => {
                    if let Some(set) = &*dependencies.borrow() {
                        stack.extend(set.iter().rev().cloned());
                    }
                }
                TagBody::Delegate { targets } => stack.extend(targets.iter().rev().cloned()),
                TagBody::Cell { .. } | TagBody::Static => {}
            }
            visited.insert(tag.id(), tag);
        }

        visited
    }

    /// The unfrozen cell tags reachable from this one.
    pub fn leaves(&self) -> Vec<Tag> {
        self.reachable()
            .into_values()
            .filter(|tag| tag.kind() == TagKind::Cell && !tag.is_frozen())
            .collect()
    }

    /// Record a write to a cell tag.
    pub(crate) fn update(&self, at: Timestamp) {
        debug_assert_eq!(self.kind(), TagKind::Cell, "only cell tags are written");
        self.inner.last_updated.set(at);
    }

    pub(crate) fn freeze(&self) {
        if let TagBody::Cell { frozen } = &self.inner.body {
            frozen.set(true);
        }
    }

    /// Replace a formula's dependencies wholesale.
    ///
    /// The formula's `last_updated` never goes backwards: it keeps the
    /// latest timestamp of both the old and the new set.
    pub(crate) fn set_dependencies(&self, set: DependencySet) {
        if let TagBody::Formula { dependencies } = &self.inner.body {
            let mut slot = dependencies.borrow_mut();
            let previous = slot.as_ref().map_or(Timestamp::INITIAL, DependencySet::last_updated);
            let stamp = self
                .inner
                .last_updated
                .get()
                .max(previous)
                .max(set.last_updated());
            self.inner.last_updated.set(stamp);
            *slot = Some(set);
        }
    }

    /// Number of live handles to this tag.
    pub(crate) fn handle_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Tag {}

impl Hash for Tag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag")
            .field("id", &self.inner.id)
            .field("kind", &self.kind())
            .field("description", &self.inner.description)
            .field("last_updated", &self.last_updated())
            .finish()
    }
}

/// Anything that exposes a tag and can therefore be tracked, subscribed to,
/// or composed into a delegate.
pub trait Tagged {
    /// The value's tag.
    fn tag(&self) -> Tag;
}

impl Tagged for Tag {
    fn tag(&self) -> Tag {
        self.clone()
    }
}

impl<T: Tagged + ?Sized> Tagged for &T {
    fn tag(&self) -> Tag {
        (**self).tag()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
