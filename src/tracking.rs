use std::{fmt, panic::Location};

use ahash::AHashMap;

/// Source location of an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AllocationSite {
    pub file: &'static str,
    pub line: u32,
}

impl AllocationSite {
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }

    /// Location of whoever called the `#[track_caller]` function we're in.
    #[track_caller]
    pub fn caller() -> Self {
        Location::caller().into()
    }
}

impl From<&'static Location<'static>> for AllocationSite {
    fn from(location: &'static Location<'static>) -> Self {
        Self::new(location.file(), location.line())
    }
}

impl fmt::Display for AllocationSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Side table from allocation id to allocation site. Empty and untouched
/// unless tracking is enabled, so segment headers don't pay for it.
#[derive(Debug, Default)]
pub(crate) struct Tracker {
    enabled: bool,
    sites: AHashMap<u32, AllocationSite>,
}

impl Tracker {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            sites: AHashMap::new(),
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Turning tracking off forgets everything recorded so far.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.sites.clear();
        }
    }

    pub fn record(&mut self, id: u32, site: AllocationSite) {
        if self.enabled {
            self.sites.insert(id, site);
        }
    }

    pub fn forget(&mut self, id: u32) -> Option<AllocationSite> {
        self.sites.remove(&id)
    }

    pub fn site_of(&self, id: u32) -> Option<AllocationSite> {
        self.sites.get(&id).copied()
    }
}
