//! Replica selection and relocation classification.
//!
//! # Design
//! - Without a priority table the first recorded reachable replica wins.
//! - Hosts missing from the priority table rank after listed hosts and keep their
//!   recorded order among themselves.

use std::collections::HashSet;

use crate::model::RawLocation;

/// True when no replica is already on `destination`.
#[must_use]
pub fn needs_relocation(locations: &[RawLocation], destination: &str) -> bool {
    !locations
        .iter()
        .any(|location| location.host == destination)
}

/// True when the only replica lives on `host`.
#[must_use]
pub fn is_sole_source(locations: &[RawLocation], host: &str) -> bool {
    matches!(locations, [only] if only.host == host)
}

/// Chooses which replica of a run to read from.
#[derive(Debug, Clone, Default)]
pub struct LocationResolver {
    priority: Vec<String>,
    unreachable: HashSet<String>,
}

impl LocationResolver {
    /// Resolver with recorded-order preference and every host reachable.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rank hosts by their position in `priority`.
    #[must_use]
    pub fn with_priority<I, S>(mut self, priority: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.priority = priority.into_iter().map(Into::into).collect();
        self
    }

    /// Exclude `host` from replica selection.
    pub fn mark_unreachable(&mut self, host: impl Into<String>) {
        self.unreachable.insert(host.into());
    }

    /// Whether replicas on `host` may be selected.
    #[must_use]
    pub fn is_reachable(&self, host: &str) -> bool {
        !self.unreachable.contains(host)
    }

    /// Best reachable replica, if any.
    #[must_use]
    pub fn best_replica<'a>(&self, locations: &'a [RawLocation]) -> Option<&'a RawLocation> {
        self.select(locations, |_| true)
    }

    /// Best reachable replica that is not already on `destination`.
    #[must_use]
    pub fn best_replica_excluding<'a>(
        &self,
        locations: &'a [RawLocation],
        destination: &str,
    ) -> Option<&'a RawLocation> {
        self.select(locations, |location| location.host != destination)
    }

    /// See [`needs_relocation`].
    #[must_use]
    pub fn needs_relocation(&self, locations: &[RawLocation], destination: &str) -> bool {
        needs_relocation(locations, destination)
    }

    /// See [`is_sole_source`].
    #[must_use]
    pub fn is_sole_source(&self, locations: &[RawLocation], host: &str) -> bool {
        is_sole_source(locations, host)
    }

    fn select<'a>(
        &self,
        locations: &'a [RawLocation],
        keep: impl Fn(&RawLocation) -> bool,
    ) -> Option<&'a RawLocation> {
        locations
            .iter()
            .enumerate()
            .filter(|(_, location)| self.is_reachable(&location.host) && keep(location))
            .min_by_key(|(index, location)| (self.rank(&location.host), *index))
            .map(|(_, location)| location)
    }

    fn rank(&self, host: &str) -> usize {
        self.priority
            .iter()
            .position(|candidate| candidate == host)
            .unwrap_or(self.priority.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ArchiveFormat;

    fn at(host: &str) -> RawLocation {
        RawLocation::new(host, format!("{host}/run.7z"), ArchiveFormat::SevenZip)
    }

    #[test]
    fn relocation_needed_only_when_destination_absent() {
        assert!(needs_relocation(&[], "COVIS-NAS"));
        assert!(needs_relocation(&[at("DMAS")], "COVIS-NAS"));
        assert!(!needs_relocation(&[at("DMAS"), at("COVIS-NAS")], "COVIS-NAS"));
    }

    #[test]
    fn sole_source_requires_exactly_one_matching_location() {
        assert!(is_sole_source(&[at("DMAS")], "DMAS"));
        assert!(!is_sole_source(&[], "DMAS"));
        assert!(!is_sole_source(&[at("DMAS"), at("OLD")], "DMAS"));
        assert!(!is_sole_source(&[at("OLD")], "DMAS"));
    }

    #[test]
    fn recorded_order_wins_without_priority() {
        let resolver = LocationResolver::new();
        let locations = [at("OLD"), at("DMAS")];
        assert_eq!(resolver.best_replica(&locations).map(|l| l.host.as_str()), Some("OLD"));
        assert!(resolver.best_replica(&[]).is_none());
    }

    #[test]
    fn priority_table_reorders_and_unlisted_hosts_follow() {
        let resolver = LocationResolver::new().with_priority(["DMAS"]);
        let locations = [at("OLD"), at("OTHER"), at("DMAS")];
        assert_eq!(resolver.best_replica(&locations).map(|l| l.host.as_str()), Some("DMAS"));

        let unlisted = [at("OLD"), at("OTHER")];
        assert_eq!(resolver.best_replica(&unlisted).map(|l| l.host.as_str()), Some("OLD"));
    }

    #[test]
    fn unreachable_hosts_and_destination_are_skipped() {
        let mut resolver = LocationResolver::new();
        resolver.mark_unreachable("OLD");
        let locations = [at("OLD"), at("COVIS-NAS"), at("DMAS")];
        assert_eq!(
            resolver
                .best_replica_excluding(&locations, "COVIS-NAS")
                .map(|l| l.host.as_str()),
            Some("DMAS")
        );
        assert!(resolver.best_replica(&[at("OLD")]).is_none());
    }
}
