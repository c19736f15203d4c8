//! Accumulator for `status.resources` across one reconciliation.

use crate::{ResourceStatus, StampedRef};

/// Holds the statuses found on the workload and those produced by the current
/// realization. Until [`ResourceStatuses::begin`] is called the previous list is
/// reported as current, so early exits leave `status.resources` untouched.
#[derive(Debug, Clone, Default)]
pub struct ResourceStatuses {
    previous: Vec<ResourceStatus>,
    current: Vec<ResourceStatus>,
    realized: bool,
}

impl ResourceStatuses {
    pub fn new(previous: Vec<ResourceStatus>) -> Self {
        Self { previous, current: Vec::new(), realized: false }
    }

    /// Mark the start of a realization; the current list starts empty.
    pub fn begin(&mut self) {
        self.realized = true;
        self.current.clear();
    }

    pub fn previous(&self, name: &str) -> Option<&ResourceStatus> {
        self.previous.iter().find(|s| s.name == name)
    }

    /// Add or replace the status for `status.name`.
    pub fn add(&mut self, status: ResourceStatus) {
        match self.current.iter_mut().find(|s| s.name == status.name) {
            Some(slot) => *slot = status,
            None => self.current.push(status),
        }
    }

    pub fn current(&self) -> &[ResourceStatus] {
        if self.realized { &self.current } else { &self.previous }
    }

    pub fn is_changed(&self) -> bool {
        self.realized && self.current != self.previous
    }

    /// Stamped references present before this pass but absent now.
    pub fn orphans(&self) -> Vec<StampedRef> {
        let current: Vec<&StampedRef> = self.current().iter().filter_map(|s| s.stamped_ref.as_ref()).collect();
        self.previous
            .iter()
            .filter_map(|s| s.stamped_ref.as_ref())
            .filter(|prev| !current.iter().any(|cur| cur.same_object(prev)))
            .fold(Vec::new(), |mut acc, r| {
                if !acc.iter().any(|a: &StampedRef| a.same_object(r)) {
                    acc.push(r.clone());
                }
                acc
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(name: &str, stamped: Option<&str>) -> ResourceStatus {
        ResourceStatus {
            name: name.to_string(),
            stamped_ref: stamped.map(|n| StampedRef {
                api_version: "apps/v1".into(),
                kind: "Deployment".into(),
                namespace: Some("w1".into()),
                name: n.to_string(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn untouched_statuses_report_previous() {
        let rs = ResourceStatuses::new(vec![status("deploy", Some("app-old"))]);
        assert_eq!(rs.current().len(), 1);
        assert!(!rs.is_changed());
        assert!(rs.orphans().is_empty());
    }

    #[test]
    fn dropped_entries_become_orphans_once() {
        let mut rs = ResourceStatuses::new(vec![
            status("old", Some("app-old")),
            status("dup", Some("app-old")),
            status("deploy", Some("app-deploy")),
        ]);
        rs.begin();
        rs.add(status("deploy", Some("app-deploy")));
        assert!(rs.is_changed());
        let orphans = rs.orphans();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].name, "app-old");
    }

    #[test]
    fn same_result_is_unchanged() {
        let prev = vec![status("deploy", Some("app-deploy"))];
        let mut rs = ResourceStatuses::new(prev.clone());
        rs.begin();
        rs.add(prev[0].clone());
        assert!(!rs.is_changed());
    }

    #[test]
    fn add_replaces_by_name() {
        let mut rs = ResourceStatuses::new(vec![]);
        rs.begin();
        rs.add(status("a", None));
        rs.add(status("a", Some("x")));
        assert_eq!(rs.current().len(), 1);
        assert!(rs.current()[0].stamped_ref.is_some());
        assert!(rs.previous("a").is_none());
    }
}
