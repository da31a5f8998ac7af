use std::collections::BTreeSet;

use dashmap::DashMap;

use sonic_common::{now_ms, Condition, ConditionKey, ConditionKind, PlacementError};

/// Queryable set of active conditions, one per (kind, server, model).
#[derive(Debug, Default)]
pub struct ConditionBoard {
    entries: DashMap<ConditionKey, Condition>,
}

impl ConditionBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an occurrence. Repeats bump the counter and refresh the message.
    pub fn report(&self, err: &PlacementError) {
        let now = now_ms();
        let fresh = Condition::from_error(err, now);
        self.entries
            .entry(fresh.key())
            .and_modify(|c| {
                c.message = fresh.message.clone();
                c.last_seen_ms = now;
                c.occurrences += 1;
            })
            .or_insert(fresh);
    }

    pub fn resolve(&self, kind: ConditionKind, server_id: Option<&str>, model_id: Option<&str>) -> bool {
        let key = (kind, server_id.map(str::to_string), model_id.map(str::to_string));
        self.entries.remove(&key).is_some()
    }

    /// Replace every condition of `kind` with the given set.
    pub fn replace_kind(&self, kind: ConditionKind, errors: &[PlacementError]) {
        let keep: BTreeSet<ConditionKey> = errors
            .iter()
            .filter(|e| e.kind() == kind)
            .map(|e| {
                (
                    kind,
                    e.server_id().map(str::to_string),
                    e.model_id().map(str::to_string),
                )
            })
            .collect();
        self.entries.retain(|key, _| key.0 != kind || keep.contains(key));
        for err in errors.iter().filter(|e| e.kind() == kind) {
            self.report(err);
        }
    }

    pub fn is_failed(&self, server_id: &str, model_id: &str) -> bool {
        self.entries.contains_key(&(
            ConditionKind::ReconciliationFailed,
            Some(server_id.to_string()),
            Some(model_id.to_string()),
        ))
    }

    /// (server_id, model_id) pairs frozen by a reconciliation failure.
    pub fn failed_pairs(&self) -> BTreeSet<(String, String)> {
        self.entries
            .iter()
            .filter(|e| e.key().0 == ConditionKind::ReconciliationFailed)
            .filter_map(|e| Some((e.key().1.clone()?, e.key().2.clone()?)))
            .collect()
    }

    /// Sorted by kind, then scope.
    pub fn list(&self) -> Vec<Condition> {
        let mut out: Vec<Condition> = self.entries.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        out
    }

    pub fn count(&self, kind: ConditionKind) -> usize {
        self.entries.iter().filter(|e| e.key().0 == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonic_common::Action;

    fn failed(server: &str, model: &str) -> PlacementError {
        PlacementError::ReconciliationFailed {
            server_id: server.into(),
            model_id: model.into(),
            action: Action::Load,
            attempts: 3,
            reason: "timeout".into(),
        }
    }

    fn unschedulable(model: &str) -> PlacementError {
        PlacementError::UnschedulableModel {
            model_id: model.into(),
            required_bytes: 1,
            replicas: 0,
            min_replicas: 1,
        }
    }

    #[test]
    fn test_repeats_are_folded() {
        let board = ConditionBoard::new();
        board.report(&failed("s0", "a"));
        board.report(&failed("s0", "a"));
        let list = board.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].occurrences, 2);
        assert!(board.is_failed("s0", "a"));
        assert!(!board.is_failed("s1", "a"));
    }

    #[test]
    fn test_resolve_clears_pair() {
        let board = ConditionBoard::new();
        board.report(&failed("s0", "a"));
        assert!(board.resolve(ConditionKind::ReconciliationFailed, Some("s0"), Some("a")));
        assert!(board.failed_pairs().is_empty());
        assert!(!board.resolve(ConditionKind::ReconciliationFailed, Some("s0"), Some("a")));
    }

    #[test]
    fn test_replace_kind_drops_resolved_models() {
        let board = ConditionBoard::new();
        board.report(&failed("s0", "a"));
        board.replace_kind(ConditionKind::UnschedulableModel, &[unschedulable("a"), unschedulable("b")]);
        assert_eq!(board.count(ConditionKind::UnschedulableModel), 2);

        board.replace_kind(ConditionKind::UnschedulableModel, &[unschedulable("b")]);
        assert_eq!(board.count(ConditionKind::UnschedulableModel), 1);
        // other kinds untouched
        assert!(board.is_failed("s0", "a"));
    }
}
