use kindred_shared::{ChangeKind, RealtimeEvent};

/// Server-side filter for change-feed subscriptions.
///
/// Column predicates are OR'ed: an event passes when any `(column, value)`
/// pair matches the changed row. An empty predicate list passes every row.
/// Non-change events (typing, presence) always pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeFilter {
    predicates: Vec<(String, String)>,
    kinds: Option<Vec<ChangeKind>>,
}

impl ChangeFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(column: &str, value: impl ToString) -> Self {
        Self::all().or_eq(column, value)
    }

    pub fn or_eq(mut self, column: &str, value: impl ToString) -> Self {
        self.predicates.push((column.to_string(), value.to_string()));
        self
    }

    /// Restrict to the given change kinds.
    pub fn kinds(mut self, kinds: &[ChangeKind]) -> Self {
        self.kinds = Some(kinds.to_vec());
        self
    }

    pub fn matches(&self, event: &RealtimeEvent) -> bool {
        let RealtimeEvent::Change(change) = event else {
            return true;
        };

        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&change.kind) {
                return false;
            }
        }

        self.predicates.is_empty()
            || self
                .predicates
                .iter()
                .any(|(column, value)| change.column(column) == Some(value.as_str()))
    }
}
