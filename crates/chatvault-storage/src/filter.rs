use std::collections::HashSet;

/// Declarative predicate over message attributes, compiled into a SQL WHERE
/// fragment. The same fragment drives count, select and delete so the three
/// can never disagree about which rows match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub timestamp_start: Option<i64>,
    pub timestamp_end: Option<i64>,
    pub channel_ids: Option<HashSet<i64>>,
    pub user_ids: Option<HashSet<i64>>,
    pub message_ids: Option<HashSet<i64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalMode {
    KeepMatching,
    RemoveMatching,
}

impl MessageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the filter compiles to no predicate at all. An id set that
    /// is present but empty contributes nothing.
    pub fn is_empty(&self) -> bool {
        self.timestamp_start.is_none()
            && self.timestamp_end.is_none()
            && !id_set_present(&self.channel_ids)
            && !id_set_present(&self.user_ids)
            && !id_set_present(&self.message_ids)
    }

    /// Compiles the filter to a `" WHERE ..."` fragment, or an empty string
    /// when no condition applies. `alias` qualifies column names for joined
    /// queries; `invert` wraps the whole predicate in `NOT (...)`.
    pub(crate) fn where_clause(&self, alias: Option<&str>, invert: bool) -> String {
        let conditions = self.conditions(alias);
        if conditions.is_empty() {
            return String::new();
        }

        let joined = conditions.join(" AND ");
        if invert {
            format!(" WHERE NOT ({joined})")
        } else {
            format!(" WHERE {joined}")
        }
    }

    fn conditions(&self, alias: Option<&str>) -> Vec<String> {
        let column = |name: &str| match alias {
            Some(alias) => format!("{alias}.{name}"),
            None => name.to_string(),
        };

        let mut conditions = Vec::new();
        if let Some(start) = self.timestamp_start {
            conditions.push(format!("{} >= {start}", column("timestamp")));
        }
        if let Some(end) = self.timestamp_end {
            conditions.push(format!("{} <= {end}", column("timestamp")));
        }
        if let Some(ids) = self.channel_ids.as_ref().filter(|ids| !ids.is_empty()) {
            conditions.push(in_clause(&column("channel_id"), ids));
        }
        if let Some(ids) = self.user_ids.as_ref().filter(|ids| !ids.is_empty()) {
            conditions.push(in_clause(&column("sender_id"), ids));
        }
        if let Some(ids) = self.message_ids.as_ref().filter(|ids| !ids.is_empty()) {
            conditions.push(in_clause(&column("message_id"), ids));
        }
        conditions
    }
}

fn id_set_present(ids: &Option<HashSet<i64>>) -> bool {
    ids.as_ref().is_some_and(|ids| !ids.is_empty())
}

fn in_clause(column: &str, ids: &HashSet<i64>) -> String {
    // Sorted so compiled SQL is deterministic for identical filters.
    let mut sorted: Vec<i64> = ids.iter().copied().collect();
    sorted.sort_unstable();
    let list = sorted
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("{column} IN ({list})")
}
