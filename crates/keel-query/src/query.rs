//! Database-independent description of a read or bulk-delete.

use crate::clause::{Connective, Filter, Order, PageRequest, Sort};

/// Statement kind produced from a [`QuerySpec`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Operation {
    #[default]
    Select,
    Count,
    Delete,
}

/// What to fetch (or count, or delete) for one entity.
///
/// Filters apply in order; an `Or` filter starts a new group, and groups of
/// `And`-ed filters are `OR`-ed together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySpec {
    pub operation: Operation,
    pub filters: Vec<(Connective, Filter)>,
    /// Relationships fetched in addition to the eager ones
    pub includes: Vec<String>,
    pub sort: Sort,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count() -> Self {
        Self {
            operation: Operation::Count,
            ..Self::default()
        }
    }

    pub fn delete() -> Self {
        Self {
            operation: Operation::Delete,
            ..Self::default()
        }
    }

    /// Add a filter joined to the previous one with `AND`.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push((Connective::And, filter));
        self
    }

    /// Add a filter that starts a new `OR` group.
    pub fn or_filter(mut self, filter: Filter) -> Self {
        self.filters.push((Connective::Or, filter));
        self
    }

    /// Also fetch relationship `name` with the results.
    pub fn include(mut self, name: impl Into<String>) -> Self {
        self.includes.push(name.into());
        self
    }

    pub fn order_by(mut self, order: Order) -> Self {
        self.sort = std::mem::take(&mut self.sort).and(order);
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Restrict to one page; the page's sort replaces any existing one
    /// unless the page is unsorted.
    pub fn page(mut self, page: &PageRequest) -> Self {
        if !page.sort.is_unsorted() {
            self.sort = page.sort.clone();
        }
        self.limit = Some(page.size);
        self.offset = Some(page.offset());
        self
    }

    /// The filters split into `AND` groups.
    pub fn groups(&self) -> Vec<Vec<&Filter>> {
        let mut groups: Vec<Vec<&Filter>> = Vec::new();
        for (connective, filter) in &self.filters {
            match (connective, groups.last_mut()) {
                (Connective::And, Some(group)) => group.push(filter),
                _ => groups.push(vec![filter]),
            }
        }
        groups
    }

    /// Same query as a row count (ordering and paging dropped).
    pub fn as_count(&self) -> Self {
        Self {
            operation: Operation::Count,
            filters: self.filters.clone(),
            ..Self::default()
        }
    }
}
