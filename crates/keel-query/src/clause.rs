//! Filter, ordering and pagination clauses.
//!
//! Clauses name entity properties (field or column names). The builder
//! resolves each name against registered metadata, so caller strings never
//! reach SQL text.

use keel_core::Value;

/// Comparison applied by a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Between,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    Like,
    NotLike,
}

impl Comparator {
    /// SQL operator for the binary comparators.
    pub const fn operator(self) -> &'static str {
        match self {
            Comparator::Eq => "=",
            Comparator::Ne => "<>",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Between => "BETWEEN",
            Comparator::In => "IN",
            Comparator::NotIn => "NOT IN",
            Comparator::IsNull => "IS NULL",
            Comparator::IsNotNull => "IS NOT NULL",
            Comparator::Like => "LIKE",
            Comparator::NotLike => "NOT LIKE",
        }
    }
}

/// Values compared against.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    One(Value),
    Range(Value, Value),
    List(Vec<Value>),
}

/// One predicate on one property.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub property: String,
    pub comparator: Comparator,
    pub operand: Operand,
    /// Compare case-insensitively (`LOWER(col) = LOWER(?)`)
    pub ignore_case: bool,
}

impl Filter {
    fn new(property: impl Into<String>, comparator: Comparator, operand: Operand) -> Self {
        Self {
            property: property.into(),
            comparator,
            operand,
            ignore_case: false,
        }
    }

    pub fn eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(property, Comparator::Eq, Operand::One(value.into()))
    }

    pub fn ne(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(property, Comparator::Ne, Operand::One(value.into()))
    }

    pub fn lt(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(property, Comparator::Lt, Operand::One(value.into()))
    }

    pub fn le(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(property, Comparator::Le, Operand::One(value.into()))
    }

    pub fn gt(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(property, Comparator::Gt, Operand::One(value.into()))
    }

    pub fn ge(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(property, Comparator::Ge, Operand::One(value.into()))
    }

    pub fn between(
        property: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        Self::new(
            property,
            Comparator::Between,
            Operand::Range(low.into(), high.into()),
        )
    }

    pub fn in_list<V: Into<Value>>(
        property: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::new(
            property,
            Comparator::In,
            Operand::List(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn not_in<V: Into<Value>>(
        property: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::new(
            property,
            Comparator::NotIn,
            Operand::List(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn is_null(property: impl Into<String>) -> Self {
        Self::new(property, Comparator::IsNull, Operand::None)
    }

    pub fn is_not_null(property: impl Into<String>) -> Self {
        Self::new(property, Comparator::IsNotNull, Operand::None)
    }

    /// SQL `LIKE` with a caller-supplied pattern (wildcards are honoured).
    pub fn like(property: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(property, Comparator::Like, Operand::One(Value::Text(pattern.into())))
    }

    pub fn not_like(property: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(
            property,
            Comparator::NotLike,
            Operand::One(Value::Text(pattern.into())),
        )
    }

    /// Values starting with `prefix`; wildcards in `prefix` match literally.
    pub fn starts_with(property: impl Into<String>, prefix: &str) -> Self {
        Self::like(property, format!("{}%", escape_like(prefix)))
    }

    pub fn ends_with(property: impl Into<String>, suffix: &str) -> Self {
        Self::like(property, format!("%{}", escape_like(suffix)))
    }

    pub fn contains(property: impl Into<String>, needle: &str) -> Self {
        Self::like(property, format!("%{}%", escape_like(needle)))
    }

    pub fn ignore_case(mut self) -> Self {
        self.ignore_case = true;
        self
    }
}

/// Escape `LIKE` wildcards so `text` matches literally.
pub fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// How a filter combines with the filters before it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Connective {
    #[default]
    And,
    Or,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub const fn as_sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// Ordering on one property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub property: String,
    pub direction: Direction,
}

impl Order {
    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: Direction::Desc,
        }
    }
}

/// Ordered list of [`Order`]s; earlier entries take precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sort {
    orders: Vec<Order>,
}

impl Sort {
    pub fn unsorted() -> Self {
        Self::default()
    }

    /// Sort by `properties` in `direction`.
    pub fn by(direction: Direction, properties: &[&str]) -> Self {
        Self {
            orders: properties
                .iter()
                .map(|p| Order {
                    property: (*p).to_string(),
                    direction,
                })
                .collect(),
        }
    }

    pub fn and(mut self, order: Order) -> Self {
        self.orders.push(order);
        self
    }

    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn is_unsorted(&self) -> bool {
        self.orders.is_empty()
    }
}

impl From<Order> for Sort {
    fn from(order: Order) -> Self {
        Self {
            orders: vec![order],
        }
    }
}

/// Default number of rows per page.
pub const DEFAULT_PAGE_SIZE: u64 = 16;

/// Zero-based page request.
///
/// An unsorted request is ordered by primary key so pages are stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u64,
    pub size: u64,
    pub sort: Sort,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 0,
            size: DEFAULT_PAGE_SIZE,
            sort: Sort::unsorted(),
        }
    }
}

impl PageRequest {
    /// Page `page` of `size` rows; a zero size is raised to 1.
    pub fn of(page: u64, size: u64) -> Self {
        Self {
            page,
            size: size.max(1),
            sort: Sort::unsorted(),
        }
    }

    pub fn with_sort(mut self, sort: impl Into<Sort>) -> Self {
        self.sort = sort.into();
        self
    }

    pub fn offset(&self) -> u64 {
        self.page.saturating_mul(self.size)
    }

    pub fn next(&self) -> Self {
        Self {
            page: self.page.saturating_add(1),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_constructors() {
        let f = Filter::between("age", 18, 30);
        assert_eq!(f.comparator, Comparator::Between);
        assert_eq!(f.operand, Operand::Range(Value::Int(18), Value::Int(30)));

        let f = Filter::in_list("id", [1_i64, 2, 3]);
        assert_eq!(
            f.operand,
            Operand::List(vec![Value::BigInt(1), Value::BigInt(2), Value::BigInt(3)])
        );

        assert!(Filter::eq("name", "ana").ignore_case().ignore_case);
        assert_eq!(Filter::is_null("email").operand, Operand::None);
    }

    #[test]
    fn like_helpers_escape_wildcards() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        let f = Filter::starts_with("name", "a_b");
        assert_eq!(f.operand, Operand::One(Value::Text("a\\_b%".into())));
        let f = Filter::contains("name", "x");
        assert_eq!(f.operand, Operand::One(Value::Text("%x%".into())));
        let f = Filter::ends_with("name", "z");
        assert_eq!(f.operand, Operand::One(Value::Text("%z".into())));
    }

    #[test]
    fn sort_building() {
        let sort = Sort::by(Direction::Desc, &["name", "id"]).and(Order::asc("email"));
        assert_eq!(sort.orders().len(), 3);
        assert_eq!(sort.orders()[0], Order::desc("name"));
        assert!(Sort::unsorted().is_unsorted());
    }

    #[test]
    fn page_defaults_and_offsets() {
        let page = PageRequest::default();
        assert_eq!(page.page, 0);
        assert_eq!(page.size, DEFAULT_PAGE_SIZE);
        assert_eq!(page.offset(), 0);

        let page = PageRequest::of(3, 10).with_sort(Order::desc("id"));
        assert_eq!(page.offset(), 30);
        assert_eq!(page.next().offset(), 40);
        assert_eq!(PageRequest::of(0, 0).size, 1);
    }
}
