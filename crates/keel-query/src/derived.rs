//! Finder queries derived from method-style names.
//!
//! A name such as `findByNameAndAgeGreaterThanOrderByNameDesc` is parsed
//! once against an entity's metadata into a [`DerivedQuery`], which then
//! turns a list of arguments into a [`QuerySpec`]:
//!
//! ```text
//! findBy  Name  And  Age GreaterThan  OrderBy Name Desc
//! subject  ^criterion^  ^ criterion ^          ^ order ^
//! ```
//!
//! Property names are CamelCase in the finder and are matched against the
//! entity's field names and (after conversion to snake_case) column names.

use std::sync::OnceLock;

use regex::Regex;

use keel_core::{EntityMetadata, Error, QueryErrorKind, Result, Value, camel_to_snake};

use crate::clause::{Connective, Direction, Filter, Order, Sort};
use crate::query::{Operation, QuerySpec};

/// One finder argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Value(Value),
    /// Argument of an `In` / `NotIn` criterion
    List(Vec<Value>),
}

impl Arg {
    pub fn list<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Self {
        Arg::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<T> for Arg {
    fn from(value: T) -> Self {
        Arg::Value(value.into())
    }
}

/// What a derived query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Find,
    Count,
    Exists,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keyword {
    Eq,
    Not,
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
    StartingWith,
    EndingWith,
    Containing,
    True,
    False,
}

impl Keyword {
    fn arity(self) -> usize {
        match self {
            Keyword::IsNull | Keyword::IsNotNull | Keyword::True | Keyword::False => 0,
            Keyword::Between => 2,
            _ => 1,
        }
    }
}

// Longer spellings precede the shorter ones they end with.
const KEYWORDS: &[(&str, Keyword)] = &[
    ("IsNotNull", Keyword::IsNotNull),
    ("NotNull", Keyword::IsNotNull),
    ("IsNull", Keyword::IsNull),
    ("Null", Keyword::IsNull),
    ("IsLessThanEqual", Keyword::Le),
    ("LessThanEqual", Keyword::Le),
    ("IsLessThan", Keyword::Lt),
    ("LessThan", Keyword::Lt),
    ("IsGreaterThanEqual", Keyword::Ge),
    ("GreaterThanEqual", Keyword::Ge),
    ("IsGreaterThan", Keyword::Gt),
    ("GreaterThan", Keyword::Gt),
    ("IsBefore", Keyword::Lt),
    ("Before", Keyword::Lt),
    ("IsAfter", Keyword::Gt),
    ("After", Keyword::Gt),
    ("IsBetween", Keyword::Between),
    ("Between", Keyword::Between),
    ("IsNotLike", Keyword::NotLike),
    ("NotLike", Keyword::NotLike),
    ("IsLike", Keyword::Like),
    ("Like", Keyword::Like),
    ("IsStartingWith", Keyword::StartingWith),
    ("StartingWith", Keyword::StartingWith),
    ("StartsWith", Keyword::StartingWith),
    ("IsEndingWith", Keyword::EndingWith),
    ("EndingWith", Keyword::EndingWith),
    ("EndsWith", Keyword::EndingWith),
    ("IsContaining", Keyword::Containing),
    ("Containing", Keyword::Containing),
    ("Contains", Keyword::Containing),
    ("IsNotIn", Keyword::NotIn),
    ("NotIn", Keyword::NotIn),
    ("IsIn", Keyword::In),
    ("In", Keyword::In),
    ("IsTrue", Keyword::True),
    ("True", Keyword::True),
    ("IsFalse", Keyword::False),
    ("False", Keyword::False),
    ("IsNot", Keyword::Not),
    ("Not", Keyword::Not),
    ("Equals", Keyword::Eq),
    ("Is", Keyword::Eq),
];

#[derive(Debug, Clone, PartialEq, Eq)]
struct Criterion {
    connective: Connective,
    /// Field name the criterion resolved to
    field: &'static str,
    keyword: Keyword,
    ignore_case: bool,
}

/// A parsed finder name, bound to one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedQuery {
    subject: Subject,
    /// Subject came from a `findBy`-style prefix rather than a bare expression
    prefixed: bool,
    criteria: Vec<Criterion>,
    sort: Sort,
}

fn prefix_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"^(find|read|get|query|search|stream|count|exists|delete|remove)[A-Za-z0-9]*?By([A-Z][A-Za-z0-9]*)$",
            )
            .ok()
        })
        .as_ref()
}

fn order_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"([A-Z][A-Za-z0-9]*?)(Asc|Desc)").ok())
        .as_ref()
}

impl DerivedQuery {
    /// Parse `name` against `meta`.
    ///
    /// Accepts `findBy...` style names (also `count`, `exists`, `delete` and
    /// their synonyms) or a bare criteria expression such as `NameAndAge`.
    #[allow(clippy::result_large_err)]
    pub fn parse(name: &str, meta: &EntityMetadata) -> Result<Self> {
        let (subject, prefixed, body) = split_subject(name)?;

        let (criteria_text, order_text) = match body.find("OrderBy") {
            Some(at) => (&body[..at], Some(&body[at + "OrderBy".len()..])),
            None => (body, None),
        };

        let (criteria_text, all_ignore_case) = match criteria_text.strip_suffix("AllIgnoreCase") {
            Some(rest) => (rest, true),
            None => match criteria_text.strip_suffix("AllIgnoringCase") {
                Some(rest) => (rest, true),
                None => (criteria_text, false),
            },
        };

        let mut criteria = Vec::new();
        for (connective, part) in split_criteria(criteria_text) {
            let mut criterion = parse_criterion(part, meta, name)?;
            criterion.connective = connective;
            criterion.ignore_case |= all_ignore_case;
            criteria.push(criterion);
        }
        if criteria.is_empty() {
            return Err(invalid(name, "no criteria"));
        }

        let sort = match order_text {
            Some(text) => parse_order(text, meta, name)?,
            None => Sort::unsorted(),
        };

        tracing::trace!(finder = name, criteria = criteria.len(), "parsed derived query");
        Ok(Self {
            subject,
            prefixed,
            criteria,
            sort,
        })
    }

    pub fn subject(&self) -> Subject {
        self.subject
    }

    /// Run the finder as `subject`.
    ///
    /// A bare criteria expression takes any subject; a prefixed name must
    /// already agree with it (`countByAge` cannot be run as a find).
    #[allow(clippy::result_large_err)]
    pub fn as_subject(mut self, subject: Subject) -> Result<Self> {
        if self.prefixed && self.subject != subject {
            return Err(Error::query(
                QueryErrorKind::InvalidFinder,
                format!("finder is a {:?} query, not {:?}", self.subject, subject),
            ));
        }
        self.subject = subject;
        Ok(self)
    }

    /// Number of arguments the finder consumes.
    pub fn arity(&self) -> usize {
        self.criteria.iter().map(|c| c.keyword.arity()).sum()
    }

    /// Bind `args` to the criteria, in order.
    #[allow(clippy::result_large_err)]
    pub fn to_spec(&self, args: Vec<Arg>) -> Result<QuerySpec> {
        if args.len() != self.arity() {
            return Err(Error::query(
                QueryErrorKind::InvalidFinder,
                format!(
                    "finder takes {} argument(s), {} supplied",
                    self.arity(),
                    args.len()
                ),
            ));
        }

        let mut spec = QuerySpec {
            operation: match self.subject {
                Subject::Find => Operation::Select,
                Subject::Count | Subject::Exists => Operation::Count,
                Subject::Delete => Operation::Delete,
            },
            sort: self.sort.clone(),
            ..QuerySpec::default()
        };

        let mut args = args.into_iter();
        for criterion in &self.criteria {
            let filter = criterion.filter(&mut args)?;
            spec.filters.push((criterion.connective, filter));
        }
        Ok(spec)
    }
}

impl Criterion {
    #[allow(clippy::result_large_err)]
    fn filter(&self, args: &mut impl Iterator<Item = Arg>) -> Result<Filter> {
        let field = self.field;
        let mut scalar = || match args.next() {
            Some(Arg::Value(v)) => Ok(v),
            Some(Arg::List(_)) => Err(Error::query(
                QueryErrorKind::InvalidFinder,
                format!("'{}' takes a single value, not a list", field),
            )),
            None => Err(Error::query(
                QueryErrorKind::InvalidFinder,
                format!("missing argument for '{}'", field),
            )),
        };

        let filter = match self.keyword {
            Keyword::Eq => Filter::eq(field, scalar()?),
            Keyword::Not => Filter::ne(field, scalar()?),
            Keyword::Lt => Filter::lt(field, scalar()?),
            Keyword::Le => Filter::le(field, scalar()?),
            Keyword::Gt => Filter::gt(field, scalar()?),
            Keyword::Ge => Filter::ge(field, scalar()?),
            Keyword::Between => {
                let low = scalar()?;
                let high = scalar()?;
                Filter::between(field, low, high)
            }
            Keyword::Like => Filter::like(field, text_arg(field, scalar()?)?),
            Keyword::NotLike => Filter::not_like(field, text_arg(field, scalar()?)?),
            Keyword::StartingWith => Filter::starts_with(field, &text_arg(field, scalar()?)?),
            Keyword::EndingWith => Filter::ends_with(field, &text_arg(field, scalar()?)?),
            Keyword::Containing => Filter::contains(field, &text_arg(field, scalar()?)?),
            Keyword::IsNull => Filter::is_null(field),
            Keyword::IsNotNull => Filter::is_not_null(field),
            Keyword::True => Filter::eq(field, true),
            Keyword::False => Filter::eq(field, false),
            Keyword::In | Keyword::NotIn => {
                let values = match args.next() {
                    Some(Arg::List(values)) => values,
                    Some(Arg::Value(v)) => vec![v],
                    None => {
                        return Err(Error::query(
                            QueryErrorKind::InvalidFinder,
                            format!("missing argument for '{}'", field),
                        ));
                    }
                };
                if self.keyword == Keyword::In {
                    Filter::in_list(field, values)
                } else {
                    Filter::not_in(field, values)
                }
            }
        };
        Ok(if self.ignore_case {
            filter.ignore_case()
        } else {
            filter
        })
    }
}

#[allow(clippy::result_large_err)]
fn text_arg(field: &str, value: Value) -> Result<String> {
    match value {
        Value::Text(s) => Ok(s),
        other => Err(Error::query(
            QueryErrorKind::InvalidFinder,
            format!("'{}' needs a text argument, got {}", field, other.type_name()),
        )),
    }
}

#[allow(clippy::result_large_err)]
fn split_subject(name: &str) -> Result<(Subject, bool, &str)> {
    if let Some(caps) = prefix_pattern().and_then(|re| re.captures(name)) {
        let subject = match caps.get(1).map_or("", |m| m.as_str()) {
            "count" => Subject::Count,
            "exists" => Subject::Exists,
            "delete" | "remove" => Subject::Delete,
            _ => Subject::Find,
        };
        let body = caps.get(2).map_or("", |m| m.as_str());
        return Ok((subject, true, body));
    }
    if name.starts_with(|c: char| c.is_ascii_uppercase()) {
        return Ok((Subject::Find, false, name));
    }
    Err(invalid(name, "expected findBy<Criteria> or a CamelCase criteria expression"))
}

/// Split on `And` / `Or` where the keyword is followed by an uppercase letter
/// and is not at the start of the text.
fn split_criteria(text: &str) -> Vec<(Connective, &str)> {
    let bytes = text.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut connective = Connective::And;
    let mut i = 1;
    while i < bytes.len() {
        let rest = &text[i..];
        let found = if rest.starts_with("And") {
            Some((Connective::And, 3))
        } else if rest.starts_with("Or") {
            Some((Connective::Or, 2))
        } else {
            None
        };
        if let Some((next, len)) = found {
            let after = bytes.get(i + len);
            if i > start && after.is_some_and(u8::is_ascii_uppercase) {
                parts.push((connective, &text[start..i]));
                connective = next;
                start = i + len;
                i = start + 1;
                continue;
            }
        }
        i += 1;
    }
    if start < text.len() {
        parts.push((connective, &text[start..]));
    }
    parts
}

#[allow(clippy::result_large_err)]
fn parse_criterion(part: &str, meta: &EntityMetadata, name: &str) -> Result<Criterion> {
    let (part, ignore_case) = match part.strip_suffix("IgnoreCase") {
        Some(rest) => (rest, true),
        None => match part.strip_suffix("IgnoringCase") {
            Some(rest) => (rest, true),
            None => (part, false),
        },
    };

    for (suffix, keyword) in KEYWORDS {
        if let Some(property) = part.strip_suffix(suffix) {
            if property.is_empty() {
                continue;
            }
            if let Some(field) = resolve_property(property, meta) {
                return Ok(Criterion {
                    connective: Connective::And,
                    field,
                    keyword: *keyword,
                    ignore_case,
                });
            }
        }
    }
    match resolve_property(part, meta) {
        Some(field) => Ok(Criterion {
            connective: Connective::And,
            field,
            keyword: Keyword::Eq,
            ignore_case,
        }),
        None => Err(Error::query(
            QueryErrorKind::UnknownColumn,
            format!(
                "finder '{}': {} has no property '{}'",
                name,
                meta.entity_name(),
                part
            ),
        )),
    }
}

#[allow(clippy::result_large_err)]
fn parse_order(text: &str, meta: &EntityMetadata, name: &str) -> Result<Sort> {
    let unknown = |property: &str| {
        Error::query(
            QueryErrorKind::UnknownColumn,
            format!("finder '{}': cannot order by '{}'", name, property),
        )
    };

    let mut sort = Sort::unsorted();
    let mut covered = 0;
    if let Some(re) = order_pattern() {
        for caps in re.captures_iter(text) {
            let (Some(whole), Some(property), Some(direction)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            if whole.start() != covered {
                break;
            }
            covered = whole.end();
            let field = resolve_property(property.as_str(), meta)
                .ok_or_else(|| unknown(property.as_str()))?;
            sort = sort.and(match direction.as_str() {
                "Desc" => Order::desc(field),
                _ => Order::asc(field),
            });
        }
    }

    if covered == text.len() && !sort.is_unsorted() {
        return Ok(sort);
    }
    if covered == 0 && !text.is_empty() {
        let field = resolve_property(text, meta).ok_or_else(|| unknown(text))?;
        return Ok(Sort::by(Direction::Asc, &[field]));
    }
    Err(invalid(name, "malformed OrderBy clause"))
}

/// Resolve a CamelCase finder property to a field name.
fn resolve_property(property: &str, meta: &EntityMetadata) -> Option<&'static str> {
    let snake = camel_to_snake(property);
    let mut chars = property.chars();
    let lower_first = match chars.next() {
        Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
        None => return None,
    };
    meta.column(&lower_first)
        .or_else(|| meta.column(&snake))
        .map(|c| c.field)
}

fn invalid(name: &str, reason: &str) -> Error {
    Error::query(
        QueryErrorKind::InvalidFinder,
        format!("cannot parse finder '{}': {}", name, reason),
    )
}
