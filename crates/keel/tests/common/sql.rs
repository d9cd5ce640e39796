//! A tiny interpreter for the statement shapes Keel renders.
//!
//! Supported: `INSERT ... VALUES (...) [RETURNING col]`, `SELECT` with
//! qualified and aliased columns, `COUNT(*)`, `LEFT JOIN` / `INNER JOIN`,
//! `WHERE` with `AND`/`OR`/parentheses and every comparator the builder
//! emits, `ORDER BY`, `LIMIT`/`OFFSET`, `UPDATE ... SET`, `DELETE`, and
//! the transaction statements.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use keel::{Row, Value};

pub type Record = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
pub struct Table {
    /// Column assigned from a counter when an insert leaves it out
    pub key: Option<String>,
    pub unique: Vec<String>,
    pub rows: Vec<Record>,
    next_id: i64,
}

pub enum Output {
    Rows(Vec<Row>),
    /// Affected rows and the generated key, if any
    Affected(u64, Option<i64>),
}

impl Output {
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Output::Rows(rows) => rows,
            Output::Affected(..) => Vec::new(),
        }
    }

    pub fn affected(&self) -> u64 {
        match self {
            Output::Rows(rows) => rows.len() as u64,
            Output::Affected(n, _) => *n,
        }
    }

    pub fn last_insert_id(&self) -> i64 {
        match self {
            Output::Affected(_, Some(id)) => *id,
            _ => 0,
        }
    }
}

pub enum Violation {
    Unique(String),
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Word(String),
    Param(usize),
    Number(i64),
    Sym(&'static str),
}

fn tokenize(sql: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut next_param = 0;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '"' | '`' => {
                let mut name = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated identifier".to_string()),
                        Some(&q) if q == c => {
                            if chars.get(i + 1) == Some(&c) {
                                name.push(c);
                                i += 2;
                            } else {
                                i += 1;
                                break;
                            }
                        }
                        Some(&other) => {
                            name.push(other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Ident(name));
            }
            '$' => {
                let start = i + 1;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let n: usize = chars[start..i]
                    .iter()
                    .collect::<String>()
                    .parse()
                    .map_err(|_| "bad placeholder".to_string())?;
                if n == 0 {
                    return Err("placeholders start at $1".to_string());
                }
                tokens.push(Token::Param(n - 1));
            }
            '?' => {
                tokens.push(Token::Param(next_param));
                next_param += 1;
                i += 1;
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let digits: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(digits.parse().unwrap_or(i64::MAX)));
            }
            '<' => {
                let (sym, len) = match chars.get(i + 1) {
                    Some('=') => ("<=", 2),
                    Some('>') => ("<>", 2),
                    _ => ("<", 1),
                };
                tokens.push(Token::Sym(sym));
                i += len;
            }
            '>' => {
                let (sym, len) = match chars.get(i + 1) {
                    Some('=') => (">=", 2),
                    _ => (">", 1),
                };
                tokens.push(Token::Sym(sym));
                i += len;
            }
            '=' | '(' | ')' | ',' | '.' | '*' => {
                let sym = match c {
                    '=' => "=",
                    '(' => "(",
                    ')' => ")",
                    ',' => ",",
                    '.' => ".",
                    _ => "*",
                };
                tokens.push(Token::Sym(sym));
                i += 1;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token::Word(word.to_ascii_uppercase()));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
pub enum Operand {
    Column(Option<String>, String),
    Literal(Value),
    Lower(Box<Operand>),
}

#[derive(Debug, Clone)]
pub enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Compare(Operand, &'static str, Operand),
    IsNull(Operand, bool),
    In(Operand, Vec<Operand>, bool),
    Like(Operand, Operand, bool),
    Between(Operand, Operand, Operand),
}

#[derive(Debug)]
pub enum Item {
    CountStar,
    Column(Operand, Option<String>),
}

#[derive(Debug)]
pub struct Join {
    table: String,
    alias: String,
    outer: bool,
    on: Expr,
}

#[derive(Debug)]
pub struct Select {
    items: Vec<Item>,
    from: String,
    joins: Vec<Join>,
    filter: Option<Expr>,
    order: Vec<(Operand, bool)>,
    limit: Option<Operand>,
    offset: Option<Operand>,
}

#[derive(Debug)]
pub enum Statement {
    Begin,
    Commit,
    Rollback,
    Select(Select),
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<Operand>,
        returning: Option<String>,
    },
    Update {
        table: String,
        sets: Vec<(String, Operand)>,
        filter: Option<Expr>,
    },
    Delete {
        table: String,
        filter: Option<Expr>,
    },
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    params: &'a [Value],
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, String> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| "unexpected end of statement".to_string())?;
        self.pos += 1;
        Ok(token)
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Word(w)) if w == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_word(&mut self, word: &str) -> Result<(), String> {
        if self.eat_word(word) {
            Ok(())
        } else {
            Err(format!("expected {word}, found {:?}", self.peek()))
        }
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Some(Token::Sym(s)) if *s == sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: &str) -> Result<(), String> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(format!("expected '{sym}', found {:?}", self.peek()))
        }
    }

    fn ident(&mut self) -> Result<String, String> {
        match self.next()? {
            Token::Ident(name) => Ok(name),
            other => Err(format!("expected identifier, found {other:?}")),
        }
    }

    fn finish(&self) -> Result<(), String> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(format!("trailing input at {token:?}")),
        }
    }

    fn operand(&mut self) -> Result<Operand, String> {
        match self.next()? {
            Token::Ident(first) => {
                if self.eat_sym(".") {
                    Ok(Operand::Column(Some(first), self.ident()?))
                } else {
                    Ok(Operand::Column(None, first))
                }
            }
            Token::Param(i) => self
                .params
                .get(i)
                .cloned()
                .map(Operand::Literal)
                .ok_or_else(|| format!("no value bound for parameter {}", i + 1)),
            Token::Number(n) => Ok(Operand::Literal(Value::BigInt(n))),
            Token::Word(w) if w == "LOWER" => {
                self.expect_sym("(")?;
                let inner = self.operand()?;
                self.expect_sym(")")?;
                Ok(Operand::Lower(Box::new(inner)))
            }
            other => Err(format!("expected operand, found {other:?}")),
        }
    }

    fn or_expr(&mut self) -> Result<Expr, String> {
        let mut terms = vec![self.and_expr()?];
        while self.eat_word("OR") {
            terms.push(self.and_expr()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::Or(terms)
        })
    }

    fn and_expr(&mut self) -> Result<Expr, String> {
        let mut terms = vec![self.predicate()?];
        while self.eat_word("AND") {
            terms.push(self.predicate()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::And(terms)
        })
    }

    fn predicate(&mut self) -> Result<Expr, String> {
        if self.eat_sym("(") {
            let inner = self.or_expr()?;
            self.expect_sym(")")?;
            return Ok(inner);
        }
        let left = self.operand()?;
        if self.eat_word("IS") {
            let negated = self.eat_word("NOT");
            self.expect_word("NULL")?;
            return Ok(Expr::IsNull(left, negated));
        }
        let negated = self.eat_word("NOT");
        if self.eat_word("IN") {
            self.expect_sym("(")?;
            let mut list = vec![self.operand()?];
            while self.eat_sym(",") {
                list.push(self.operand()?);
            }
            self.expect_sym(")")?;
            return Ok(Expr::In(left, list, negated));
        }
        if self.eat_word("LIKE") {
            return Ok(Expr::Like(left, self.operand()?, negated));
        }
        if negated {
            return Err("NOT must be followed by IN or LIKE".to_string());
        }
        if self.eat_word("BETWEEN") {
            let low = self.operand()?;
            self.expect_word("AND")?;
            let high = self.operand()?;
            return Ok(Expr::Between(left, low, high));
        }
        match self.next()? {
            Token::Sym(op @ ("=" | "<>" | "<" | "<=" | ">" | ">=")) => {
                Ok(Expr::Compare(left, op, self.operand()?))
            }
            other => Err(format!("expected comparison, found {other:?}")),
        }
    }

    fn filter(&mut self) -> Result<Option<Expr>, String> {
        if self.eat_word("WHERE") {
            self.or_expr().map(Some)
        } else {
            Ok(None)
        }
    }

    fn statement(&mut self) -> Result<Statement, String> {
        let statement = match self.next()? {
            Token::Word(w) if w == "BEGIN" => Statement::Begin,
            Token::Word(w) if w == "START" => {
                self.expect_word("TRANSACTION")?;
                Statement::Begin
            }
            Token::Word(w) if w == "COMMIT" => Statement::Commit,
            Token::Word(w) if w == "ROLLBACK" => Statement::Rollback,
            Token::Word(w) if w == "SELECT" => Statement::Select(self.select()?),
            Token::Word(w) if w == "INSERT" => self.insert()?,
            Token::Word(w) if w == "UPDATE" => self.update()?,
            Token::Word(w) if w == "DELETE" => {
                self.expect_word("FROM")?;
                let table = self.ident()?;
                let filter = self.filter()?;
                Statement::Delete { table, filter }
            }
            other => return Err(format!("unsupported statement starting with {other:?}")),
        };
        self.finish()?;
        Ok(statement)
    }

    fn select(&mut self) -> Result<Select, String> {
        let mut items = Vec::new();
        loop {
            if self.eat_word("COUNT") {
                self.expect_sym("(")?;
                self.expect_sym("*")?;
                self.expect_sym(")")?;
                items.push(Item::CountStar);
            } else {
                let operand = self.operand()?;
                let alias = if self.eat_word("AS") {
                    Some(self.ident()?)
                } else {
                    None
                };
                items.push(Item::Column(operand, alias));
            }
            if !self.eat_sym(",") {
                break;
            }
        }

        self.expect_word("FROM")?;
        let from = self.ident()?;
        let mut joins = Vec::new();
        loop {
            let outer = if self.eat_word("LEFT") {
                true
            } else if self.eat_word("INNER") {
                false
            } else {
                break;
            };
            self.expect_word("JOIN")?;
            let table = self.ident()?;
            let alias = if self.eat_word("AS") {
                self.ident()?
            } else {
                table.clone()
            };
            self.expect_word("ON")?;
            let on = self.or_expr()?;
            joins.push(Join {
                table,
                alias,
                outer,
                on,
            });
        }

        let filter = self.filter()?;
        let mut order = Vec::new();
        if self.eat_word("ORDER") {
            self.expect_word("BY")?;
            loop {
                let key = self.operand()?;
                let descending = if self.eat_word("DESC") {
                    true
                } else {
                    self.eat_word("ASC");
                    false
                };
                order.push((key, descending));
                if !self.eat_sym(",") {
                    break;
                }
            }
        }
        let limit = if self.eat_word("LIMIT") {
            Some(self.operand()?)
        } else {
            None
        };
        let offset = if self.eat_word("OFFSET") {
            Some(self.operand()?)
        } else {
            None
        };

        Ok(Select {
            items,
            from,
            joins,
            filter,
            order,
            limit,
            offset,
        })
    }

    fn insert(&mut self) -> Result<Statement, String> {
        self.expect_word("INTO")?;
        let table = self.ident()?;
        self.expect_sym("(")?;
        let mut columns = vec![self.ident()?];
        while self.eat_sym(",") {
            columns.push(self.ident()?);
        }
        self.expect_sym(")")?;
        self.expect_word("VALUES")?;
        self.expect_sym("(")?;
        let mut values = vec![self.operand()?];
        while self.eat_sym(",") {
            values.push(self.operand()?);
        }
        self.expect_sym(")")?;
        if columns.len() != values.len() {
            return Err("column and value counts differ".to_string());
        }
        let returning = if self.eat_word("RETURNING") {
            Some(self.ident()?)
        } else {
            None
        };
        Ok(Statement::Insert {
            table,
            columns,
            values,
            returning,
        })
    }

    fn update(&mut self) -> Result<Statement, String> {
        let table = self.ident()?;
        self.expect_word("SET")?;
        let mut sets = Vec::new();
        loop {
            let column = self.ident()?;
            self.expect_sym("=")?;
            sets.push((column, self.operand()?));
            if !self.eat_sym(",") {
                break;
            }
        }
        let filter = self.filter()?;
        Ok(Statement::Update {
            table,
            sets,
            filter,
        })
    }
}

pub fn parse(sql: &str, params: &[Value]) -> Result<Statement, String> {
    let mut parser = Parser {
        tokens: tokenize(sql)?,
        pos: 0,
        params,
    };
    parser.statement()
}

/// Rows visible to an expression, by table name or alias.
struct Scope<'r> {
    sources: Vec<(&'r str, Option<&'r Record>)>,
}

impl Scope<'_> {
    fn column(&self, qualifier: Option<&str>, column: &str) -> Result<Value, Violation> {
        let source = match qualifier {
            Some(q) => self.sources.iter().find(|(name, _)| *name == q),
            None => self.sources.first(),
        };
        match source {
            Some((_, Some(record))) => Ok(record.get(column).cloned().unwrap_or(Value::Null)),
            Some((_, None)) => Ok(Value::Null),
            None => Err(Violation::Invalid(format!(
                "unknown qualifier {}",
                qualifier.unwrap_or_default()
            ))),
        }
    }

    fn value(&self, operand: &Operand) -> Result<Value, Violation> {
        match operand {
            Operand::Column(q, c) => self.column(q.as_deref(), c),
            Operand::Literal(v) => Ok(v.clone()),
            Operand::Lower(inner) => Ok(match self.value(inner)? {
                Value::Text(s) => Value::Text(s.to_lowercase()),
                other => other,
            }),
        }
    }

    fn test(&self, expr: &Expr) -> Result<bool, Violation> {
        Ok(match expr {
            Expr::Or(terms) => {
                for term in terms {
                    if self.test(term)? {
                        return Ok(true);
                    }
                }
                false
            }
            Expr::And(terms) => {
                for term in terms {
                    if !self.test(term)? {
                        return Ok(false);
                    }
                }
                true
            }
            Expr::Compare(left, op, right) => {
                let ordering = compare(&self.value(left)?, &self.value(right)?);
                match (ordering, *op) {
                    (None, _) => false,
                    (Some(o), "=") => o == Ordering::Equal,
                    (Some(o), "<>") => o != Ordering::Equal,
                    (Some(o), "<") => o == Ordering::Less,
                    (Some(o), "<=") => o != Ordering::Greater,
                    (Some(o), ">") => o == Ordering::Greater,
                    (Some(o), _) => o != Ordering::Less,
                }
            }
            Expr::IsNull(operand, negated) => self.value(operand)?.is_null() != *negated,
            Expr::In(operand, list, negated) => {
                let value = self.value(operand)?;
                if value.is_null() {
                    return Ok(false);
                }
                let mut found = false;
                for item in list {
                    if compare(&value, &self.value(item)?) == Some(Ordering::Equal) {
                        found = true;
                        break;
                    }
                }
                found != *negated
            }
            Expr::Like(operand, pattern, negated) => {
                match (self.value(operand)?, self.value(pattern)?) {
                    (Value::Text(text), Value::Text(pattern)) => {
                        like(&text.chars().collect::<Vec<_>>(), &pattern.chars().collect::<Vec<_>>())
                            != *negated
                    }
                    _ => false,
                }
            }
            Expr::Between(operand, low, high) => {
                let value = self.value(operand)?;
                let above = compare(&value, &self.value(low)?);
                let below = compare(&value, &self.value(high)?);
                matches!(above, Some(Ordering::Greater | Ordering::Equal))
                    && matches!(below, Some(Ordering::Less | Ordering::Equal))
            }
        })
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Timestamp(x), Value::Timestamp(y)) | (Value::Time(x), Value::Time(y)) => {
            Some(x.cmp(y))
        }
        (Value::Date(x), Value::Date(y)) => Some(x.cmp(y)),
        (Value::Double(_), _) | (_, Value::Double(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        _ => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => (a == b).then_some(Ordering::Equal),
        },
    }
}

/// SQL `LIKE` with `%`, `_` and backslash escapes.
fn like(text: &[char], pattern: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('%') => (0..=text.len()).any(|skip| like(&text[skip..], &pattern[1..])),
        Some('_') => !text.is_empty() && like(&text[1..], &pattern[1..]),
        Some('\\') if pattern.len() > 1 => {
            text.first() == Some(&pattern[1]) && like(&text[1..], &pattern[2..])
        }
        Some(c) => text.first() == Some(c) && like(&text[1..], &pattern[1..]),
    }
}

fn count_of(value: &Value) -> usize {
    value
        .as_i64()
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(usize::MAX)
}

pub fn execute(tables: &mut BTreeMap<String, Table>, statement: Statement) -> Result<Output, Violation> {
    match statement {
        Statement::Select(select) => run_select(tables, &select).map(Output::Rows),
        Statement::Insert {
            table,
            columns,
            values,
            returning,
        } => {
            let table_name = table;
            let table = tables.entry(table_name.clone()).or_default();
            let scope = Scope {
                sources: Vec::new(),
            };
            let mut record = Record::new();
            for (column, operand) in columns.into_iter().zip(&values) {
                record.insert(column, scope.value(operand)?);
            }

            let mut generated = None;
            if let Some(key) = table.key.clone() {
                match record.get(&key).and_then(Value::as_i64) {
                    Some(explicit) => table.next_id = table.next_id.max(explicit),
                    None => {
                        table.next_id += 1;
                        generated = Some(table.next_id);
                        record.insert(key, Value::BigInt(table.next_id));
                    }
                }
            }

            let mut unique = table.unique.clone();
            unique.extend(table.key.clone());
            for column in &unique {
                let Some(value) = record.get(column).filter(|v| !v.is_null()) else {
                    continue;
                };
                if table
                    .rows
                    .iter()
                    .any(|row| row.get(column).is_some_and(|v| compare(v, value) == Some(Ordering::Equal)))
                {
                    return Err(Violation::Unique(format!("{table_name}.{column}")));
                }
            }

            let output = match returning {
                Some(column) => {
                    let value = record.get(&column).cloned().unwrap_or(Value::Null);
                    Output::Rows(vec![Row::new(vec![column], vec![value])])
                }
                None => Output::Affected(1, generated),
            };
            table.rows.push(record);
            Ok(output)
        }
        Statement::Update {
            table: name,
            sets,
            filter,
        } => {
            let table = tables.entry(name.clone()).or_default();
            let mut matched = 0;
            for row in &mut table.rows {
                let scope = Scope {
                    sources: vec![(name.as_str(), Some(&*row))],
                };
                if let Some(filter) = &filter {
                    if !scope.test(filter)? {
                        continue;
                    }
                }
                let mut assigned = Vec::with_capacity(sets.len());
                for (column, operand) in &sets {
                    assigned.push((column.clone(), scope.value(operand)?));
                }
                row.extend(assigned);
                matched += 1;
            }
            Ok(Output::Affected(matched, None))
        }
        Statement::Delete {
            table: name,
            filter,
        } => {
            let table = tables.entry(name.clone()).or_default();
            let mut kept = Vec::with_capacity(table.rows.len());
            let mut removed = 0;
            for row in std::mem::take(&mut table.rows) {
                let matches = match &filter {
                    None => true,
                    Some(filter) => Scope {
                        sources: vec![(name.as_str(), Some(&row))],
                    }
                    .test(filter)?,
                };
                if matches {
                    removed += 1;
                } else {
                    kept.push(row);
                }
            }
            table.rows = kept;
            Ok(Output::Affected(removed, None))
        }
        Statement::Begin | Statement::Commit | Statement::Rollback => Ok(Output::Affected(0, None)),
    }
}

fn rows_of<'t>(tables: &'t BTreeMap<String, Table>, name: &str) -> &'t [Record] {
    tables.get(name).map_or(&[], |t| t.rows.as_slice())
}

fn run_select(tables: &BTreeMap<String, Table>, select: &Select) -> Result<Vec<Row>, Violation> {
    let mut combos: Vec<Vec<(&str, Option<&Record>)>> = rows_of(tables, &select.from)
        .iter()
        .map(|row| vec![(select.from.as_str(), Some(row))])
        .collect();
    for join in &select.joins {
        let mut next = Vec::new();
        for combo in combos {
            let mut matched = false;
            for candidate in rows_of(tables, &join.table) {
                let mut sources = combo.clone();
                sources.push((join.alias.as_str(), Some(candidate)));
                let scope = Scope { sources };
                if scope.test(&join.on)? {
                    matched = true;
                    next.push(scope.sources);
                }
            }
            if !matched && join.outer {
                let mut sources = combo.clone();
                sources.push((join.alias.as_str(), None));
                next.push(sources);
            }
        }
        combos = next;
    }

    let mut scopes = Vec::with_capacity(combos.len());
    for sources in combos {
        let scope = Scope { sources };
        let keep = match &select.filter {
            Some(filter) => scope.test(filter)?,
            None => true,
        };
        if keep {
            scopes.push(scope);
        }
    }

    if select.items.iter().any(|item| matches!(item, Item::CountStar)) {
        let count = i64::try_from(scopes.len()).unwrap_or(i64::MAX);
        return Ok(vec![Row::new(vec!["count".to_string()], vec![Value::BigInt(count)])]);
    }

    let mut keyed = Vec::with_capacity(scopes.len());
    for scope in scopes {
        let mut keys = Vec::with_capacity(select.order.len());
        for (operand, _) in &select.order {
            keys.push(scope.value(operand)?);
        }
        keyed.push((keys, scope));
    }
    keyed.sort_by(|(a, _), (b, _)| {
        for ((x, y), (_, descending)) in a.iter().zip(b).zip(&select.order) {
            // nulls sort last
            let ordering = match (x.is_null(), y.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => compare(x, y).unwrap_or(Ordering::Equal),
            };
            let ordering = if *descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });

    let no_scope = Scope {
        sources: Vec::new(),
    };
    let offset = match &select.offset {
        Some(operand) => count_of(&no_scope.value(operand)?),
        None => 0,
    };
    let limit = match &select.limit {
        Some(operand) => count_of(&no_scope.value(operand)?),
        None => usize::MAX,
    };

    let names: Vec<String> = select
        .items
        .iter()
        .map(|item| match item {
            Item::Column(_, Some(alias)) => alias.clone(),
            Item::Column(Operand::Column(_, column), None) => column.clone(),
            _ => "?column?".to_string(),
        })
        .collect();

    let mut rows = Vec::new();
    for (_, scope) in keyed.into_iter().skip(offset).take(limit) {
        let mut values = Vec::with_capacity(select.items.len());
        for item in &select.items {
            if let Item::Column(operand, _) = item {
                values.push(scope.value(operand)?);
            }
        }
        rows.push(Row::new(names.clone(), values));
    }
    Ok(rows)
}
