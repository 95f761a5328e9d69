use std::collections::HashMap;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        user: NewUser,
    },
    InsertProperty {
        id: Ulid,
        owner_id: Ulid,
        property: NewProperty,
    },
    UpdateProperty {
        id: Ulid,
        owner_id: Ulid,
        update: PropertyUpdate,
    },
    InsertPropertyImage {
        property_id: Ulid,
        owner_id: Ulid,
        url: String,
    },
    InsertBooking {
        id: Ulid,
        property_id: Ulid,
        guest_id: Ulid,
        start: Ms,
        end: Ms,
        returning: bool,
    },
    UpdateBookingStatus {
        id: Ulid,
        actor_id: Ulid,
        status: BookingStatus,
    },
    SelectProperty {
        id: Ulid,
    },
    SelectProperties {
        filter: PropertyFilter,
    },
    SelectPropertyDetail {
        property_id: Ulid,
        owner_id: Ulid,
    },
    SelectPropertyBookings {
        property_id: Ulid,
        owner_id: Ulid,
    },
    SelectGuestBookings {
        guest_id: Ulid,
    },
    SelectGuestStatistics {
        guest_id: Ulid,
    },
    SelectDashboard {
        user_id: Ulid,
    },
}

/// Shape of the rows a statement returns, known before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSet {
    None,
    Properties,
    Bookings,
    PropertyDetail,
    PropertyBookings,
    GuestBookings,
    GuestStatistics,
    Dashboard,
}

impl Command {
    pub fn result_set(&self) -> ResultSet {
        match self {
            Command::InsertBooking { returning: true, .. } => ResultSet::Bookings,
            Command::SelectProperty { .. } | Command::SelectProperties { .. } => ResultSet::Properties,
            Command::SelectPropertyDetail { .. } => ResultSet::PropertyDetail,
            Command::SelectPropertyBookings { .. } => ResultSet::PropertyBookings,
            Command::SelectGuestBookings { .. } => ResultSet::GuestBookings,
            Command::SelectGuestStatistics { .. } => ResultSet::GuestStatistics,
            Command::SelectDashboard { .. } => ResultSet::Dashboard,
            _ => ResultSet::None,
        }
    }
}

fn parse_statement(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    match stmts.len() {
        0 => Err(SqlError::Empty),
        1 => Ok(stmts.remove(0)),
        n => Err(SqlError::Unsupported(format!("{n} statements in one query"))),
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    match parse_statement(sql)? {
        Statement::Insert(insert) => parse_insert(&insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, &assignments, selection.as_ref()),
        Statement::Query(query) => parse_select(&query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Result shape of a statement that may still contain `$n` placeholders.
pub fn describe(sql: &str) -> Result<ResultSet, SqlError> {
    match parse_statement(sql)? {
        Statement::Insert(insert) => {
            let table = insert_table_name(&insert)?;
            if table == "bookings" && insert.returning.is_some() {
                Ok(ResultSet::Bookings)
            } else {
                Ok(ResultSet::None)
            }
        }
        Statement::Query(query) => {
            let select = match query.body.as_ref() {
                SetExpr::Select(s) => s,
                _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
            };
            let from = select
                .from
                .first()
                .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
            select_result_set(&table_factor_name(&from.relation)?)
        }
        _ => Ok(ResultSet::None),
    }
}

fn select_result_set(table: &str) -> Result<ResultSet, SqlError> {
    match table {
        "properties" => Ok(ResultSet::Properties),
        "property_detail" => Ok(ResultSet::PropertyDetail),
        "property_bookings" => Ok(ResultSet::PropertyBookings),
        "guest_bookings" => Ok(ResultSet::GuestBookings),
        "guest_statistics" => Ok(ResultSet::GuestStatistics),
        "dashboard" => Ok(ResultSet::Dashboard),
        other => Err(SqlError::UnknownTable(other.to_string())),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Column name → value for a single-row INSERT. Without an explicit column
/// list, values are taken positionally in `default_columns` order.
struct Row {
    table: &'static str,
    values: HashMap<String, Expr>,
}

impl Row {
    fn from_insert(insert: &ast::Insert, table: &'static str, default_columns: &[&str]) -> Result<Self, SqlError> {
        let source = insert
            .source
            .as_ref()
            .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
        let rows = match source.body.as_ref() {
            SetExpr::Values(values) => &values.rows,
            _ => return Err(SqlError::Parse("expected VALUES".into())),
        };
        let row = match rows.as_slice() {
            [] => return Err(SqlError::Parse("empty VALUES".into())),
            [row] => row,
            _ => return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
        };

        let columns: Vec<String> = if insert.columns.is_empty() {
            default_columns.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if columns.len() != row.len() {
            return Err(SqlError::WrongArity(table, columns.len(), row.len()));
        }
        for col in &columns {
            if !default_columns.contains(&col.as_str()) {
                return Err(SqlError::UnknownColumn(table, col.clone()));
            }
        }
        Ok(Self {
            table,
            values: columns.into_iter().zip(row.iter().cloned()).collect(),
        })
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.values.get(column)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

const USER_COLUMNS: &[&str] = &["id", "email", "name", "role", "phone", "address", "business_name"];
const PROPERTY_COLUMNS: &[&str] = &["id", "owner_id", "name", "description", "location", "price", "amenities", "images"];
const IMAGE_COLUMNS: &[&str] = &["property_id", "owner_id", "image_url"];
const BOOKING_COLUMNS: &[&str] = &["id", "property_id", "guest_id", "start", "end"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "users" => {
            let row = Row::from_insert(insert, "users", USER_COLUMNS)?;
            Ok(Command::InsertUser {
                id: parse_ulid(row.require("id")?)?,
                user: NewUser {
                    email: parse_text(row.require("email")?)?,
                    name: parse_text(row.require("name")?)?,
                    role: parse_token(row.require("role")?)?,
                    phone: optional_text(row.get("phone"))?.unwrap_or_default(),
                    address: optional_text(row.get("address"))?.unwrap_or_default(),
                    business_name: optional_text(row.get("business_name"))?,
                },
            })
        }
        "properties" => {
            let row = Row::from_insert(insert, "properties", PROPERTY_COLUMNS)?;
            Ok(Command::InsertProperty {
                id: parse_ulid(row.require("id")?)?,
                owner_id: parse_ulid(row.require("owner_id")?)?,
                property: NewProperty {
                    name: parse_text(row.require("name")?)?,
                    description: optional_text(row.get("description"))?.unwrap_or_default(),
                    location: parse_text(row.require("location")?)?,
                    price: parse_f64(row.require("price")?)?,
                    amenities: optional_text(row.get("amenities"))?.unwrap_or_default(),
                    images: optional_images(row.get("images"))?.unwrap_or_default(),
                },
            })
        }
        "property_images" => {
            let row = Row::from_insert(insert, "property_images", IMAGE_COLUMNS)?;
            Ok(Command::InsertPropertyImage {
                property_id: parse_ulid(row.require("property_id")?)?,
                owner_id: parse_ulid(row.require("owner_id")?)?,
                url: parse_text(row.require("image_url")?)?,
            })
        }
        "bookings" => {
            let row = Row::from_insert(insert, "bookings", BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking {
                id: parse_ulid(row.require("id")?)?,
                property_id: parse_ulid(row.require("property_id")?)?,
                guest_id: parse_ulid(row.require("guest_id")?)?,
                start: parse_i64(row.require("start")?)?,
                end: parse_i64(row.require("end")?)?,
                returning: insert.returning.is_some(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(table)?;
    let mut set: HashMap<String, &Expr> = HashMap::new();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.insert(column, &assignment.value);
    }
    let filters = Filters::from_selection(selection)?;
    let required = |column: &'static str| {
        set.get(column)
            .copied()
            .ok_or(SqlError::MissingColumn("SET", column))
    };

    match table.as_str() {
        "properties" => Ok(Command::UpdateProperty {
            id: filters.eq_ulid("id")?,
            owner_id: filters.eq_ulid("owner_id")?,
            update: PropertyUpdate {
                name: parse_text(required("name")?)?,
                description: parse_text(required("description")?)?,
                location: parse_text(required("location")?)?,
                price: parse_f64(required("price")?)?,
                amenities: parse_text(required("amenities")?)?,
                images: optional_images(set.get("images").copied())?,
            },
        }),
        "bookings" => Ok(Command::UpdateBookingStatus {
            id: filters.eq_ulid("id")?,
            actor_id: filters.eq_ulid("actor_id")?,
            status: parse_token(required("status")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match select_result_set(&table)? {
        ResultSet::Properties => {
            if filters.eq.contains_key("id") {
                return Ok(Command::SelectProperty { id: filters.eq_ulid("id")? });
            }
            Ok(Command::SelectProperties {
                filter: PropertyFilter {
                    location: filters
                        .ilike
                        .get("location")
                        .map(|p| p.trim_matches('%').to_string()),
                    min_price: filters.ge.get("price").map(parse_f64).transpose()?,
                    max_price: filters.le.get("price").map(parse_f64).transpose()?,
                },
            })
        }
        ResultSet::PropertyDetail => Ok(Command::SelectPropertyDetail {
            property_id: filters.eq_ulid("property_id")?,
            owner_id: filters.eq_ulid("owner_id")?,
        }),
        ResultSet::PropertyBookings => Ok(Command::SelectPropertyBookings {
            property_id: filters.eq_ulid("property_id")?,
            owner_id: filters.eq_ulid("owner_id")?,
        }),
        ResultSet::GuestBookings => Ok(Command::SelectGuestBookings {
            guest_id: filters.eq_ulid("guest_id")?,
        }),
        ResultSet::GuestStatistics => Ok(Command::SelectGuestStatistics {
            guest_id: filters.eq_ulid("guest_id")?,
        }),
        ResultSet::Dashboard => Ok(Command::SelectDashboard {
            user_id: filters.eq_ulid("user_id")?,
        }),
        ResultSet::None | ResultSet::Bookings => Err(SqlError::UnknownTable(table)),
    }
}

/// Conjunctive `WHERE` predicates, by column.
#[derive(Default)]
struct Filters {
    eq: HashMap<String, Expr>,
    ge: HashMap<String, Expr>,
    le: HashMap<String, Expr>,
    ilike: HashMap<String, String>,
}

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut filters = Self::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                use ast::BinaryOperator::*;
                if *op == And {
                    self.collect(left)?;
                    return self.collect(right);
                }
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
                let target = match op {
                    Eq => &mut self.eq,
                    GtEq => &mut self.ge,
                    LtEq => &mut self.le,
                    _ => return Err(SqlError::Unsupported(format!("operator {op}"))),
                };
                target.insert(column, right.as_ref().clone());
                Ok(())
            }
            Expr::ILike {
                negated: false,
                expr: column,
                pattern,
                ..
            } => {
                let column = expr_column_name(column)
                    .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
                self.ilike.insert(column, parse_text(pattern)?);
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("predicate {other}"))),
        }
    }

    fn eq_ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        let expr = self.eq.get(column).ok_or(SqlError::MissingFilter(column))?;
        parse_ulid(expr)
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::DollarQuotedString(ast::DollarQuotedString { value: s, .. })) => {
            Ok(s.clone())
        }
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn optional_text(expr: Option<&Expr>) -> Result<Option<String>, SqlError> {
    match expr {
        None => Ok(None),
        Some(e) if is_null(e) => Ok(None),
        Some(e) => parse_text(e).map(Some),
    }
}

/// JSON array of URLs, e.g. `'["https://…/1.jpg"]'`.
fn optional_images(expr: Option<&Expr>) -> Result<Option<Vec<String>>, SqlError> {
    match optional_text(expr)? {
        None => Ok(None),
        Some(json) => serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| SqlError::Parse(format!("images must be a JSON array of strings: {e}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    let s = parse_text(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_f64(expr)?);
    }
    let s = parse_text(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad number {s:?}: {e}")))
}

/// Enum tokens such as `'confirmed'` or `'owner'`.
fn parse_token<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: std::str::FromStr<Err = String>,
{
    parse_text(expr)?.parse().map_err(SqlError::Parse)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
