//! SQL rendering for query descriptors.
//!
//! Every identifier is checked with [`validate_identifier`] and quoted;
//! every value becomes a positional parameter. Rows are returned as a
//! single JSON column so the connection never needs per-table row decoding.

use quarry_core::{
    quote_identifier, validate_identifier, EntityDefinition, QuarryError, QuarryResult,
    QueryDescriptor,
};
use serde_json::{Map, Value};

/// Alias of the entity's table inside rendered statements.
const BASE: &str = "_t";

/// Filter operators understood inside a field's condition object.
pub const OPERATORS: &[&str] = &[
    "equals",
    "not",
    "in",
    "notIn",
    "lt",
    "lte",
    "gt",
    "gte",
    "contains",
    "startsWith",
    "endsWith",
];

/// True for a non-empty object whose keys are all operators. Any other
/// value in a filter is compared for equality.
pub fn is_operator_set(condition: &Value) -> bool {
    match condition {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| OPERATORS.contains(&k.as_str())),
        _ => false,
    }
}

/// A rendered statement and its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    fn push(&mut self, value: Value) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }
}

fn column(alias: &str, name: &str) -> QuarryResult<String> {
    Ok(format!("{}.{}", alias, quote_identifier(name)?))
}

/// `SELECT row_to_json(_q) FROM (SELECT ... ) _q` for a list or single read.
pub fn render_select(
    entity: &EntityDefinition,
    query: &QueryDescriptor,
    single: bool,
) -> QuarryResult<Statement> {
    validate_identifier(&entity.table)?;
    let mut stmt = Statement {
        sql: String::new(),
        params: Vec::new(),
    };

    let mut columns = match &query.select {
        Some(fields) if !fields.is_empty() => fields
            .iter()
            .map(|f| column(BASE, f))
            .collect::<QuarryResult<Vec<_>>>()?,
        _ => vec![format!("{}.*", BASE)],
    };

    if let Some(relations) = &query.include {
        for name in relations {
            let relation = entity.relation(name).ok_or_else(|| {
                QuarryError::validation(format!(
                    "Entity '{}' has no relation '{}'",
                    entity.name, name
                ))
            })?;
            validate_identifier(&relation.table)?;
            columns.push(format!(
                "(SELECT COALESCE(json_agg(_r), '[]'::json) FROM {} _r WHERE {} = {}) AS {}",
                quote_identifier(&relation.table)?,
                column("_r", &relation.foreign_key)?,
                column(BASE, &entity.primary_key)?,
                quote_identifier(name)?,
            ));
        }
    }

    let where_clause = render_where(&query.filter, &mut stmt)?;
    let order_clause = render_order(query)?;

    let mut inner = format!(
        "SELECT {} FROM {} {}{}{}",
        columns.join(", "),
        quote_identifier(&entity.table)?,
        BASE,
        where_clause,
        order_clause,
    );

    let take = if single { Some(1) } else { query.take };
    if let Some(take) = take {
        inner.push_str(&format!(" LIMIT {}", take));
    }
    if let Some(skip) = query.skip.filter(|s| *s > 0) {
        inner.push_str(&format!(" OFFSET {}", skip));
    }

    stmt.sql = format!("SELECT row_to_json(_q) FROM ({}) _q", inner);
    Ok(stmt)
}

/// `SELECT COUNT(*)` over the descriptor's filter. Pagination is ignored.
pub fn render_count(entity: &EntityDefinition, query: &QueryDescriptor) -> QuarryResult<Statement> {
    validate_identifier(&entity.table)?;
    let mut stmt = Statement {
        sql: String::new(),
        params: Vec::new(),
    };
    let where_clause = render_where(&query.filter, &mut stmt)?;
    stmt.sql = format!(
        "SELECT COUNT(*) FROM {} {}{}",
        quote_identifier(&entity.table)?,
        BASE,
        where_clause
    );
    Ok(stmt)
}

/// Update one row by primary key and return it as JSON.
pub fn render_update(
    entity: &EntityDefinition,
    id: &Value,
    changes: &Map<String, Value>,
) -> QuarryResult<Statement> {
    validate_identifier(&entity.table)?;
    validate_identifier(&entity.primary_key)?;
    if changes.is_empty() {
        return Err(QuarryError::validation(format!(
            "Update on '{}' has no changes",
            entity.name
        )));
    }

    let mut stmt = Statement {
        sql: String::new(),
        params: Vec::new(),
    };
    let mut sets = Vec::with_capacity(changes.len());
    for (name, value) in changes {
        validate_identifier(name)?;
        let placeholder = stmt.push(value.clone());
        sets.push(format!("{} = {}", quote_identifier(name)?, placeholder));
    }
    let key = stmt.push(id.clone());

    stmt.sql = format!(
        "WITH _u AS (UPDATE {} SET {} WHERE {} = {} RETURNING *) SELECT row_to_json(_u) FROM _u",
        quote_identifier(&entity.table)?,
        sets.join(", "),
        quote_identifier(&entity.primary_key)?,
        key
    );
    Ok(stmt)
}

/// Wrap a caller's read statement so each row comes back as one JSON value.
pub fn wrap_raw(sql: &str) -> String {
    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    format!("SELECT row_to_json(_r) FROM ({}) _r", trimmed)
}

fn render_order(query: &QueryDescriptor) -> QuarryResult<String> {
    if query.order_by.is_empty() {
        return Ok(String::new());
    }
    let terms = query
        .order_by
        .iter()
        .map(|o| Ok(format!("{} {}", column(BASE, &o.field)?, o.direction.as_sql())))
        .collect::<QuarryResult<Vec<_>>>()?;
    Ok(format!(" ORDER BY {}", terms.join(", ")))
}

fn render_where(filter: &Map<String, Value>, stmt: &mut Statement) -> QuarryResult<String> {
    if filter.is_empty() {
        return Ok(String::new());
    }
    Ok(format!(" WHERE {}", render_conjunction(filter, stmt)?))
}

fn render_conjunction(filter: &Map<String, Value>, stmt: &mut Statement) -> QuarryResult<String> {
    if filter.is_empty() {
        return Ok("TRUE".to_string());
    }
    let parts = filter
        .iter()
        .map(|(key, condition)| render_entry(key, condition, stmt))
        .collect::<QuarryResult<Vec<_>>>()?;
    Ok(parts.join(" AND "))
}

fn render_entry(key: &str, condition: &Value, stmt: &mut Statement) -> QuarryResult<String> {
    match key {
        "AND" | "OR" | "NOT" => {
            let branches = match condition {
                Value::Object(map) => vec![map],
                Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
                _ => {
                    return Err(QuarryError::validation(format!(
                        "{} expects an object or an array of objects",
                        key
                    )))
                }
            };
            let rendered = branches
                .into_iter()
                .map(|b| render_conjunction(b, stmt).map(|s| format!("({})", s)))
                .collect::<QuarryResult<Vec<_>>>()?;
            Ok(match (key, rendered.is_empty()) {
                ("AND", true) => "TRUE".to_string(),
                ("OR", true) => "FALSE".to_string(),
                ("NOT", true) => "TRUE".to_string(),
                ("AND", false) => format!("({})", rendered.join(" AND ")),
                ("OR", false) => format!("({})", rendered.join(" OR ")),
                _ => format!("NOT ({})", rendered.join(" OR ")),
            })
        }
        field => {
            let col = column(BASE, field)?;
            render_condition(&col, condition, stmt)
        }
    }
}

fn render_condition(col: &str, condition: &Value, stmt: &mut Statement) -> QuarryResult<String> {
    let ops = match condition {
        Value::Null => return Ok(format!("{} IS NULL", col)),
        Value::Object(ops) if is_operator_set(condition) => ops,
        other => return Ok(format!("{} = {}", col, stmt.push(other.clone()))),
    };

    let mut parts = Vec::with_capacity(ops.len());
    for (op, operand) in ops {
        let part = match op.as_str() {
            "equals" => render_condition(col, operand, stmt)?,
            "not" => match operand {
                Value::Null => format!("{} IS NOT NULL", col),
                nested if is_operator_set(nested) => {
                    format!("NOT ({})", render_condition(col, nested, stmt)?)
                }
                other => format!("{} IS DISTINCT FROM {}", col, stmt.push(other.clone())),
            },
            "in" | "notIn" => {
                let items = operand.as_array().ok_or_else(|| {
                    QuarryError::validation(format!("'{}' expects an array", op))
                })?;
                if items.is_empty() {
                    // x IN () matches nothing; x NOT IN () matches everything.
                    (if op == "in" { "FALSE" } else { "TRUE" }).to_string()
                } else {
                    let placeholders: Vec<String> =
                        items.iter().map(|item| stmt.push(item.clone())).collect();
                    let keyword = if op == "in" { "IN" } else { "NOT IN" };
                    format!("{} {} ({})", col, keyword, placeholders.join(", "))
                }
            }
            "lt" | "lte" | "gt" | "gte" => {
                let symbol = match op.as_str() {
                    "lt" => "<",
                    "lte" => "<=",
                    "gt" => ">",
                    _ => ">=",
                };
                format!("{} {} {}", col, symbol, stmt.push(operand.clone()))
            }
            "contains" => format!("strpos({}::text, {}) > 0", col, stmt.push(operand.clone())),
            "startsWith" => {
                let p = stmt.push(operand.clone());
                format!("left({}::text, length({p}::text)) = {p}::text", col)
            }
            "endsWith" => {
                let p = stmt.push(operand.clone());
                format!("right({}::text, length({p}::text)) = {p}::text", col)
            }
            other => {
                return Err(QuarryError::validation(format!(
                    "Unknown filter operator '{}'",
                    other
                )))
            }
        };
        parts.push(part);
    }
    Ok(parts.join(" AND "))
}
