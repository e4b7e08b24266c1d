//! SQL front-end
//!
//! Statements are handed to the `sqlparser` crate after a small pre-pass:
//! bucket keys quoted with single quotes or backticks (`FROM
//! 'AAPL/1Min/OHLCV'`) are rewritten into delimited identifiers, and
//! `INSERT INTO … SELECT` is split off before the dialect parser since only
//! its SELECT half needs the full grammar.

use sqlparser::ast::{
    BinaryOperator, Expr, Function, FunctionArg, FunctionArgExpr, ObjectName, Select, SelectItem,
    SetExpr, Statement as SqlStatement, TableFactor, Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use super::{
    CompareOp, FuncArg, FunctionCall, Literal, Predicate, ProjectionItem, QueryStatement,
    SelectStatement, Source,
};
use crate::types::Epoch;
use crate::{Result, TickError};

/// Parse one SQL statement
pub fn parse(sql: &str) -> Result<QueryStatement> {
    let sql = sql.trim().trim_end_matches(';').trim();
    if sql.is_empty() {
        return Err(TickError::InvalidQuery("empty statement".into()));
    }
    if starts_with_keyword(sql, "insert") {
        return parse_insert(sql);
    }
    Ok(QueryStatement::Select(parse_select_sql(sql)?))
}

/// Timestamp literal: `YYYY-MM-DD`, `YYYY-MM-DD HH:MM[:SS]`,
/// `YYYY-MM-DD-HH:MM[:SS]`, or bare seconds since epoch. All in UTC.
pub fn parse_time_literal(s: &str) -> Option<Epoch> {
    use chrono::{NaiveDate, NaiveDateTime};

    if let Ok(seconds) = s.parse::<i64>() {
        return Some(seconds);
    }
    for fmt in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%d-%H:%M:%S",
        "%Y-%m-%d-%H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}

fn starts_with_keyword(s: &str, keyword: &str) -> bool {
    s.get(..keyword.len())
        .map(|head| head.eq_ignore_ascii_case(keyword))
        .unwrap_or(false)
}

fn parse_insert(sql: &str) -> Result<QueryStatement> {
    let rest = sql["insert".len()..].trim_start();
    if !starts_with_keyword(rest, "into") {
        return Err(TickError::InvalidQuery("INSERT requires INTO".into()));
    }
    let rest = rest["into".len()..].trim_start();
    let (target, rest) = take_bucket_token(rest)?;
    let rest = rest.trim_start();
    if !starts_with_keyword(rest, "select") {
        return Err(TickError::InvalidQuery(
            "INSERT INTO requires a SELECT source".into(),
        ));
    }
    Ok(QueryStatement::Insert {
        target,
        source: parse_select_sql(rest)?,
    })
}

/// Pull one bucket key token (quoted, backticked, or bare) off the front
fn take_bucket_token(s: &str) -> Result<(String, &str)> {
    let mut chars = s.char_indices();
    match chars.next() {
        Some((_, quote @ ('\'' | '`' | '"'))) => {
            for (i, c) in chars {
                if c == quote {
                    return Ok((s[1..i].to_string(), &s[i + 1..]));
                }
            }
            Err(TickError::InvalidQuery("unterminated bucket key".into()))
        }
        Some(_) => {
            let end = s
                .find(char::is_whitespace)
                .ok_or_else(|| TickError::InvalidQuery("missing SELECT after INSERT INTO".into()))?;
            Ok((s[..end].to_string(), &s[end..]))
        }
        None => Err(TickError::InvalidQuery("missing bucket key".into())),
    }
}

fn parse_select_sql(sql: &str) -> Result<SelectStatement> {
    let normalized = normalize_bucket_keys(sql);
    let dialect = GenericDialect {};
    let statements = Parser::parse_sql(&dialect, &normalized)
        .map_err(|e| TickError::InvalidQuery(e.to_string()))?;
    if statements.len() != 1 {
        return Err(TickError::InvalidQuery(
            "expected a single statement".into(),
        ));
    }
    match &statements[0] {
        SqlStatement::Query(query) => convert_query(query),
        other => Err(TickError::InvalidQuery(format!(
            "unsupported statement: {}",
            other
        ))),
    }
}

/// Rewrite `` `key` `` and (after FROM/INTO) `'key'` into `"key"` so the
/// dialect parser sees a delimited identifier
fn normalize_bucket_keys(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut prev_word = String::new();
    let mut word = String::new();
    let mut chars = sql.chars();

    while let Some(c) = chars.next() {
        match c {
            '`' => {
                out.push('"');
                for inner in chars.by_ref() {
                    if inner == '`' {
                        break;
                    }
                    out.push(inner);
                }
                out.push('"');
                prev_word.clear();
                word.clear();
            }
            '\'' => {
                let mut lit = String::new();
                let mut terminated = false;
                for inner in chars.by_ref() {
                    if inner == '\'' {
                        terminated = true;
                        break;
                    }
                    lit.push(inner);
                }
                let keyword = if word.is_empty() { &prev_word } else { &word };
                let quote = if keyword.eq_ignore_ascii_case("from")
                    || keyword.eq_ignore_ascii_case("into")
                {
                    '"'
                } else {
                    '\''
                };
                out.push(quote);
                out.push_str(&lit);
                if terminated {
                    out.push(quote);
                }
                prev_word.clear();
                word.clear();
            }
            c if c.is_alphanumeric() || c == '_' => {
                word.push(c);
                out.push(c);
            }
            other => {
                if !word.is_empty() {
                    prev_word = std::mem::take(&mut word);
                } else if !other.is_whitespace() {
                    prev_word.clear();
                }
                out.push(other);
            }
        }
    }
    out
}

fn convert_query(query: &sqlparser::ast::Query) -> Result<SelectStatement> {
    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select,
        _ => {
            return Err(TickError::InvalidQuery(
                "only plain SELECT is supported".into(),
            ))
        }
    };

    let projection = convert_projection(select)?;
    let source = convert_from(select)?;
    let predicate = select
        .selection
        .as_ref()
        .map(convert_predicate)
        .transpose()?;
    let limit = match &query.limit {
        Some(Expr::Value(SqlValue::Number(n, _))) => Some(
            n.parse::<usize>()
                .map_err(|_| TickError::InvalidQuery(format!("bad LIMIT: {}", n)))?,
        ),
        Some(other) => {
            return Err(TickError::InvalidQuery(format!(
                "unsupported LIMIT: {}",
                other
            )))
        }
        None => None,
    };

    Ok(SelectStatement {
        projection,
        source,
        predicate,
        limit,
    })
}

fn convert_projection(select: &Select) -> Result<Vec<ProjectionItem>> {
    if select.projection.is_empty() {
        return Err(TickError::InvalidQuery("empty projection".into()));
    }
    let mut items = Vec::with_capacity(select.projection.len());
    for item in &select.projection {
        let converted = match item {
            SelectItem::Wildcard(_) => ProjectionItem::Wildcard,
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                convert_projection_expr(expr)?
            }
            other => {
                return Err(TickError::InvalidQuery(format!(
                    "unsupported projection: {}",
                    other
                )))
            }
        };
        items.push(converted);
    }
    Ok(items)
}

fn convert_projection_expr(expr: &Expr) -> Result<ProjectionItem> {
    match expr {
        Expr::Identifier(ident) => Ok(ProjectionItem::Column(ident.value.clone())),
        Expr::Function(func) => Ok(ProjectionItem::Call(convert_function(func)?)),
        other => Err(TickError::InvalidQuery(format!(
            "unsupported projection expression: {}",
            other
        ))),
    }
}

fn convert_function(func: &Function) -> Result<FunctionCall> {
    let name = object_name_string(&func.name);
    let mut args = Vec::with_capacity(func.args.len());
    for arg in &func.args {
        let expr = match arg {
            FunctionArg::Unnamed(expr) | FunctionArg::Named { arg: expr, .. } => expr,
        };
        let converted = match expr {
            FunctionArgExpr::Wildcard => FuncArg::Wildcard,
            FunctionArgExpr::Expr(Expr::Identifier(ident)) => {
                FuncArg::Column(ident.value.clone())
            }
            FunctionArgExpr::Expr(e) => FuncArg::Literal(convert_literal(e)?),
            other => {
                return Err(TickError::InvalidQuery(format!(
                    "unsupported function argument: {}",
                    other
                )))
            }
        };
        args.push(converted);
    }
    Ok(FunctionCall { name, args })
}

fn convert_from(select: &Select) -> Result<Source> {
    if select.from.len() != 1 {
        return Err(TickError::InvalidQuery(
            "exactly one FROM source is required".into(),
        ));
    }
    let table = &select.from[0];
    if !table.joins.is_empty() {
        return Err(TickError::InvalidQuery("joins are not supported".into()));
    }
    match &table.relation {
        TableFactor::Table { name, .. } => Ok(Source::Bucket(object_name_string(name))),
        TableFactor::Derived { subquery, .. } => {
            Ok(Source::Subquery(Box::new(convert_query(subquery)?)))
        }
        other => Err(TickError::InvalidQuery(format!(
            "unsupported FROM source: {}",
            other
        ))),
    }
}

fn object_name_string(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(|ident| ident.value.clone())
        .collect::<Vec<_>>()
        .join(".")
}

fn convert_predicate(expr: &Expr) -> Result<Predicate> {
    match expr {
        Expr::Nested(inner) => convert_predicate(inner),
        Expr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And => Ok(Predicate::And(
                Box::new(convert_predicate(left)?),
                Box::new(convert_predicate(right)?),
            )),
            BinaryOperator::Or => Ok(Predicate::Or(
                Box::new(convert_predicate(left)?),
                Box::new(convert_predicate(right)?),
            )),
            _ => convert_compare(left, op, right),
        },
        Expr::Between {
            expr,
            negated,
            low,
            high,
        } => {
            if *negated {
                return Err(TickError::InvalidQuery("NOT BETWEEN is not supported".into()));
            }
            let column = identifier_name(expr)?;
            Ok(Predicate::Between {
                column,
                low: convert_literal(low)?,
                high: convert_literal(high)?,
            })
        }
        other => Err(TickError::InvalidQuery(format!(
            "unsupported predicate: {}",
            other
        ))),
    }
}

fn convert_compare(left: &Expr, op: &BinaryOperator, right: &Expr) -> Result<Predicate> {
    let op = match op {
        BinaryOperator::Eq => CompareOp::Eq,
        BinaryOperator::NotEq => CompareOp::Ne,
        BinaryOperator::Lt => CompareOp::Lt,
        BinaryOperator::LtEq => CompareOp::Le,
        BinaryOperator::Gt => CompareOp::Gt,
        BinaryOperator::GtEq => CompareOp::Ge,
        other => {
            return Err(TickError::InvalidQuery(format!(
                "unsupported operator: {}",
                other
            )))
        }
    };
    // accept both `col op literal` and `literal op col`
    if let Ok(column) = identifier_name(left) {
        Ok(Predicate::Compare {
            column,
            op,
            value: convert_literal(right)?,
        })
    } else {
        let column = identifier_name(right)?;
        Ok(Predicate::Compare {
            column,
            op: op.flip(),
            value: convert_literal(left)?,
        })
    }
}

fn identifier_name(expr: &Expr) -> Result<String> {
    match expr {
        Expr::Identifier(ident) => Ok(ident.value.clone()),
        other => Err(TickError::InvalidQuery(format!(
            "expected a column name, got: {}",
            other
        ))),
    }
}

fn convert_literal(expr: &Expr) -> Result<Literal> {
    match expr {
        Expr::Value(SqlValue::Number(n, _)) => {
            if n.contains('.') || n.contains('e') || n.contains('E') {
                n.parse::<f64>()
                    .map(Literal::Float)
                    .map_err(|_| TickError::InvalidQuery(format!("bad number: {}", n)))
            } else {
                n.parse::<i64>()
                    .map(Literal::Int)
                    .map_err(|_| TickError::InvalidQuery(format!("bad number: {}", n)))
            }
        }
        Expr::Value(SqlValue::SingleQuotedString(s))
        | Expr::Value(SqlValue::DoubleQuotedString(s)) => Ok(Literal::Str(s.clone())),
        Expr::UnaryOp {
            op: sqlparser::ast::UnaryOperator::Minus,
            expr,
        } => match convert_literal(expr)? {
            Literal::Int(v) => Ok(Literal::Int(-v)),
            Literal::Float(v) => Ok(Literal::Float(-v)),
            Literal::Str(s) => Err(TickError::InvalidQuery(format!("cannot negate '{}'", s))),
        },
        other => Err(TickError::InvalidQuery(format!(
            "unsupported literal: {}",
            other
        ))),
    }
}
