//! Module F — the Planner Driver (spec §4.F). Parses SQL against the
//! `Catalog`, applies the required push-down rewrites in priority order,
//! and produces a `PhysicalPlan` whose operators are each marked pushable
//! or residual. AST walking is grounded on the teacher's
//! `federation/parser.rs::collect_*_refs`/`rewrite_*` family: manual
//! recursive `match` over `sqlparser::ast` nodes rather than a visitor
//! trait, because the subset of SQL this compiler accepts is small and a
//! generic visitor would cost more than it saves.

use sqlparser::ast::{
    BinaryOperator, Expr, GroupByExpr, Join, JoinConstraint, JoinOperator, LimitClause, ObjectNamePart,
    OrderByKind, Query, Select, SelectItem, SetExpr, Statement, TableFactor, Value, ValueWithSpan,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::catalog::Catalog;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone)]
pub enum Predicate {
    Compare { column: String, op: CompareOp, value: Literal },
    IsNull(String),
    IsNotNull(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone)]
pub struct AggregateItem {
    pub func: AggFunc,
    pub column: Option<String>,
    pub alias: String,
}

#[derive(Debug, Clone)]
pub struct ProjectedColumn {
    pub name: String,
    pub alias: Option<String>,
}

/// Project push-down never disappears, even for `SELECT *` — the adapter
/// resolves it against the catalog immediately so the pipeline lowerer
/// always has an explicit column list to build a `$project` stage from.
#[derive(Debug, Clone)]
pub enum Projection {
    Columns(Vec<ProjectedColumn>),
    Aggregate { group_by: Vec<String>, items: Vec<AggregateItem> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub column: String,
    pub ascending: bool,
}

/// A same-base-collection join, the only join shape this compiler pushes
/// down (spec §4.F). Joins across distinct base collections still parse,
/// but `pushable` is `false` and the lowerer leaves them untouched for the
/// external execution collaborator.
#[derive(Debug, Clone)]
pub struct JoinPushdown {
    pub right_table: String,
    pub left_key: String,
    pub right_key: String,
    pub pushable: bool,
}

#[derive(Debug, Clone)]
pub struct PhysicalPlan {
    pub table: String,
    pub join: Option<JoinPushdown>,
    pub filters: Vec<Predicate>,
    /// Set when the `WHERE` clause contained a shape this compiler cannot
    /// translate (`OR`, function calls, subqueries); those conjuncts are
    /// dropped from `filters` and left for the execution collaborator.
    pub residual_filter: bool,
    pub projection: Projection,
    pub sort: Vec<SortKey>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

fn part_value(part: &ObjectNamePart) -> String {
    match part {
        ObjectNamePart::Identifier(ident) => ident.value.clone(),
        _ => String::new(),
    }
}

fn table_name(factor: &TableFactor) -> EngineResult<String> {
    match factor {
        TableFactor::Table { name, .. } => Ok(name.0.iter().map(part_value).collect::<Vec<_>>().join(".")),
        _ => Err(EngineError::query_compile_error("only plain table references are supported")),
    }
}

/// Strips a possible `table.` qualifier off a column reference; this
/// compiler resolves columns against a single scanned table (plus at most
/// one same-collection join target) so the qualifier carries no
/// information the catalog needs.
fn unqualified(parts: &[sqlparser::ast::Ident]) -> String {
    parts.last().map(|i| i.value.clone()).unwrap_or_default()
}

fn literal_of(value: &Value) -> EngineResult<Literal> {
    match value {
        Value::Null => Ok(Literal::Null),
        Value::Boolean(b) => Ok(Literal::Bool(*b)),
        Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Ok(Literal::Int(i))
            } else {
                n.parse::<f64>()
                    .map(Literal::Float)
                    .map_err(|_| EngineError::query_compile_error(format!("invalid numeric literal '{n}'")))
            }
        }
        Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => Ok(Literal::Str(s.clone())),
        other => Err(EngineError::query_compile_error(format!("unsupported literal {other:?}"))),
    }
}

fn expr_literal(expr: &Expr) -> EngineResult<Literal> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => literal_of(value),
        Expr::UnaryOp { op: sqlparser::ast::UnaryOperator::Minus, expr: inner } => match expr_literal(inner)? {
            Literal::Int(i) => Ok(Literal::Int(-i)),
            Literal::Float(f) => Ok(Literal::Float(-f)),
            other => Ok(other),
        },
        _ => Err(EngineError::query_compile_error("only literal comparison values are supported")),
    }
}

fn expr_column(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(idents) => Some(unqualified(idents)),
        _ => None,
    }
}

fn compare_op(op: &BinaryOperator) -> Option<CompareOp> {
    match op {
        BinaryOperator::Eq => Some(CompareOp::Eq),
        BinaryOperator::NotEq => Some(CompareOp::NotEq),
        BinaryOperator::Lt => Some(CompareOp::Lt),
        BinaryOperator::LtEq => Some(CompareOp::LtEq),
        BinaryOperator::Gt => Some(CompareOp::Gt),
        BinaryOperator::GtEq => Some(CompareOp::GtEq),
        _ => None,
    }
}

/// Flattens a `WHERE` clause into pushable conjuncts, setting
/// `residual_filter` the moment it meets anything it cannot translate
/// (`OR`, functions, subqueries, non-literal comparisons). Filter
/// push-down is the first-priority rewrite (spec §4.F); everything this
/// function leaves out of `out` falls back to the residual collaborator.
fn collect_filters(expr: &Expr, out: &mut Vec<Predicate>, residual: &mut bool) {
    match expr {
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            collect_filters(left, out, residual);
            collect_filters(right, out, residual);
        }
        Expr::BinaryOp { left, op, right } => {
            let Some(column) = expr_column(left) else {
                *residual = true;
                return;
            };
            let Some(cmp) = compare_op(op) else {
                *residual = true;
                return;
            };
            match expr_literal(right) {
                Ok(value) => out.push(Predicate::Compare { column, op: cmp, value }),
                Err(_) => *residual = true,
            }
        }
        Expr::IsNull(inner) => match expr_column(inner) {
            Some(column) => out.push(Predicate::IsNull(column)),
            None => *residual = true,
        },
        Expr::IsNotNull(inner) => match expr_column(inner) {
            Some(column) => out.push(Predicate::IsNotNull(column)),
            None => *residual = true,
        },
        Expr::Nested(inner) => collect_filters(inner, out, residual),
        _ => *residual = true,
    }
}

fn agg_func(name: &str) -> Option<AggFunc> {
    match name.to_ascii_uppercase().as_str() {
        "COUNT" => Some(AggFunc::Count),
        "SUM" => Some(AggFunc::Sum),
        "AVG" => Some(AggFunc::Avg),
        "MIN" => Some(AggFunc::Min),
        "MAX" => Some(AggFunc::Max),
        _ => None,
    }
}

fn try_aggregate_item(expr: &Expr, alias: Option<&str>) -> Option<AggregateItem> {
    let Expr::Function(func) = expr else { return None };
    let name = func.name.0.iter().map(part_value).collect::<Vec<_>>().join(".");
    let agg = agg_func(&name)?;
    let column = match &func.args {
        sqlparser::ast::FunctionArguments::List(list) => list.args.first().and_then(|a| match a {
            sqlparser::ast::FunctionArg::Unnamed(sqlparser::ast::FunctionArgExpr::Expr(e)) => expr_column(e),
            _ => None,
        }),
        _ => None,
    };
    let alias = alias
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}_{}", name.to_ascii_lowercase(), column.as_deref().unwrap_or("star")));
    Some(AggregateItem { func: agg, column, alias })
}

fn resolve_projection(select: &Select, catalog_table: &crate::catalog::CatalogTable) -> EngineResult<Projection> {
    let group_by_cols: Vec<String> = match &select.group_by {
        GroupByExpr::Expressions(exprs, _) => exprs.iter().filter_map(expr_column).collect(),
        GroupByExpr::All(_) => Vec::new(),
    };

    let mut aggregate_items = Vec::new();
    let mut all_aggregate = !select.projection.is_empty();
    for item in &select.projection {
        let (expr, alias) = match item {
            SelectItem::UnnamedExpr(e) => (e, None),
            SelectItem::ExprWithAlias { expr, alias } => (expr, Some(alias.value.as_str())),
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => {
                all_aggregate = false;
                continue;
            }
        };
        match try_aggregate_item(expr, alias) {
            Some(item) => aggregate_items.push(item),
            None => all_aggregate = false,
        }
    }

    if all_aggregate && (!aggregate_items.is_empty() || !group_by_cols.is_empty()) {
        return Ok(Projection::Aggregate { group_by: group_by_cols, items: aggregate_items });
    }

    let mut columns = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => {
                columns.extend(catalog_table.columns.iter().map(|c| ProjectedColumn { name: c.name.clone(), alias: None }));
            }
            SelectItem::UnnamedExpr(e) => {
                let name = expr_column(e)
                    .ok_or_else(|| EngineError::query_compile_error("only column references are supported in SELECT"))?;
                columns.push(ProjectedColumn { name, alias: None });
            }
            SelectItem::ExprWithAlias { expr, alias } => {
                let name = expr_column(expr)
                    .ok_or_else(|| EngineError::query_compile_error("only column references are supported in SELECT"))?;
                columns.push(ProjectedColumn { name, alias: Some(alias.value.clone()) });
            }
        }
    }
    Ok(Projection::Columns(columns))
}

fn resolve_join(join: &Join, catalog: &Catalog, left_table: &str) -> EngineResult<JoinPushdown> {
    let right_table = table_name(&join.relation)?;
    let on_expr = match &join.join_operator {
        JoinOperator::Inner(JoinConstraint::On(expr)) | JoinOperator::LeftOuter(JoinConstraint::On(expr)) => expr,
        _ => return Err(EngineError::unsupported_feature("only INNER/LEFT JOIN ... ON is supported")),
    };
    let (left_key, right_key) = match on_expr {
        Expr::BinaryOp { left, op: BinaryOperator::Eq, right } => {
            let l = expr_column(left).ok_or_else(|| EngineError::query_compile_error("unsupported join condition"))?;
            let r = expr_column(right).ok_or_else(|| EngineError::query_compile_error("unsupported join condition"))?;
            (l, r)
        }
        _ => return Err(EngineError::unsupported_feature("join conditions must be a single column equality")),
    };
    let pushable = catalog.share_base_collection(left_table, &right_table);
    Ok(JoinPushdown { right_table, left_key, right_key, pushable })
}

fn order_by_keys(query: &Query) -> Vec<SortKey> {
    let Some(order_by) = &query.order_by else { return Vec::new() };
    let OrderByKind::Expressions(exprs) = &order_by.kind else { return Vec::new() };
    exprs
        .iter()
        .filter_map(|e| expr_column(&e.expr).map(|column| SortKey { column, ascending: e.options.asc.unwrap_or(true) }))
        .collect()
}

fn limit_offset(query: &Query) -> EngineResult<(Option<u64>, Option<u64>)> {
    let Some(clause) = &query.limit_clause else { return Ok((None, None)) };
    match clause {
        LimitClause::LimitOffset { limit, offset, .. } => {
            let limit = limit.as_ref().map(expr_literal).transpose()?.map(literal_as_u64).transpose()?;
            let offset = offset.as_ref().map(|o| expr_literal(&o.value)).transpose()?.map(literal_as_u64).transpose()?;
            Ok((limit, offset))
        }
        LimitClause::OffsetCommaLimit { offset, limit } => {
            let offset = literal_as_u64(expr_literal(offset)?)?;
            let limit = literal_as_u64(expr_literal(limit)?)?;
            Ok((Some(limit), Some(offset)))
        }
    }
}

fn literal_as_u64(lit: Literal) -> EngineResult<u64> {
    match lit {
        Literal::Int(i) if i >= 0 => Ok(i as u64),
        other => Err(EngineError::query_compile_error(format!("LIMIT/OFFSET must be a non-negative integer, got {other:?}"))),
    }
}

pub struct PlannerDriver;

impl PlannerDriver {
    /// Parses `sql` against `catalog` and produces a `PhysicalPlan`. Only a
    /// single `SELECT` statement is accepted; `catalog` is the sole source
    /// of table/column identity, so nothing here ever touches the document
    /// model directly.
    #[tracing::instrument(skip(catalog), fields(sql_len = sql.len()))]
    pub fn compile(sql: &str, catalog: &Catalog) -> EngineResult<PhysicalPlan> {
        let statements = Parser::parse_sql(&GenericDialect {}, sql.trim())
            .map_err(|e| EngineError::query_compile_error(format!("parse error: {e}")))?;
        if statements.len() != 1 {
            return Err(EngineError::query_compile_error("exactly one statement is supported"));
        }
        let Statement::Query(query) = &statements[0] else {
            return Err(EngineError::query_compile_error("only SELECT queries are supported"));
        };
        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err(EngineError::query_compile_error("only a plain SELECT body is supported"));
        };
        if select.from.len() != 1 {
            return Err(EngineError::query_compile_error("exactly one FROM source is supported"));
        }
        let from = &select.from[0];
        let table = table_name(&from.relation)?;
        let catalog_table = catalog.table(&table)?;

        if from.joins.len() > 1 {
            return Err(EngineError::unsupported_feature("at most one JOIN is supported"));
        }
        let join = from.joins.first().map(|j| resolve_join(j, catalog, &table)).transpose()?;

        let mut filters = Vec::new();
        let mut residual_filter = false;
        if let Some(selection) = &select.selection {
            collect_filters(selection, &mut filters, &mut residual_filter);
        }

        let projection = resolve_projection(select, catalog_table)?;
        let sort = order_by_keys(query);
        let (limit, offset) = limit_offset(query)?;

        Ok(PhysicalPlan { table, join, filters, residual_filter, projection, sort, limit, offset })
    }
}
