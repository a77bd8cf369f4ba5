//! SQL predicate rendering.
//!
//! Filter trees compile to [`SqlExpr`] values holding fully qualified
//! column references; rendering appends `?` placeholders and pushes the
//! bound parameters in placeholder order.

use crate::value::SqlValue;

/// Comparison operators with a direct SQL spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CmpOp {
    fn sql(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
        }
    }
}

/// A compiled predicate over qualified column references.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlExpr {
    Cmp {
        column: String,
        op: CmpOp,
        value: SqlValue,
    },
    In {
        column: String,
        values: Vec<SqlValue>,
        negated: bool,
    },
    Null {
        column: String,
        negated: bool,
    },
    Between {
        column: String,
        low: SqlValue,
        high: SqlValue,
    },
    Like {
        column: String,
        pattern: String,
        negated: bool,
    },
    And(Vec<SqlExpr>),
    Or(Vec<SqlExpr>),
    Not(Box<SqlExpr>),
}

impl SqlExpr {
    pub(crate) fn eq(column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        SqlExpr::Cmp {
            column: column.into(),
            op: CmpOp::Eq,
            value: value.into(),
        }
    }

    pub(crate) fn is_in(column: impl Into<String>, values: Vec<SqlValue>) -> Self {
        SqlExpr::In {
            column: column.into(),
            values,
            negated: false,
        }
    }

    /// Render this predicate, appending placeholders and parameters.
    pub(crate) fn render(&self, sql: &mut String, params: &mut Vec<SqlValue>) {
        match self {
            SqlExpr::Cmp { column, op, value } => {
                // Equality against NULL means the IS NULL test.
                if value.is_null() && matches!(op, CmpOp::Eq | CmpOp::Ne) {
                    sql.push_str(column);
                    sql.push_str(if *op == CmpOp::Eq {
                        " IS NULL"
                    } else {
                        " IS NOT NULL"
                    });
                    return;
                }
                sql.push_str(column);
                sql.push(' ');
                sql.push_str(op.sql());
                sql.push_str(" ?");
                params.push(value.clone());
            }
            SqlExpr::In {
                column,
                values,
                negated,
            } => {
                if values.is_empty() {
                    // IN over nothing matches nothing.
                    sql.push_str(if *negated { "1 = 1" } else { "1 = 0" });
                    return;
                }
                sql.push_str(column);
                sql.push_str(if *negated { " NOT IN (" } else { " IN (" });
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    sql.push('?');
                    params.push(value.clone());
                }
                sql.push(')');
            }
            SqlExpr::Null { column, negated } => {
                sql.push_str(column);
                sql.push_str(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            SqlExpr::Between { column, low, high } => {
                sql.push_str(column);
                sql.push_str(" BETWEEN ? AND ?");
                params.push(low.clone());
                params.push(high.clone());
            }
            SqlExpr::Like {
                column,
                pattern,
                negated,
            } => {
                sql.push_str(column);
                sql.push_str(if *negated { " NOT LIKE ?" } else { " LIKE ?" });
                sql.push_str(" ESCAPE '\\'");
                params.push(SqlValue::Text(pattern.clone()));
            }
            SqlExpr::And(children) => render_group(children, " AND ", "1 = 1", sql, params),
            SqlExpr::Or(children) => render_group(children, " OR ", "1 = 0", sql, params),
            SqlExpr::Not(inner) => {
                sql.push_str("NOT (");
                inner.render(sql, params);
                sql.push(')');
            }
        }
    }
}

fn render_group(
    children: &[SqlExpr],
    separator: &str,
    empty: &str,
    sql: &mut String,
    params: &mut Vec<SqlValue>,
) {
    match children {
        [] => sql.push_str(empty),
        [only] => only.render(sql, params),
        many => {
            sql.push('(');
            for (i, child) in many.iter().enumerate() {
                if i > 0 {
                    sql.push_str(separator);
                }
                child.render(sql, params);
            }
            sql.push(')');
        }
    }
}

/// Escape LIKE wildcards in user input so it matches literally.
pub(crate) fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
