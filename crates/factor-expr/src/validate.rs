use std::collections::HashSet;

use factor_core::{CodeType, FactorError};

use crate::eval::{operator_arity, BASE_COLUMNS};
use crate::parser::{parse_formula, parse_program, Expr};

/// Static validation of user factor code: syntax, column references,
/// operator names, and arity. A factor that fails here is never admitted as
/// a job.
pub fn validate(code: &str, code_type: CodeType) -> Result<(), FactorError> {
    match code_type {
        CodeType::Formula => {
            let expr = parse_formula(code).map_err(to_validation)?;
            check_expr(&expr, &HashSet::new())
        }
        CodeType::Program => {
            let program = parse_program(code).map_err(to_validation)?;
            let mut scope: HashSet<String> = HashSet::new();
            for binding in &program.bindings {
                check_expr(&binding.expr, &scope)?;
                scope.insert(binding.name.clone());
            }
            check_expr(&program.result, &scope)
        }
    }
}

fn to_validation(err: FactorError) -> FactorError {
    match err {
        FactorError::Computation { message, location } => match location {
            Some(loc) => FactorError::Validation(format!("{message} at {loc}")),
            None => FactorError::Validation(message),
        },
        other => other,
    }
}

fn check_expr(expr: &Expr, scope: &HashSet<String>) -> Result<(), FactorError> {
    match expr {
        Expr::Number(_) => Ok(()),
        Expr::Ident { name, line, column } => {
            if scope.contains(name) || BASE_COLUMNS.contains(&name.to_ascii_lowercase().as_str()) {
                Ok(())
            } else {
                Err(FactorError::Validation(format!(
                    "unknown column or variable `{name}` at line {line}, column {column}"
                )))
            }
        }
        Expr::Neg(operand) => check_expr(operand, scope),
        Expr::Binary { left, right, .. } => {
            check_expr(left, scope)?;
            check_expr(right, scope)
        }
        Expr::Call {
            name,
            args,
            line,
            column,
        } => {
            let upper = name.to_ascii_uppercase();
            let (min, max) = operator_arity(&upper).ok_or_else(|| {
                FactorError::Validation(format!(
                    "unknown operator `{name}` at line {line}, column {column}"
                ))
            })?;
            if args.len() < min || args.len() > max {
                return Err(FactorError::Validation(format!(
                    "operator `{upper}` expects {min}..={max} arguments, got {} at line {line}, column {column}",
                    args.len()
                )));
            }
            for arg in args {
                check_expr(arg, scope)?;
            }
            Ok(())
        }
    }
}
