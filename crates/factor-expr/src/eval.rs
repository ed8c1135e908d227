use std::collections::HashMap;

use factor_core::{CodeLocation, CodeType, FactorError};

use crate::frame::{Frame, Series};
use crate::ops;
use crate::parser::{parse_formula, parse_program, BinaryOp, Expr};

/// Column names the dialects may reference. The merged market/base-factor
/// frame carries whichever subset the evaluation window could load.
pub const BASE_COLUMNS: [&str; 8] = [
    "open",
    "high",
    "low",
    "close",
    "volume",
    "amount",
    "turnover",
    "market_cap",
];

/// `(min, max)` argument counts per operator; `None` means unknown operator.
pub(crate) fn operator_arity(name: &str) -> Option<(usize, usize)> {
    Some(match name {
        "IF" => (3, 3),
        "ABS" | "LOG" | "RANK" | "RETURNS" => (1, 1),
        "POWER" | "MIN" | "MAX" | "CROSS" => (2, 2),
        "DELAY" | "REF" | "DIFF" | "FILTER" => (1, 2),
        "SUM" | "STDDEV" | "TS_MEAN" | "TS_MIN" | "TS_MAX" | "TS_RANK" | "MA" | "EMA" | "WMA" => {
            (1, 2)
        }
        "SMA" => (2, 3),
        "CORRELATION" => (2, 3),
        "MACD" => (1, 4),
        "RSI" | "BOLL" => (1, 2),
        "KDJ" | "CCI" | "ATR" => (3, 4),
        _ => return None,
    })
}

#[derive(Clone)]
enum Value {
    Scalar(f64),
    Series(Series),
}

struct Evaluator<'a> {
    frame: &'a Frame,
    env: HashMap<String, Value>,
    /// Name of the `let` binding (or "formula"/"result") being evaluated,
    /// attached to computation errors as their frame context.
    context: String,
}

impl<'a> Evaluator<'a> {
    fn new(frame: &'a Frame) -> Self {
        Evaluator {
            frame,
            env: HashMap::new(),
            context: "formula".to_string(),
        }
    }

    fn location(&self, line: usize, column: usize) -> CodeLocation {
        CodeLocation {
            line,
            column,
            context: self.context.clone(),
        }
    }

    fn series(&self, value: Value) -> Series {
        match value {
            Value::Series(s) => s,
            Value::Scalar(v) => self.frame.constant(v),
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, FactorError> {
        match expr {
            Expr::Number(v) => Ok(Value::Scalar(*v)),
            Expr::Ident { name, line, column } => {
                if let Some(value) = self.env.get(name) {
                    return Ok(value.clone());
                }
                let column_name = name.to_ascii_lowercase();
                if let Some(series) = self.frame.column(&column_name) {
                    return Ok(Value::Series(series));
                }
                Err(FactorError::computation_at(
                    format!("unknown column or variable `{name}`"),
                    self.location(*line, *column),
                ))
            }
            Expr::Neg(operand) => Ok(match self.eval(operand)? {
                Value::Scalar(v) => Value::Scalar(-v),
                Value::Series(s) => Value::Series(s.map(|v| -v)),
            }),
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.apply_binary(*op, left, right)
            }
            Expr::Call {
                name,
                args,
                line,
                column,
            } => self.call(name, args, *line, *column),
        }
    }

    fn apply_binary(&self, op: BinaryOp, left: Value, right: Value) -> Result<Value, FactorError> {
        let f = move |x: f64, y: f64| match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::Gt => (x > y) as i32 as f64,
            BinaryOp::Lt => (x < y) as i32 as f64,
            BinaryOp::Ge => (x >= y) as i32 as f64,
            BinaryOp::Le => (x <= y) as i32 as f64,
            BinaryOp::Eq => (x == y) as i32 as f64,
            BinaryOp::Ne => (x != y) as i32 as f64,
        };
        Ok(match (left, right) {
            (Value::Scalar(x), Value::Scalar(y)) => Value::Scalar(f(x, y)),
            (Value::Series(s), Value::Scalar(y)) => Value::Series(s.map(|v| f(v, y))),
            (Value::Scalar(x), Value::Series(s)) => Value::Series(s.map(|v| f(x, v))),
            (Value::Series(a), Value::Series(b)) => Value::Series(a.zip_map(&b, f)?),
        })
    }

    fn call(
        &mut self,
        name: &str,
        args: &[Expr],
        line: usize,
        column: usize,
    ) -> Result<Value, FactorError> {
        let upper = name.to_ascii_uppercase();
        let (min, max) = operator_arity(&upper).ok_or_else(|| {
            FactorError::computation_at(
                format!("unknown operator `{name}`"),
                self.location(line, column),
            )
        })?;
        if args.len() < min || args.len() > max {
            return Err(FactorError::computation_at(
                format!(
                    "operator `{upper}` expects {min}..={max} arguments, got {}",
                    args.len()
                ),
                self.location(line, column),
            ));
        }

        let values: Vec<Value> = args
            .iter()
            .map(|arg| self.eval(arg))
            .collect::<Result<_, _>>()?;

        let scalar = |idx: usize, what: &str| -> Result<f64, FactorError> {
            match values.get(idx) {
                Some(Value::Scalar(v)) => Ok(*v),
                Some(Value::Series(_)) => Err(FactorError::computation_at(
                    format!("operator `{upper}` expects a constant {what} argument"),
                    self.location(line, column),
                )),
                None => unreachable!("arity already checked"),
            }
        };
        let window = |idx: usize, default: usize| -> Result<usize, FactorError> {
            if idx >= values.len() {
                return Ok(default);
            }
            let v = scalar(idx, "window")?;
            if v < 1.0 || v.fract() != 0.0 {
                return Err(FactorError::computation_at(
                    format!("operator `{upper}` window must be a positive integer, got {v}"),
                    self.location(line, column),
                ));
            }
            Ok(v as usize)
        };
        let series = |idx: usize| self.series(values[idx].clone());

        let result = match upper.as_str() {
            "IF" => ops::if_then_else(&series(0), &series(1), &series(2))?,
            "ABS" => ops::abs(&series(0)),
            "LOG" => ops::log(&series(0)),
            "POWER" => ops::power(&series(0), scalar(1, "exponent")?),
            "MIN" => ops::min2(&series(0), &series(1))?,
            "MAX" => ops::max2(&series(0), &series(1))?,
            "RANK" => ops::rank(&series(0)),
            "RETURNS" => ops::returns(&series(0)),
            "DELAY" => ops::delay(&series(0), window(1, 1)?),
            "REF" => ops::reference(&series(0), window(1, 1)?),
            "DIFF" => ops::diff(&series(0), window(1, 1)?),
            "FILTER" => ops::filter_signal(&series(0), window(1, 5)?),
            "SUM" => ops::rolling_sum(&series(0), window(1, 20)?),
            "STDDEV" => ops::stddev(&series(0), window(1, 20)?),
            "TS_MEAN" => ops::ts_mean(&series(0), window(1, 20)?),
            "TS_MIN" => ops::ts_min(&series(0), window(1, 20)?),
            "TS_MAX" => ops::ts_max(&series(0), window(1, 20)?),
            "TS_RANK" => ops::ts_rank(&series(0), window(1, 20)?),
            "MA" => ops::ma(&series(0), window(1, 20)?),
            "EMA" => ops::ema(&series(0), window(1, 20)?),
            "WMA" => ops::wma(&series(0), window(1, 20)?),
            "SMA" => ops::sma(&series(0), window(1, 20)?, window(2, 1)?),
            "CROSS" => ops::cross(&series(0), &series(1))?,
            "CORRELATION" => ops::correlation(&series(0), &series(1), window(2, 20)?)?,
            "MACD" => ops::macd(&series(0), window(1, 12)?, window(2, 26)?, window(3, 9)?)?,
            "RSI" => ops::rsi(&series(0), window(1, 14)?)?,
            "BOLL" => ops::boll(&series(0), window(1, 20)?)?,
            "KDJ" => ops::kdj(&series(0), &series(1), &series(2), window(3, 9)?)?,
            "CCI" => ops::cci(&series(0), &series(1), &series(2), window(3, 14)?)?,
            "ATR" => ops::atr(&series(0), &series(1), &series(2), window(3, 14)?)?,
            _ => unreachable!("arity table covers every operator"),
        };
        Ok(Value::Series(result))
    }
}

/// Evaluate a formula-dialect factor over the frame.
pub fn evaluate_formula(frame: &Frame, code: &str) -> Result<Series, FactorError> {
    let expr = parse_formula(code)?;
    let mut evaluator = Evaluator::new(frame);
    let value = evaluator.eval(&expr)?;
    Ok(evaluator.series(value))
}

/// Evaluate a program-dialect factor: `let` bindings in order, then the
/// result expression. The interpreter exposes only the frame columns and the
/// operator vocabulary; there is nothing else a program can observe.
pub fn evaluate_program(frame: &Frame, code: &str) -> Result<Series, FactorError> {
    let program = parse_program(code)?;
    let mut evaluator = Evaluator::new(frame);
    for binding in &program.bindings {
        evaluator.context = format!("let {}", binding.name);
        let value = evaluator.eval(&binding.expr)?;
        evaluator.env.insert(binding.name.clone(), value);
    }
    evaluator.context = "result".to_string();
    let value = evaluator.eval(&program.result)?;
    Ok(evaluator.series(value))
}

/// Evaluate user factor code in the requested dialect.
pub fn evaluate(frame: &Frame, code: &str, code_type: CodeType) -> Result<Series, FactorError> {
    match code_type {
        CodeType::Formula => evaluate_formula(frame, code),
        CodeType::Program => evaluate_program(frame, code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use chrono::NaiveDate;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y%m%d").unwrap()
    }

    fn frame() -> Frame {
        let mut b = Frame::builder(vec!["close".to_string(), "open".to_string()]);
        for (i, (a_close, b_close)) in [(10.0, 20.0), (11.0, 20.0), (12.1, 20.0)].iter().enumerate()
        {
            let date = d("20240102") + chrono::Days::new(i as u64);
            b.push(date, "A", &[*a_close, a_close / 1.1]);
            b.push(date, "B", &[*b_close, *b_close]);
        }
        b.build()
    }

    #[test]
    fn evaluates_close_over_open() {
        let frame = frame();
        let series = evaluate_formula(&frame, "CLOSE / OPEN - 1").unwrap();
        // Symbol A rows first: close/open = 1.1 on every date.
        assert!((series.values()[0] - 0.1).abs() < 1e-9);
        assert_eq!(series.values()[3], 0.0);
    }

    #[test]
    fn column_references_are_case_insensitive() {
        let frame = frame();
        let upper = evaluate_formula(&frame, "CLOSE").unwrap();
        let lower = evaluate_formula(&frame, "close").unwrap();
        assert_eq!(upper.values(), lower.values());
    }

    #[test]
    fn scalar_only_formula_broadcasts() {
        let frame = frame();
        let series = evaluate_formula(&frame, "1 + 2 * 3").unwrap();
        assert_eq!(series.len(), frame.len());
        assert!(series.values().iter().all(|&v| v == 7.0));
    }

    #[test]
    fn program_bindings_feed_the_result() {
        let frame = frame();
        let series = evaluate_program(
            &frame,
            "let r = RETURNS(close);\nlet total = SUM(r, 3);\ntotal",
        )
        .unwrap();
        // Symbol A: returns 0, 0.1, 0.1 → trailing sums 0, 0.1, 0.2.
        assert!((series.values()[2] - 0.2).abs() < 1e-9);
        // Symbol B is flat.
        assert_eq!(series.values()[5], 0.0);
    }

    #[test]
    fn unknown_identifier_reports_binding_context() {
        let frame = frame();
        let err = evaluate_program(&frame, "let x = BOGUS_COL;\nx").unwrap_err();
        match err {
            FactorError::Computation { location, .. } => {
                let loc = location.expect("evaluation errors carry a location");
                assert_eq!(loc.context, "let x");
            }
            other => panic!("expected computation error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let frame = frame();
        let err = evaluate_formula(&frame, "EXEC(close)").unwrap_err();
        assert!(err.to_string().contains("unknown operator"));
    }

    #[test]
    fn window_argument_must_be_constant() {
        let frame = frame();
        let err = evaluate_formula(&frame, "SUM(close, close)").unwrap_err();
        assert!(err.to_string().contains("constant"));
    }

    #[test]
    fn rank_of_formula_matches_cross_section() {
        let frame = frame();
        let series = evaluate_formula(&frame, "RANK(CLOSE)").unwrap();
        // Two symbols per date: A below B on the first date.
        assert_eq!(series.values()[0], -0.5);
        assert_eq!(series.values()[3], 0.5);
    }
}
