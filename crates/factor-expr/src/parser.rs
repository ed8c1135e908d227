use factor_core::{CodeLocation, FactorError};
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "grammar.pest"]
struct DslParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    /// Column reference or let-bound variable.
    Ident {
        name: String,
        line: usize,
        column: usize,
    },
    Call {
        name: String,
        args: Vec<Expr>,
        line: usize,
        column: usize,
    },
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LetBinding {
    pub name: String,
    pub expr: Expr,
    pub line: usize,
    pub column: usize,
}

/// A parsed program-dialect factor: bindings evaluated in order, then the
/// result expression.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorProgram {
    pub bindings: Vec<LetBinding>,
    pub result: Expr,
}

pub fn parse_formula(code: &str) -> Result<Expr, FactorError> {
    let mut pairs = DslParser::parse(Rule::formula, code).map_err(parse_error)?;
    let formula = pairs.next().expect("formula rule always present on success");
    let expr_pair = formula
        .into_inner()
        .find(|p| p.as_rule() == Rule::expr)
        .expect("formula contains an expression");
    Ok(build_expr(expr_pair))
}

pub fn parse_program(code: &str) -> Result<FactorProgram, FactorError> {
    let mut pairs = DslParser::parse(Rule::program, code).map_err(parse_error)?;
    let program = pairs.next().expect("program rule always present on success");

    let mut bindings = Vec::new();
    let mut result = None;
    for pair in program.into_inner() {
        match pair.as_rule() {
            Rule::let_binding => {
                let (line, column) = pair.line_col();
                let mut inner = pair.into_inner();
                inner.next(); // kw_let
                let name = inner.next().expect("binding name").as_str().to_string();
                let expr = build_expr(inner.next().expect("binding expression"));
                bindings.push(LetBinding {
                    name,
                    expr,
                    line,
                    column,
                });
            }
            Rule::expr => result = Some(build_expr(pair)),
            Rule::EOI => {}
            other => unreachable!("unexpected program rule {other:?}"),
        }
    }

    Ok(FactorProgram {
        bindings,
        result: result.expect("program contains a result expression"),
    })
}

fn build_expr(pair: Pair<Rule>) -> Expr {
    match pair.as_rule() {
        Rule::expr | Rule::paren => build_expr(pair.into_inner().next().expect("inner expr")),
        Rule::comparison => build_binary_chain(pair),
        Rule::sum => build_binary_chain(pair),
        Rule::product => build_binary_chain(pair),
        Rule::unary => build_expr(pair.into_inner().next().expect("unary inner")),
        Rule::neg => Expr::Neg(Box::new(build_expr(
            pair.into_inner().next().expect("negated operand"),
        ))),
        Rule::primary => build_expr(pair.into_inner().next().expect("primary inner")),
        Rule::number => Expr::Number(pair.as_str().parse().expect("grammar guarantees a number")),
        Rule::ident => {
            let (line, column) = pair.line_col();
            Expr::Ident {
                name: pair.as_str().to_string(),
                line,
                column,
            }
        }
        Rule::call => {
            let (line, column) = pair.line_col();
            let mut inner = pair.into_inner();
            let name = inner.next().expect("call name").as_str().to_string();
            let args = inner
                .next()
                .map(|args| args.into_inner().map(build_expr).collect())
                .unwrap_or_default();
            Expr::Call {
                name,
                args,
                line,
                column,
            }
        }
        other => unreachable!("unexpected expression rule {other:?}"),
    }
}

/// Fold a left-associative `operand (op operand)*` chain.
fn build_binary_chain(pair: Pair<Rule>) -> Expr {
    let mut inner = pair.into_inner();
    let mut expr = build_expr(inner.next().expect("chain head"));
    while let Some(op_pair) = inner.next() {
        let op = match op_pair.as_str() {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            ">" => BinaryOp::Gt,
            "<" => BinaryOp::Lt,
            ">=" => BinaryOp::Ge,
            "<=" => BinaryOp::Le,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            other => unreachable!("unexpected operator {other:?}"),
        };
        let right = build_expr(inner.next().expect("chain operand"));
        expr = Expr::Binary {
            op,
            left: Box::new(expr),
            right: Box::new(right),
        };
    }
    expr
}

fn parse_error(err: pest::error::Error<Rule>) -> FactorError {
    let (line, column) = match err.line_col {
        pest::error::LineColLocation::Pos((l, c)) => (l, c),
        pest::error::LineColLocation::Span((l, c), _) => (l, c),
    };
    FactorError::computation_at(
        format!("syntax error: {}", err.variant.message()),
        CodeLocation {
            line,
            column,
            context: err.line().to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_formula() {
        let expr = parse_formula("CLOSE / OPEN - 1").unwrap();
        match expr {
            Expr::Binary {
                op: BinaryOp::Sub, ..
            } => {}
            other => panic!("expected subtraction at the top, got {other:?}"),
        }
    }

    #[test]
    fn parses_nested_calls() {
        let expr = parse_formula("RANK(SUM(RETURNS(CLOSE), 20))").unwrap();
        match expr {
            Expr::Call { name, args, .. } => {
                assert_eq!(name, "RANK");
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn parses_program_with_bindings() {
        let program = parse_program(
            "let r = RETURNS(close);\nlet vol = STDDEV(r, 20);\nr / vol",
        )
        .unwrap();
        assert_eq!(program.bindings.len(), 2);
        assert_eq!(program.bindings[0].name, "r");
        assert_eq!(program.bindings[1].name, "vol");
    }

    #[test]
    fn syntax_error_carries_position() {
        let err = parse_formula("CLOSE / / OPEN").unwrap_err();
        match err {
            FactorError::Computation { location, .. } => {
                let loc = location.expect("parse errors carry a location");
                assert_eq!(loc.line, 1);
                assert!(loc.column > 1);
            }
            other => panic!("expected computation error, got {other:?}"),
        }
    }

    #[test]
    fn comparison_operators_parse() {
        let expr = parse_formula("IF(CLOSE > OPEN, 1, 0 - 1)").unwrap();
        match expr {
            Expr::Call { name, args, .. } => {
                assert_eq!(name, "IF");
                assert_eq!(args.len(), 3);
                assert!(matches!(
                    args[0],
                    Expr::Binary {
                        op: BinaryOp::Gt,
                        ..
                    }
                ));
            }
            other => panic!("expected IF call, got {other:?}"),
        }
    }

    #[test]
    fn unary_minus_parses() {
        let expr = parse_formula("-RANK(CLOSE)").unwrap();
        assert!(matches!(expr, Expr::Neg(_)));
    }
}
