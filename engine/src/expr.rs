// Parser and evaluator for parameter function expressions.
//
// Parses a token stream (from the lexer) into an AST, then flattens it into
// a postfix program evaluated by a tight allocation-free stack loop. Uses
// chumsky combinators for the grammar.
//
// Preconditions: input is a single expression in the restricted grammar
//                (BODMAS over + - * / ^, unary minus, builtin calls).
// Postconditions: returns a compiled program plus its dependency list, or a
//                 recognised population-aggregation descriptor.
// Failure modes: syntax errors, unknown functions, wrong arities, nested
//                aggregation calls.
// Side effects: none.

use std::collections::HashMap;
use std::fmt;

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::lexer::{self, Token};

/// Identifiers bound by the engine at evaluation time.
pub const RESERVED_BINDINGS: [&str; 2] = ["t", "dt"];

/// Builtin function names (unary then binary).
pub const BUILTIN_FUNCTIONS: [&str; 5] = ["exp", "floor", "ceil", "min", "max"];

// ── Aggregations ────────────────────────────────────────────────────────────

/// The four cross-population aggregation heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggKind {
    SrcPopAvg,
    TgtPopAvg,
    SrcPopSum,
    TgtPopSum,
}

impl AggKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SRC_POP_AVG" => Some(AggKind::SrcPopAvg),
            "TGT_POP_AVG" => Some(AggKind::TgtPopAvg),
            "SRC_POP_SUM" => Some(AggKind::SrcPopSum),
            "TGT_POP_SUM" => Some(AggKind::TgtPopSum),
            _ => None,
        }
    }

    /// AVG variants L1-normalise the weight rows.
    pub fn is_average(self) -> bool {
        matches!(self, AggKind::SrcPopAvg | AggKind::TgtPopAvg)
    }

    /// SRC variants aggregate over the interaction's source populations.
    pub fn is_source(self) -> bool {
        matches!(self, AggKind::SrcPopAvg | AggKind::SrcPopSum)
    }
}

impl fmt::Display for AggKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggKind::SrcPopAvg => "SRC_POP_AVG",
            AggKind::TgtPopAvg => "TGT_POP_AVG",
            AggKind::SrcPopSum => "SRC_POP_SUM",
            AggKind::TgtPopSum => "TGT_POP_SUM",
        };
        write!(f, "{s}")
    }
}

/// A recognised `AGG(par, interaction[, weight])` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggSpec {
    pub kind: AggKind,
    pub par: String,
    pub interaction: String,
    pub weight: Option<String>,
}

// ── AST ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Ident(String),
    Call(String, Vec<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

// ── Compiled program ────────────────────────────────────────────────────────

/// One postfix instruction. `Var` indexes the dependency table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Const(f64),
    Var(u32),
    Neg,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Exp,
    Floor,
    Ceil,
    Min,
    Max,
}

/// A compiled expression: a flat postfix program plus the identifier table
/// the `Var` slots index into (in first-reference order).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledExpr {
    pub source: String,
    ops: Vec<Op>,
    pub deps: Vec<String>,
}

impl CompiledExpr {
    /// Evaluate against a value slice aligned with `deps`.
    ///
    /// Non-finite results are returned as-is; the numeric policy (clamp or
    /// propagate) belongs to the caller.
    pub fn evaluate(&self, values: &[f64]) -> Result<f64> {
        if values.len() != self.deps.len() {
            let missing = self
                .deps
                .get(values.len())
                .cloned()
                .unwrap_or_else(|| "?".into());
            return Err(EngineError::UnboundIdentifier {
                name: missing,
                context: format!("function '{}'", self.source),
            });
        }

        let mut stack = [0.0f64; 32];
        let mut top = 0usize;
        macro_rules! push {
            ($v:expr) => {{
                stack[top] = $v;
                top += 1;
            }};
        }
        macro_rules! pop {
            () => {{
                top -= 1;
                stack[top]
            }};
        }

        for op in &self.ops {
            match *op {
                Op::Const(c) => push!(c),
                Op::Var(i) => push!(values[i as usize]),
                Op::Neg => {
                    let a = pop!();
                    push!(-a);
                }
                Op::Add => {
                    let b = pop!();
                    let a = pop!();
                    push!(a + b);
                }
                Op::Sub => {
                    let b = pop!();
                    let a = pop!();
                    push!(a - b);
                }
                Op::Mul => {
                    let b = pop!();
                    let a = pop!();
                    push!(a * b);
                }
                Op::Div => {
                    let b = pop!();
                    let a = pop!();
                    push!(a / b);
                }
                Op::Pow => {
                    let b = pop!();
                    let a = pop!();
                    push!(a.powf(b));
                }
                Op::Exp => {
                    let a = pop!();
                    push!(a.exp());
                }
                Op::Floor => {
                    let a = pop!();
                    push!(a.floor());
                }
                Op::Ceil => {
                    let a = pop!();
                    push!(a.ceil());
                }
                Op::Min => {
                    let b = pop!();
                    let a = pop!();
                    push!(a.min(b));
                }
                Op::Max => {
                    let b = pop!();
                    let a = pop!();
                    push!(a.max(b));
                }
            }
        }
        Ok(stack[0])
    }

    /// Evaluate against a name → value map. Fails with `UnboundIdentifier`
    /// for any dependency missing from the map.
    pub fn evaluate_named(&self, vars: &HashMap<String, f64>) -> Result<f64> {
        let mut values = Vec::with_capacity(self.deps.len());
        for name in &self.deps {
            match vars.get(name) {
                Some(v) => values.push(*v),
                None => {
                    return Err(EngineError::UnboundIdentifier {
                        name: name.clone(),
                        context: format!("function '{}'", self.source),
                    })
                }
            }
        }
        self.evaluate(&values)
    }

    /// Maximum operand-stack depth the program can reach.
    fn stack_depth(&self) -> usize {
        let mut depth = 0usize;
        let mut max = 0usize;
        for op in &self.ops {
            match op {
                Op::Const(_) | Op::Var(_) => depth += 1,
                Op::Neg | Op::Exp | Op::Floor | Op::Ceil => {}
                _ => depth -= 1,
            }
            max = max.max(depth);
        }
        max
    }
}

/// A parsed parameter function: an ordinary expression, or a recognised
/// top-level population aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParsedFunction {
    Expr(CompiledExpr),
    Aggregation(AggSpec),
}

impl ParsedFunction {
    /// Dependency names needed to evaluate this function. For aggregations
    /// the argument parameter and optional weight variable (the interaction
    /// is resolved separately).
    pub fn deps(&self) -> Vec<String> {
        match self {
            ParsedFunction::Expr(c) => c.deps.clone(),
            ParsedFunction::Aggregation(a) => {
                let mut deps = vec![a.par.clone()];
                if let Some(w) = &a.weight {
                    deps.push(w.clone());
                }
                deps
            }
        }
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Parse and compile one parameter function.
pub fn parse_function(source: &str) -> Result<ParsedFunction> {
    let ast = parse_ast(source)?;

    if let Expr::Call(name, args) = &ast {
        if let Some(kind) = AggKind::from_name(name) {
            return Ok(ParsedFunction::Aggregation(build_agg(kind, args, source)?));
        }
    }

    let compiled = compile(&ast, source)?;
    if compiled.stack_depth() > 32 {
        return Err(EngineError::framework(format!(
            "function '{source}': expression nests too deeply"
        )));
    }
    Ok(ParsedFunction::Expr(compiled))
}

fn build_agg(kind: AggKind, args: &[Expr], source: &str) -> Result<AggSpec> {
    let names: Vec<&String> = args
        .iter()
        .filter_map(|a| match a {
            Expr::Ident(n) => Some(n),
            _ => None,
        })
        .collect();
    if names.len() != args.len() || !(2..=3).contains(&args.len()) {
        return Err(EngineError::framework(format!(
            "function '{source}': {kind} expects (par_name, interaction_name[, weight_var_name])"
        )));
    }
    Ok(AggSpec {
        kind,
        par: names[0].clone(),
        interaction: names[1].clone(),
        weight: names.get(2).map(|s| (*s).clone()),
    })
}

// ── AST → postfix compilation ───────────────────────────────────────────────

fn compile(ast: &Expr, source: &str) -> Result<CompiledExpr> {
    let mut ops = Vec::new();
    let mut deps: Vec<String> = Vec::new();
    emit(ast, source, &mut ops, &mut deps)?;
    Ok(CompiledExpr {
        source: source.to_string(),
        ops,
        deps,
    })
}

fn emit(ast: &Expr, source: &str, ops: &mut Vec<Op>, deps: &mut Vec<String>) -> Result<()> {
    match ast {
        Expr::Number(n) => ops.push(Op::Const(*n)),
        Expr::Ident(name) => {
            let slot = match deps.iter().position(|d| d == name) {
                Some(i) => i,
                None => {
                    deps.push(name.clone());
                    deps.len() - 1
                }
            };
            ops.push(Op::Var(slot as u32));
        }
        Expr::Neg(inner) => {
            emit(inner, source, ops, deps)?;
            ops.push(Op::Neg);
        }
        Expr::Binary(op, lhs, rhs) => {
            emit(lhs, source, ops, deps)?;
            emit(rhs, source, ops, deps)?;
            ops.push(match op {
                BinOp::Add => Op::Add,
                BinOp::Sub => Op::Sub,
                BinOp::Mul => Op::Mul,
                BinOp::Div => Op::Div,
                BinOp::Pow => Op::Pow,
            });
        }
        Expr::Call(name, args) => {
            if AggKind::from_name(name).is_some() {
                return Err(EngineError::framework(format!(
                    "function '{source}': aggregation '{name}' must form the entire function"
                )));
            }
            let (opcode, arity) = match name.as_str() {
                "exp" => (Op::Exp, 1),
                "floor" => (Op::Floor, 1),
                "ceil" => (Op::Ceil, 1),
                "min" => (Op::Min, 2),
                "max" => (Op::Max, 2),
                other => {
                    return Err(EngineError::framework(format!(
                        "function '{source}': unknown function '{other}'"
                    )))
                }
            };
            if args.len() != arity {
                return Err(EngineError::framework(format!(
                    "function '{source}': '{name}' takes {arity} argument(s), got {}",
                    args.len()
                )));
            }
            for arg in args {
                emit(arg, source, ops, deps)?;
            }
            ops.push(opcode);
        }
    }
    Ok(())
}

// ── Token stream → AST ──────────────────────────────────────────────────────

fn parse_ast(source: &str) -> Result<Expr> {
    let lex_result = lexer::lex(source);
    if let Some(err) = lex_result.errors.first() {
        return Err(EngineError::framework(format!(
            "function '{source}': {}",
            err.message
        )));
    }

    let len = source.len();
    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = expr_parser(source);
    let (output, errors) = parser.parse(stream).into_output_errors();

    match output {
        Some(ast) if errors.is_empty() => Ok(ast),
        _ => {
            let detail = errors
                .first()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "empty expression".into());
            Err(EngineError::framework(format!(
                "function '{source}': parse error: {detail}"
            )))
        }
    }
}

// All grammar rules are built inside `expr_parser` so that the `source`
// reference is captured once and shared by all combinators.

fn expr_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, Expr, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    recursive(|expr| {
        let ident = just(Token::Ident).map_with(move |_, e| {
            let span: SimpleSpan = e.span();
            source[span.start()..span.end()].to_string()
        });

        let number = select! { Token::Number(n) => n };

        let call = ident
            .clone()
            .then(
                expr.clone()
                    .separated_by(just(Token::Comma))
                    .at_least(1)
                    .collect::<Vec<_>>()
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .map(|(name, args)| Expr::Call(name, args));

        let atom = choice((
            number.map(Expr::Number),
            call,
            ident.map(Expr::Ident),
            expr.clone()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        ));

        // Unary minus binds tighter than exponentiation: -x^2 == (-x)^2,
        // matching the left-to-right grammar this engine inherits.
        let unary = just(Token::Minus)
            .repeated()
            .foldr(atom, |_minus, inner| Expr::Neg(Box::new(inner)));

        // Exponentiation chains associate right-to-left.
        let power = recursive(|power| {
            unary
                .clone()
                .then(
                    just(Token::Caret)
                        .or(just(Token::DoubleStar))
                        .ignore_then(power)
                        .or_not(),
                )
                .map(|(base, exp)| match exp {
                    Some(e) => Expr::Binary(BinOp::Pow, Box::new(base), Box::new(e)),
                    None => base,
                })
        });

        let product = power.clone().foldl(
            just(Token::Star)
                .to(BinOp::Mul)
                .or(just(Token::Slash).to(BinOp::Div))
                .then(power)
                .repeated(),
            |lhs, (op, rhs)| Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
        );

        product.clone().foldl(
            just(Token::Plus)
                .to(BinOp::Add)
                .or(just(Token::Minus).to(BinOp::Sub))
                .then(product)
                .repeated(),
            |lhs, (op, rhs)| Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
        )
    })
}

// ── Tests ──
