//! The built-in script context

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use super::lexer::BinOp;
use super::parser::{CmpOp, Expr, Stmt, Target, parse_expression, parse_program};
use super::{EvalError, ExecutionContext, Host};
use crate::lock;
use crate::value::Value;

/// Longest list or string a single operation may build
const MAX_SEQUENCE_LEN: usize = 10_000_000;

/// A namespace environment running a small Python-flavoured language
///
/// Variables persist across calls. The environment lock is only held for
/// individual reads and writes, so concurrent runs interleave at statement
/// granularity.
#[derive(Debug, Default)]
pub struct ScriptContext {
    globals: Mutex<HashMap<String, Value>>,
}

impl ScriptContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        lock(&self.globals).get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        lock(&self.globals).insert(name.into(), value);
    }

    fn assign(&self, target: &Target, value: Value, host: &dyn Host) -> Result<(), EvalError> {
        match target {
            Target::Name(name) => {
                self.set(name.clone(), value);
                Ok(())
            }
            Target::Item(name, index) => {
                let index = self.evaluate(index, host)?;
                let mut globals = lock(&self.globals);
                let container = globals
                    .get_mut(name)
                    .ok_or_else(|| EvalError::Name(name.clone()))?;
                match (container, index) {
                    (Value::List(items), Value::Int(i)) => {
                        let slot = list_slot(items.len(), i)?;
                        items[slot] = value;
                        Ok(())
                    }
                    (Value::Map(map), Value::Str(key)) => {
                        map.insert(key, value);
                        Ok(())
                    }
                    (container, index) => Err(EvalError::Type(format!(
                        "'{}' object does not support item assignment with '{}' index",
                        container.type_name(),
                        index.type_name()
                    ))),
                }
            }
        }
    }

    fn delete(&self, target: &Target, host: &dyn Host) -> Result<(), EvalError> {
        match target {
            Target::Name(name) => lock(&self.globals)
                .remove(name)
                .map(drop)
                .ok_or_else(|| EvalError::Name(name.clone())),
            Target::Item(name, index) => {
                let index = self.evaluate(index, host)?;
                let mut globals = lock(&self.globals);
                let container = globals
                    .get_mut(name)
                    .ok_or_else(|| EvalError::Name(name.clone()))?;
                match (container, index) {
                    (Value::List(items), Value::Int(i)) => {
                        let slot = list_slot(items.len(), i)?;
                        items.remove(slot);
                        Ok(())
                    }
                    (Value::Map(map), Value::Str(key)) => map
                        .remove(&key)
                        .map(drop)
                        .ok_or_else(|| EvalError::Key(format!("'{key}'"))),
                    (container, _) => Err(EvalError::Type(format!(
                        "'{}' object does not support item deletion",
                        container.type_name()
                    ))),
                }
            }
        }
    }

    fn execute(&self, stmt: &Stmt, host: &dyn Host) -> Result<(), EvalError> {
        match stmt {
            Stmt::Assign(target, expr) => {
                let value = self.evaluate(expr, host)?;
                self.assign(target, value, host)
            }
            Stmt::AugAssign(target, op, expr) => {
                let current = match target {
                    Target::Name(name) => self.lookup(name)?,
                    Target::Item(name, index) => {
                        let container = self.lookup(name)?;
                        let index = self.evaluate(index, host)?;
                        subscript(&container, &index)?
                    }
                };
                let rhs = self.evaluate(expr, host)?;
                let value = binary(*op, current, rhs)?;
                self.assign(target, value, host)
            }
            Stmt::Del(targets) => targets.iter().try_for_each(|t| self.delete(t, host)),
            Stmt::Pass => Ok(()),
            Stmt::Expr(expr) => self.evaluate(expr, host).map(drop),
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, EvalError> {
        self.get(name).ok_or_else(|| EvalError::Name(name.to_string()))
    }

    fn evaluate(&self, expr: &Expr, host: &dyn Host) -> Result<Value, EvalError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => items
                .iter()
                .map(|item| self.evaluate(item, host))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Expr::Dict(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let key = match self.evaluate(key, host)? {
                        Value::Str(key) => key,
                        other => {
                            return Err(EvalError::Type(format!(
                                "dict keys must be str, not '{}'",
                                other.type_name()
                            )));
                        }
                    };
                    map.insert(key, self.evaluate(value, host)?);
                }
                Ok(Value::Map(map))
            }
            Expr::Neg(inner) => match self.evaluate(inner, host)? {
                Value::Int(i) => i
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| EvalError::Overflow("integer overflow".into())),
                Value::Bool(b) => Ok(Value::Int(-i64::from(b))),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(EvalError::Type(format!(
                    "bad operand type for unary -: '{}'",
                    other.type_name()
                ))),
            },
            Expr::Not(inner) => Ok(Value::Bool(!self.evaluate(inner, host)?.is_truthy())),
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.evaluate(lhs, host)?;
                let rhs = self.evaluate(rhs, host)?;
                binary(*op, lhs, rhs)
            }
            Expr::Compare(first, chain) => {
                let mut lhs = self.evaluate(first, host)?;
                for (op, rhs) in chain {
                    let rhs = self.evaluate(rhs, host)?;
                    if !compare(*op, &lhs, &rhs)? {
                        return Ok(Value::Bool(false));
                    }
                    lhs = rhs;
                }
                Ok(Value::Bool(true))
            }
            Expr::And(lhs, rhs) => {
                let lhs = self.evaluate(lhs, host)?;
                if lhs.is_truthy() {
                    self.evaluate(rhs, host)
                } else {
                    Ok(lhs)
                }
            }
            Expr::Or(lhs, rhs) => {
                let lhs = self.evaluate(lhs, host)?;
                if lhs.is_truthy() {
                    Ok(lhs)
                } else {
                    self.evaluate(rhs, host)
                }
            }
            Expr::Index(base, index) => {
                let base = self.evaluate(base, host)?;
                let index = self.evaluate(index, host)?;
                subscript(&base, &index)
            }
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|arg| self.evaluate(arg, host))
                    .collect::<Result<Vec<_>, _>>()?;
                if name.contains('.') {
                    return host
                        .call(name, &args)
                        .unwrap_or_else(|| Err(EvalError::Name(name.clone())));
                }
                builtin(name, args)
            }
        }
    }
}

impl ExecutionContext for ScriptContext {
    fn run(&self, code: &str, host: &dyn Host) -> Result<(), EvalError> {
        let program = parse_program(code)?;
        program.iter().try_for_each(|stmt| self.execute(stmt, host))
    }

    fn eval(&self, expr: &str, host: &dyn Host) -> Result<Value, EvalError> {
        let expr = parse_expression(expr)?;
        self.evaluate(&expr, host)
    }
}

enum Num {
    Int(i64),
    Float(f64),
}

fn number(value: &Value) -> Option<Num> {
    match value {
        Value::Bool(b) => Some(Num::Int(i64::from(*b))),
        Value::Int(i) => Some(Num::Int(*i)),
        Value::Float(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

fn overflow() -> EvalError {
    EvalError::Overflow("integer overflow".into())
}

fn unsupported(op: &str, lhs: &Value, rhs: &Value) -> EvalError {
    EvalError::Type(format!(
        "unsupported operand type(s) for {op}: '{}' and '{}'",
        lhs.type_name(),
        rhs.type_name()
    ))
}

fn repeat<T: Clone>(items: &[T], times: i64) -> Result<Vec<T>, EvalError> {
    let times = usize::try_from(times.max(0)).map_err(|_| overflow())?;
    if items.len().saturating_mul(times) > MAX_SEQUENCE_LEN {
        return Err(EvalError::Overflow("repeated sequence is too long".into()));
    }
    Ok((0..times).flat_map(|_| items.iter().cloned()).collect())
}

fn binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, EvalError> {
    match (op, &lhs, &rhs) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => return Ok(Value::Str(format!("{a}{b}"))),
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            return Ok(Value::List(a.iter().chain(b).cloned().collect()));
        }
        (BinOp::Mul, Value::Str(s), Value::Int(n)) | (BinOp::Mul, Value::Int(n), Value::Str(s)) => {
            let chars: Vec<char> = s.chars().collect();
            return Ok(Value::Str(repeat(&chars, *n)?.into_iter().collect()));
        }
        (BinOp::Mul, Value::List(items), Value::Int(n))
        | (BinOp::Mul, Value::Int(n), Value::List(items)) => {
            return Ok(Value::List(repeat(items, *n)?));
        }
        _ => {}
    }

    let (Some(a), Some(b)) = (number(&lhs), number(&rhs)) else {
        return Err(unsupported(op.symbol(), &lhs, &rhs));
    };
    match (a, b) {
        (Num::Int(a), Num::Int(b)) => int_binary(op, a, b),
        (a, b) => {
            let a = match a {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            let b = match b {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            float_binary(op, a, b)
        }
    }
}

fn int_binary(op: BinOp, a: i64, b: i64) -> Result<Value, EvalError> {
    let value = match op {
        BinOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinOp::Div => {
            if b == 0 {
                return Err(EvalError::ZeroDivision("division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinOp::FloorDiv | BinOp::Mod => {
            if b == 0 {
                return Err(EvalError::ZeroDivision("integer division or modulo by zero"));
            }
            let quotient = a.checked_div(b).ok_or_else(overflow)?;
            let remainder = a.checked_rem(b).ok_or_else(overflow)?;
            // round toward negative infinity
            let adjust = remainder != 0 && ((remainder < 0) != (b < 0));
            if op == BinOp::FloorDiv {
                if adjust { quotient - 1 } else { quotient }
            } else if adjust {
                remainder + b
            } else {
                remainder
            }
        }
        BinOp::Pow => {
            if b < 0 {
                return float_binary(op, a as f64, b as f64);
            }
            let exponent = u32::try_from(b).map_err(|_| overflow())?;
            a.checked_pow(exponent).ok_or_else(overflow)?
        }
    };
    Ok(Value::Int(value))
}

fn float_binary(op: BinOp, a: f64, b: f64) -> Result<Value, EvalError> {
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(EvalError::ZeroDivision("division by zero"));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(EvalError::ZeroDivision("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(EvalError::ZeroDivision("float modulo"));
            }
            a - b * (a / b).floor()
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(EvalError::ZeroDivision(
                    "0.0 cannot be raised to a negative power",
                ));
            }
            a.powf(b)
        }
    };
    Ok(Value::Float(value))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (number(a), number(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => x == y,
        (Some(x), Some(y)) => {
            let x = match x {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            let y = match y {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            x == y
        }
        _ => match (a, b) {
            (Value::List(x), Value::List(y)) => {
                x.len() == y.len() && x.iter().zip(y).all(|(x, y)| values_equal(x, y))
            }
            _ => a == b,
        },
    }
}

fn ordering(a: &Value, b: &Value, symbol: &str) -> Result<Ordering, EvalError> {
    let unorderable = || {
        EvalError::Type(format!(
            "'{symbol}' not supported between instances of '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))
    };
    match (number(a), number(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => Ok(x.cmp(&y)),
        (Some(x), Some(y)) => {
            let x = match x {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            let y = match y {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            x.partial_cmp(&y).ok_or_else(unorderable)
        }
        _ => match (a, b) {
            (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
            (Value::List(x), Value::List(y)) => {
                for (x, y) in x.iter().zip(y) {
                    if !values_equal(x, y) {
                        return ordering(x, y, symbol);
                    }
                }
                Ok(x.len().cmp(&y.len()))
            }
            _ => Err(unorderable()),
        },
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool, EvalError> {
    match (container, item) {
        (Value::List(items), item) => Ok(items.iter().any(|x| values_equal(x, item))),
        (Value::Str(s), Value::Str(sub)) => Ok(s.contains(sub.as_str())),
        (Value::Map(map), Value::Str(key)) => Ok(map.contains_key(key)),
        (Value::Map(_), _) => Ok(false),
        (Value::Str(_), other) => Err(EvalError::Type(format!(
            "'in <string>' requires string as left operand, not {}",
            other.type_name()
        ))),
        (other, _) => Err(EvalError::Type(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> Result<bool, EvalError> {
    Ok(match op {
        CmpOp::Eq => values_equal(lhs, rhs),
        CmpOp::Ne => !values_equal(lhs, rhs),
        CmpOp::Lt => ordering(lhs, rhs, "<")? == Ordering::Less,
        CmpOp::Le => ordering(lhs, rhs, "<=")? != Ordering::Greater,
        CmpOp::Gt => ordering(lhs, rhs, ">")? == Ordering::Greater,
        CmpOp::Ge => ordering(lhs, rhs, ">=")? != Ordering::Less,
        CmpOp::In => contains(rhs, lhs)?,
        CmpOp::NotIn => !contains(rhs, lhs)?,
    })
}

fn list_slot(len: usize, index: i64) -> Result<usize, EvalError> {
    let resolved = if index < 0 {
        i64::try_from(len).ok().and_then(|len| len.checked_add(index))
    } else {
        Some(index)
    };
    resolved
        .and_then(|i| usize::try_from(i).ok())
        .filter(|i| *i < len)
        .ok_or_else(|| EvalError::Index("list index out of range".into()))
}

fn subscript(base: &Value, index: &Value) -> Result<Value, EvalError> {
    match (base, index) {
        (Value::List(items), Value::Int(i)) => Ok(items[list_slot(items.len(), *i)?].clone()),
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let slot = list_slot(chars.len(), *i)
                .map_err(|_| EvalError::Index("string index out of range".into()))?;
            Ok(Value::Str(chars[slot].to_string()))
        }
        (Value::Map(map), Value::Str(key)) => map
            .get(key)
            .cloned()
            .ok_or_else(|| EvalError::Key(format!("'{key}'"))),
        (Value::Map(_), other) => Err(EvalError::Key(other.to_string())),
        (base, index) => Err(EvalError::Type(format!(
            "'{}' object is not subscriptable with '{}'",
            base.type_name(),
            index.type_name()
        ))),
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), EvalError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{min}")
        } else {
            format!("{min} to {max}")
        };
        return Err(EvalError::Type(format!(
            "{name}() takes {expected} arguments ({} given)",
            args.len()
        )));
    }
    Ok(())
}

fn to_int(value: &Value) -> Result<i64, EvalError> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Float(f) => {
            if !f.is_finite() {
                return Err(EvalError::Overflow(format!("cannot convert float {f} to integer")));
            }
            let truncated = f.trunc();
            if truncated < i64::MIN as f64 || truncated >= i64::MAX as f64 {
                return Err(overflow());
            }
            Ok(truncated as i64)
        }
        Value::Str(s) => s.trim().replace('_', "").parse().map_err(|_| {
            EvalError::Value(format!("invalid literal for int() with base 10: '{s}'"))
        }),
        other => Err(EvalError::Type(format!(
            "int() argument must be a string or a number, not '{}'",
            other.type_name()
        ))),
    }
}

fn to_float(value: &Value) -> Result<f64, EvalError> {
    match value {
        Value::Int(i) => Ok(*i as f64),
        Value::Bool(b) => Ok(f64::from(u8::from(*b))),
        Value::Float(f) => Ok(*f),
        Value::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
            "inf" | "+inf" | "infinity" => Ok(f64::INFINITY),
            "-inf" | "-infinity" => Ok(f64::NEG_INFINITY),
            "nan" => Ok(f64::NAN),
            text => text.parse().map_err(|_| {
                EvalError::Value(format!("could not convert string to float: '{s}'"))
            }),
        },
        other => Err(EvalError::Type(format!(
            "float() argument must be a string or a number, not '{}'",
            other.type_name()
        ))),
    }
}

/// Items of an iterable argument
fn iterate(value: Value) -> Result<Vec<Value>, EvalError> {
    match value {
        Value::List(items) => Ok(items),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        Value::Map(map) => Ok(map.into_keys().map(Value::Str).collect()),
        other => Err(EvalError::Type(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

fn extreme(name: &str, args: Vec<Value>, wanted: Ordering) -> Result<Value, EvalError> {
    let items = if args.len() == 1 {
        iterate(args.into_iter().next().unwrap_or_default())?
    } else {
        args
    };
    let mut items = items.into_iter();
    let mut best = items
        .next()
        .ok_or_else(|| EvalError::Value(format!("{name}() arg is an empty sequence")))?;
    for item in items {
        if ordering(&item, &best, if wanted == Ordering::Less { "<" } else { ">" })? == wanted {
            best = item;
        }
    }
    Ok(best)
}

fn builtin(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    match name {
        "len" => {
            arity(name, &args, 1, 1)?;
            let len = match &args[0] {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.len(),
                Value::Map(map) => map.len(),
                other => {
                    return Err(EvalError::Type(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )));
                }
            };
            i64::try_from(len).map(Value::Int).map_err(|_| overflow())
        }
        "str" => {
            arity(name, &args, 0, 1)?;
            Ok(Value::Str(args.first().map(Value::to_text).unwrap_or_default()))
        }
        "repr" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Str(args[0].to_string()))
        }
        "type" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Str(args[0].type_name().to_string()))
        }
        "int" => {
            arity(name, &args, 0, 1)?;
            args.first().map_or(Ok(0), to_int).map(Value::Int)
        }
        "float" => {
            arity(name, &args, 0, 1)?;
            args.first().map_or(Ok(0.0), to_float).map(Value::Float)
        }
        "bool" => {
            arity(name, &args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(Value::is_truthy)))
        }
        "abs" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Int(i) => i.checked_abs().map(Value::Int).ok_or_else(overflow),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(EvalError::Type(format!(
                    "bad operand type for abs(): '{}'",
                    other.type_name()
                ))),
            }
        }
        "min" => {
            arity(name, &args, 1, usize::MAX)?;
            extreme(name, args, Ordering::Less)
        }
        "max" => {
            arity(name, &args, 1, usize::MAX)?;
            extreme(name, args, Ordering::Greater)
        }
        "sum" => {
            arity(name, &args, 1, 2)?;
            let mut args = args.into_iter();
            let items = iterate(args.next().unwrap_or_default())?;
            let start = args.next().unwrap_or(Value::Int(0));
            items
                .into_iter()
                .try_fold(start, |acc, item| binary(BinOp::Add, acc, item))
        }
        "range" => {
            arity(name, &args, 1, 3)?;
            let bounds = args.iter().map(to_int).collect::<Result<Vec<_>, _>>()?;
            let (start, stop, step) = match bounds.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => unreachable!("arity checked"),
            };
            if step == 0 {
                return Err(EvalError::Value("range() arg 3 must not be zero".into()));
            }
            let span = (i128::from(stop) - i128::from(start)) / i128::from(step);
            if span > MAX_SEQUENCE_LEN as i128 {
                return Err(EvalError::Overflow("range is too large".into()));
            }
            let mut items = Vec::new();
            let mut current = start;
            while (step > 0 && current < stop) || (step < 0 && current > stop) {
                items.push(Value::Int(current));
                match current.checked_add(step) {
                    Some(next) => current = next,
                    None => break,
                }
            }
            Ok(Value::List(items))
        }
        "sorted" => {
            arity(name, &args, 1, 1)?;
            let mut items = iterate(args.into_iter().next().unwrap_or_default())?;
            let mut failure = None;
            items.sort_by(|a, b| {
                ordering(a, b, "<").unwrap_or_else(|err| {
                    failure.get_or_insert(err);
                    Ordering::Equal
                })
            });
            match failure {
                Some(err) => Err(err),
                None => Ok(Value::List(items)),
            }
        }
        "sleep" => {
            arity(name, &args, 1, 1)?;
            let seconds = to_float(&args[0])?;
            let duration = Duration::try_from_secs_f64(seconds).map_err(|_| {
                EvalError::Value("sleep length must be a non-negative finite number".into())
            })?;
            std::thread::sleep(duration);
            Ok(Value::None)
        }
        "fail" => {
            arity(name, &args, 0, 1)?;
            Err(EvalError::Raised(
                args.first().map(Value::to_text).unwrap_or_default(),
            ))
        }
        _ => Err(EvalError::Name(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoHost;

    fn eval(ctx: &ScriptContext, expr: &str) -> Result<Value, EvalError> {
        ctx.eval(expr, &NoHost)
    }

    #[test]
    fn test_arithmetic() {
        let ctx = ScriptContext::new();
        assert_eq!(eval(&ctx, "6*7").unwrap(), Value::Int(42));
        assert_eq!(eval(&ctx, "7 / 2").unwrap(), Value::Float(3.5));
        assert_eq!(eval(&ctx, "-7 // 2").unwrap(), Value::Int(-4));
        assert_eq!(eval(&ctx, "-7 % 3").unwrap(), Value::Int(2));
        assert_eq!(eval(&ctx, "2 ** 10").unwrap(), Value::Int(1024));
        assert_eq!(eval(&ctx, "2 ** -1").unwrap(), Value::Float(0.5));
        assert_eq!(eval(&ctx, "'ab' * 2 + 'c'").unwrap(), Value::from("ababc"));
        assert_eq!(
            eval(&ctx, "['a', 1] * 2").unwrap(),
            Value::List(vec![Value::from("a"), Value::Int(1), Value::from("a"), Value::Int(1)])
        );
        assert_eq!(eval(&ctx, "[1] * -3").unwrap(), Value::List(vec![]));
    }

    #[test]
    fn test_division_by_zero() {
        let ctx = ScriptContext::new();
        let err = eval(&ctx, "1/0").unwrap_err();
        assert_eq!(err.to_string(), "ZeroDivisionError: division by zero");
        assert!(matches!(eval(&ctx, "1 % 0"), Err(EvalError::ZeroDivision(_))));
    }

    #[test]
    fn test_overflow_is_an_error() {
        let ctx = ScriptContext::new();
        assert!(matches!(
            eval(&ctx, "9223372036854775807 + 1"),
            Err(EvalError::Overflow(_))
        ));
        assert!(matches!(eval(&ctx, "2 ** 100"), Err(EvalError::Overflow(_))));
    }

    #[test]
    fn test_state_persists_across_runs() {
        let ctx = ScriptContext::new();
        ctx.run("x = 1\ny = [1, 2]; d = {'a': 1}", &NoHost).unwrap();
        ctx.run("x += 41; y[0] = 5; d['b'] = x", &NoHost).unwrap();
        assert_eq!(eval(&ctx, "x").unwrap(), Value::Int(42));
        assert_eq!(eval(&ctx, "y").unwrap(), Value::from(vec![5i64, 2]));
        assert_eq!(eval(&ctx, "d['b']").unwrap(), Value::Int(42));
        ctx.run("del x", &NoHost).unwrap();
        assert_eq!(
            eval(&ctx, "x").unwrap_err().to_string(),
            "NameError: name 'x' is not defined"
        );
    }

    #[test]
    fn test_syntax_error_runs_nothing() {
        let ctx = ScriptContext::new();
        assert!(matches!(
            ctx.run("x = 1\ny = (", &NoHost),
            Err(EvalError::Syntax(_))
        ));
        assert_eq!(ctx.get("x"), None);
    }

    #[test]
    fn test_comparisons_and_logic() {
        let ctx = ScriptContext::new();
        assert_eq!(eval(&ctx, "1 < 2 <= 2.0").unwrap(), Value::Bool(true));
        assert_eq!(eval(&ctx, "1 == 1.0 and 'a' in 'cat'").unwrap(), Value::Bool(true));
        assert_eq!(eval(&ctx, "3 not in [1, 2]").unwrap(), Value::Bool(true));
        assert_eq!(eval(&ctx, "0 or 'fallback'").unwrap(), Value::from("fallback"));
        assert!(matches!(eval(&ctx, "1 < 'a'"), Err(EvalError::Type(_))));
    }

    #[test]
    fn test_builtins() {
        let ctx = ScriptContext::new();
        assert_eq!(eval(&ctx, "len('héllo')").unwrap(), Value::Int(5));
        assert_eq!(eval(&ctx, "sum(range(5))").unwrap(), Value::Int(10));
        assert_eq!(eval(&ctx, "max(3, 9, 4)").unwrap(), Value::Int(9));
        assert_eq!(eval(&ctx, "sorted([3, 1, 2])").unwrap(), Value::from(vec![1i64, 2, 3]));
        assert_eq!(eval(&ctx, "int('42') + int(2.9)").unwrap(), Value::Int(44));
        assert_eq!(eval(&ctx, "str(1.0)").unwrap(), Value::from("1.0"));
        assert_eq!(eval(&ctx, "repr('a')").unwrap(), Value::from("'a'"));
        assert_eq!(
            eval(&ctx, "fail('boom')").unwrap_err().to_string(),
            "Exception: boom"
        );
        assert!(matches!(eval(&ctx, "nope()"), Err(EvalError::Name(_))));
        assert!(matches!(eval(&ctx, "len(1, 2)"), Err(EvalError::Type(_))));
    }

    #[test]
    fn test_host_functions() {
        struct Echo;
        impl Host for Echo {
            fn call(&self, name: &str, args: &[Value]) -> Option<Result<Value, EvalError>> {
                (name == "broker.echo").then(|| Ok(Value::List(args.to_vec())))
            }
        }

        let ctx = ScriptContext::new();
        assert_eq!(
            ctx.eval("broker.echo(1, 'a')", &Echo).unwrap(),
            Value::from(vec![Value::Int(1), Value::from("a")])
        );
        assert!(matches!(
            ctx.eval("broker.missing()", &Echo),
            Err(EvalError::Name(name)) if name == "broker.missing"
        ));
    }

    #[test]
    fn test_index_errors() {
        let ctx = ScriptContext::new();
        ctx.run("l = [1, 2, 3]", &NoHost).unwrap();
        assert_eq!(eval(&ctx, "l[-1]").unwrap(), Value::Int(3));
        assert!(matches!(eval(&ctx, "l[3]"), Err(EvalError::Index(_))));
        assert!(matches!(eval(&ctx, "{'a': 1}['b']"), Err(EvalError::Key(_))));
    }
}
