//! Evaluación de AST de fórmulas y reescritura a SQL de storage.

use chrono::Utc;
use crm_domain::{EngineError, FieldValue, SObject, UserContext};
use once_cell::sync::Lazy;
use regex::Regex;

use super::lexer::Token;
use super::parser::{BinOp, Expr, UnaryOp};
use crate::actions::CredentialHasher;

/// Contexto de evaluación: registro candidato, registro previo, sesión y
/// hooks opcionales (hashing, visibilidad de campos).
pub struct FormulaContext<'a> {
    pub record: &'a SObject,
    pub old: Option<&'a SObject>,
    pub user: Option<&'a UserContext>,
    pub hasher: Option<&'a dyn CredentialHasher>,
    pub is_visible: Option<&'a dyn Fn(&str) -> bool>,
}

impl<'a> FormulaContext<'a> {
    pub fn for_record(record: &'a SObject) -> Self {
        Self { record,
               old: None,
               user: None,
               hasher: None,
               is_visible: None }
    }

    pub fn with_old(mut self, old: Option<&'a SObject>) -> Self {
        self.old = old;
        self
    }

    pub fn with_user(mut self, user: &'a UserContext) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_hasher(mut self, hasher: &'a dyn CredentialHasher) -> Self {
        self.hasher = Some(hasher);
        self
    }

    pub fn with_visibility(mut self, cb: &'a dyn Fn(&str) -> bool) -> Self {
        self.is_visible = Some(cb);
        self
    }

    fn field(&self, name: &str) -> FieldValue {
        if let Some(vis) = self.is_visible {
            if !vis(name) {
                return FieldValue::Null;
            }
        }
        self.record.get(name).cloned().unwrap_or(FieldValue::Null)
    }
}

fn err(msg: impl Into<String>) -> EngineError {
    EngineError::Formula(msg.into())
}

pub fn eval(expr: &Expr, ctx: &FormulaContext<'_>) -> Result<FieldValue, EngineError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(path) => Ok(resolve_path(path, ctx)),
        Expr::Unary { op, expr } => {
            let v = eval(expr, ctx)?;
            match op {
                UnaryOp::Not => Ok(FieldValue::Bool(!v.is_truthy())),
                UnaryOp::Neg => match v {
                    FieldValue::Int(i) => Ok(FieldValue::Int(-i)),
                    FieldValue::Float(f) => Ok(FieldValue::Float(-f)),
                    other => Err(err(format!("cannot negate {other:?}"))),
                },
            }
        }
        Expr::Binary { op, left, right } => eval_binary(op, left, right, ctx),
        Expr::Call { name, args } => eval_call(name, args, ctx),
    }
}

/// Resolución de identificadores: `old.x` y `prior.x` miran el registro
/// previo, `user.*` la sesión, el resto el registro candidato. Identificador
/// ausente evalúa a null (los tipos se resuelven en runtime).
fn resolve_path(path: &[String], ctx: &FormulaContext<'_>) -> FieldValue {
    let head = path[0].to_ascii_lowercase();
    match (head.as_str(), path.len()) {
        ("old" | "prior", 2) => {
            ctx.old.and_then(|o| o.get(&path[1]).cloned()).unwrap_or(FieldValue::Null)
        }
        ("user", 2) => {
            let Some(user) = ctx.user else { return FieldValue::Null };
            match path[1].to_ascii_lowercase().as_str() {
                "id" => FieldValue::from(user.id),
                "username" => FieldValue::Text(user.username.clone()),
                "role_id" => user.role_id.map(FieldValue::from).unwrap_or(FieldValue::Null),
                "profile_id" => user.profile_id.map(FieldValue::from).unwrap_or(FieldValue::Null),
                _ => FieldValue::Null,
            }
        }
        (_, 1) => ctx.field(&path[0]),
        _ => FieldValue::Null,
    }
}

fn numeric_pair(a: &FieldValue, b: &FieldValue) -> Option<(f64, f64)> {
    Some((a.as_f64()?, b.as_f64()?))
}

/// Igualdad laxa: números se comparan numéricamente, strings por contenido,
/// null sólo es igual a null.
fn loose_eq(a: &FieldValue, b: &FieldValue) -> bool {
    if let Some((x, y)) = numeric_pair(a, b) {
        return x == y;
    }
    match (a, b) {
        (FieldValue::Null, FieldValue::Null) => true,
        (FieldValue::Text(x), FieldValue::Text(y)) => x == y,
        (FieldValue::Bool(x), FieldValue::Bool(y)) => x == y,
        (FieldValue::Timestamp(x), FieldValue::Timestamp(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &FieldValue, b: &FieldValue) -> Result<std::cmp::Ordering, EngineError> {
    if let Some((x, y)) = numeric_pair(a, b) {
        return x.partial_cmp(&y).ok_or_else(|| err("NaN comparison"));
    }
    match (a, b) {
        (FieldValue::Text(x), FieldValue::Text(y)) => Ok(x.cmp(y)),
        (FieldValue::Timestamp(x), FieldValue::Timestamp(y)) => Ok(x.cmp(y)),
        _ => Err(err(format!("cannot order {a:?} against {b:?}"))),
    }
}

fn eval_binary(op: &BinOp, left: &Expr, right: &Expr, ctx: &FormulaContext<'_>) -> Result<FieldValue, EngineError> {
    // Cortocircuito para operadores lógicos.
    match op {
        BinOp::And => {
            let l = eval(left, ctx)?;
            if !l.is_truthy() {
                return Ok(FieldValue::Bool(false));
            }
            return Ok(FieldValue::Bool(eval(right, ctx)?.is_truthy()));
        }
        BinOp::Or => {
            let l = eval(left, ctx)?;
            if l.is_truthy() {
                return Ok(FieldValue::Bool(true));
            }
            return Ok(FieldValue::Bool(eval(right, ctx)?.is_truthy()));
        }
        _ => {}
    }
    let l = eval(left, ctx)?;
    let r = eval(right, ctx)?;
    match op {
        BinOp::Eq => Ok(FieldValue::Bool(loose_eq(&l, &r))),
        BinOp::Ne => Ok(FieldValue::Bool(!loose_eq(&l, &r))),
        BinOp::Lt => Ok(FieldValue::Bool(compare(&l, &r)? == std::cmp::Ordering::Less)),
        BinOp::Le => Ok(FieldValue::Bool(compare(&l, &r)? != std::cmp::Ordering::Greater)),
        BinOp::Gt => Ok(FieldValue::Bool(compare(&l, &r)? == std::cmp::Ordering::Greater)),
        BinOp::Ge => Ok(FieldValue::Bool(compare(&l, &r)? != std::cmp::Ordering::Less)),
        BinOp::Add => match (&l, &r) {
            (FieldValue::Text(a), b) => Ok(FieldValue::Text(format!("{a}{}", b.to_display_string()))),
            (FieldValue::Int(a), FieldValue::Int(b)) => Ok(FieldValue::Int(a + b)),
            _ => {
                let (x, y) = numeric_pair(&l, &r).ok_or_else(|| err("'+' expects numbers or strings"))?;
                Ok(FieldValue::Float(x + y))
            }
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div => {
            if let (FieldValue::Int(a), FieldValue::Int(b)) = (&l, &r) {
                match op {
                    BinOp::Sub => return Ok(FieldValue::Int(a - b)),
                    BinOp::Mul => return Ok(FieldValue::Int(a * b)),
                    _ => {}
                }
            }
            let (x, y) = numeric_pair(&l, &r).ok_or_else(|| err("arithmetic expects numbers"))?;
            match op {
                BinOp::Sub => Ok(FieldValue::Float(x - y)),
                BinOp::Mul => Ok(FieldValue::Float(x * y)),
                BinOp::Div => {
                    if y == 0.0 {
                        Err(err("division by zero"))
                    } else {
                        Ok(FieldValue::Float(x / y))
                    }
                }
                _ => unreachable!(),
            }
        }
        BinOp::And | BinOp::Or => unreachable!(),
    }
}

fn arity(name: &str, args: &[Expr], n: usize) -> Result<(), EngineError> {
    if args.len() != n {
        return Err(err(format!("{name} expects {n} argument(s), got {}", args.len())));
    }
    Ok(())
}

fn eval_call(name: &str, args: &[Expr], ctx: &FormulaContext<'_>) -> Result<FieldValue, EngineError> {
    match name.to_ascii_uppercase().as_str() {
        "TODAY" => {
            arity("TODAY", args, 0)?;
            let today = Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
            Ok(FieldValue::Timestamp(today))
        }
        "NOW" => {
            arity("NOW", args, 0)?;
            Ok(FieldValue::Timestamp(Utc::now()))
        }
        "LEN" => {
            arity("LEN", args, 1)?;
            let v = eval(&args[0], ctx)?;
            Ok(FieldValue::Int(v.to_display_string().chars().count() as i64))
        }
        "UPPER" => {
            arity("UPPER", args, 1)?;
            Ok(FieldValue::Text(eval(&args[0], ctx)?.to_display_string().to_uppercase()))
        }
        "LOWER" => {
            arity("LOWER", args, 1)?;
            Ok(FieldValue::Text(eval(&args[0], ctx)?.to_display_string().to_lowercase()))
        }
        "TRIM" => {
            arity("TRIM", args, 1)?;
            Ok(FieldValue::Text(eval(&args[0], ctx)?.to_display_string().trim().to_string()))
        }
        "TEXT" => {
            arity("TEXT", args, 1)?;
            Ok(FieldValue::Text(eval(&args[0], ctx)?.to_display_string()))
        }
        "ISBLANK" => {
            arity("ISBLANK", args, 1)?;
            Ok(FieldValue::Bool(eval(&args[0], ctx)?.is_blank()))
        }
        "ISNULL" => {
            arity("ISNULL", args, 1)?;
            Ok(FieldValue::Bool(eval(&args[0], ctx)?.is_null()))
        }
        "NOT" => {
            arity("NOT", args, 1)?;
            Ok(FieldValue::Bool(!eval(&args[0], ctx)?.is_truthy()))
        }
        "IF" => {
            arity("IF", args, 3)?;
            if eval(&args[0], ctx)?.is_truthy() {
                eval(&args[1], ctx)
            } else {
                eval(&args[2], ctx)
            }
        }
        "AND" => {
            for a in args {
                if !eval(a, ctx)?.is_truthy() {
                    return Ok(FieldValue::Bool(false));
                }
            }
            Ok(FieldValue::Bool(true))
        }
        "OR" => {
            for a in args {
                if eval(a, ctx)?.is_truthy() {
                    return Ok(FieldValue::Bool(true));
                }
            }
            Ok(FieldValue::Bool(false))
        }
        "CONCAT" => {
            let mut out = String::new();
            for a in args {
                out.push_str(&eval(a, ctx)?.to_display_string());
            }
            Ok(FieldValue::Text(out))
        }
        "CONTAINS" => {
            arity("CONTAINS", args, 2)?;
            let hay = eval(&args[0], ctx)?.to_display_string();
            let needle = eval(&args[1], ctx)?.to_display_string();
            Ok(FieldValue::Bool(hay.contains(&needle)))
        }
        "ABS" => {
            arity("ABS", args, 1)?;
            match eval(&args[0], ctx)? {
                FieldValue::Int(i) => Ok(FieldValue::Int(i.abs())),
                other => {
                    let n = other.as_f64().ok_or_else(|| err("ABS expects a number"))?;
                    Ok(FieldValue::Float(n.abs()))
                }
            }
        }
        "ROUND" => {
            arity("ROUND", args, 1)?;
            let n = eval(&args[0], ctx)?.as_f64().ok_or_else(|| err("ROUND expects a number"))?;
            Ok(FieldValue::Float(n.round()))
        }
        "BCRYPT" => {
            arity("BCRYPT", args, 1)?;
            let hasher = ctx.hasher.ok_or_else(|| err("no credential hasher available"))?;
            let plain = eval(&args[0], ctx)?.to_display_string();
            Ok(FieldValue::Text(hasher.hash(&plain)))
        }
        other => Err(err(format!("unknown function '{other}'"))),
    }
}

static SAFE_IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("ident regex"));

/// Reescritura token a token al dialecto del storage. Identidad salvo:
/// `TODAY()` → `CURRENT_DATE`, `NOW()` → `now()`, `LEN` → `char_length`,
/// `==` → `=`, `!=` → `<>`, `&&`/`||` → `AND`/`OR`, strings a comillas
/// simples con escape doblado.
pub fn rewrite_storage_sql(tokens: &[Token]) -> Result<String, EngineError> {
    let mut parts: Vec<String> = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        let tok = &tokens[i];
        match tok {
            Token::Ident(name) => {
                let upper = name.to_ascii_uppercase();
                let is_call = matches!(tokens.get(i + 1), Some(Token::LParen));
                match upper.as_str() {
                    "TODAY" if is_call => {
                        // Consume `TODAY ( )` completo.
                        if !matches!(tokens.get(i + 2), Some(Token::RParen)) {
                            return Err(err("TODAY takes no arguments"));
                        }
                        parts.push("CURRENT_DATE".into());
                        i += 3;
                        continue;
                    }
                    "NOW" if is_call => {
                        if !matches!(tokens.get(i + 2), Some(Token::RParen)) {
                            return Err(err("NOW takes no arguments"));
                        }
                        parts.push("now()".into());
                        i += 3;
                        continue;
                    }
                    "BCRYPT" => return Err(err("BCRYPT is not storable as a generated column")),
                    _ => {
                        if !SAFE_IDENT.is_match(name) {
                            return Err(err(format!("identifier '{name}' not storable")));
                        }
                        let mapped = if upper == "LEN" { "char_length" } else { name.as_str() };
                        if is_call {
                            // El paréntesis de llamada va pegado al nombre.
                            parts.push(format!("{mapped}("));
                            i += 2;
                            continue;
                        }
                        parts.push(mapped.to_string());
                    }
                }
            }
            Token::Str(s) => parts.push(format!("'{}'", s.replace('\'', "''"))),
            Token::Int(n) => parts.push(n.to_string()),
            Token::Number(n) => parts.push(n.to_string()),
            Token::True => parts.push("true".into()),
            Token::False => parts.push("false".into()),
            Token::Null => parts.push("NULL".into()),
            Token::Plus => parts.push("+".into()),
            Token::Minus => parts.push("-".into()),
            Token::Star => parts.push("*".into()),
            Token::Slash => parts.push("/".into()),
            Token::Eq => parts.push("=".into()),
            Token::Ne => parts.push("<>".into()),
            Token::Lt => parts.push("<".into()),
            Token::Le => parts.push("<=".into()),
            Token::Gt => parts.push(">".into()),
            Token::Ge => parts.push(">=".into()),
            Token::And => parts.push("AND".into()),
            Token::Or => parts.push("OR".into()),
            Token::Not => parts.push("NOT".into()),
            Token::LParen => parts.push("(".into()),
            Token::RParen => parts.push(")".into()),
            Token::Comma => parts.push(",".into()),
            Token::Dot => return Err(err("dotted paths are not storable")),
        }
        i += 1;
    }
    Ok(parts.join(" ").replace("( ", "(").replace(" )", ")").replace(" ,", ","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::FormulaEngine;

    fn record() -> SObject {
        let mut rec = SObject::new();
        rec.set("priority", "High");
        rec.set("amount", 100i64);
        rec.set("name", "Crash");
        rec
    }

    #[test]
    fn trigger_condition_matches() {
        let rec = record();
        let ctx = FormulaContext::for_record(&rec);
        assert!(FormulaEngine::evaluate_condition(r#"priority == "High""#, &ctx).unwrap());
        assert!(!FormulaEngine::evaluate_condition(r#"priority == "Low""#, &ctx).unwrap());
        assert!(FormulaEngine::evaluate_condition("amount >= 100 && LEN(name) > 3", &ctx).unwrap());
    }

    #[test]
    fn old_record_and_functions() {
        let rec = record();
        let mut old = record();
        old.set("priority", "Low");
        let ctx = FormulaContext::for_record(&rec).with_old(Some(&old));
        assert!(FormulaEngine::evaluate_condition("old.priority != priority", &ctx).unwrap());
        let v = FormulaEngine::evaluate("CONCAT(UPPER(name), '-', amount)", &ctx).unwrap();
        assert_eq!(v.as_str(), Some("CRASH-100"));
    }

    #[test]
    fn hidden_field_evaluates_to_null() {
        let rec = record();
        let deny = |f: &str| !f.eq_ignore_ascii_case("amount");
        let ctx = FormulaContext::for_record(&rec).with_visibility(&deny);
        assert!(FormulaEngine::evaluate_condition("ISBLANK(amount)", &ctx).unwrap());
        assert!(FormulaEngine::evaluate_condition("priority == 'High'", &ctx).unwrap());
    }

    #[test]
    fn storage_rewrite() {
        assert_eq!(FormulaEngine::to_storage_sql("LEN(name) > 3 && status == 'Open'").unwrap(),
                   "char_length(name) > 3 AND status = 'Open'");
        assert_eq!(FormulaEngine::to_storage_sql("TODAY()").unwrap(), "CURRENT_DATE");
        assert!(FormulaEngine::to_storage_sql("BCRYPT(password)").is_err());
    }

    #[test]
    fn raw_value_modes() {
        let rec = record();
        let ctx = FormulaContext::for_record(&rec);
        assert_eq!(crate::formula::resolve_raw("=UPPER(priority)", &ctx).unwrap().as_str(), Some("HIGH"));
        assert_eq!(crate::formula::resolve_raw("{! amount + 1 }", &ctx).unwrap(), FieldValue::Int(101));
        assert_eq!(crate::formula::resolve_raw("plain", &ctx).unwrap().as_str(), Some("plain"));
    }
}
