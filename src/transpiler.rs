//! Compiles one scene shading expression into a fragment of backend shader
//! source.
//!
//! The transpiler is the first stage of the two-stage shader pipeline: it
//! turns the user-facing infix expression language into the call-tree
//! vocabulary the JIT stage understands, collecting every texture the
//! expression references along the way. It is stateless across calls apart
//! from the registry of custom variable names, which is scoped to one
//! loading session.

use std::collections::BTreeSet;

use crate::error::{GlintError, GlintResult};

/// Output of one `transpile` call, consumed immediately by the scene loader.
#[derive(Clone, Debug, PartialEq)]
pub struct TranspileResult {
    /// Backend shader source fragment.
    pub expr: String,
    /// Exactly the texture names syntactically reachable in the expression.
    pub textures: BTreeSet<String>,
    /// The fragment evaluates to a scalar; otherwise it is a color.
    pub scalar_output: bool,
}

#[derive(Default)]
pub struct Transpiler {
    custom_bool: BTreeSet<String>,
    custom_number: BTreeSet<String>,
    custom_vector: BTreeSet<String>,
    custom_color: BTreeSet<String>,
}

impl Transpiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_custom_bool(&mut self, name: impl Into<String>) {
        self.custom_bool.insert(name.into());
    }

    pub fn register_custom_number(&mut self, name: impl Into<String>) {
        self.custom_number.insert(name.into());
    }

    pub fn register_custom_vector(&mut self, name: impl Into<String>) {
        self.custom_vector.insert(name.into());
    }

    pub fn register_custom_color(&mut self, name: impl Into<String>) {
        self.custom_color.insert(name.into());
    }

    /// Translate `expr` into backend shader source.
    ///
    /// `uv_access` is spliced verbatim wherever the expression reads UV
    /// coordinates (directly or through a texture lookup). `has_surface_info`
    /// gates the `P`/`N` intrinsics. Failure is recoverable: the caller
    /// decides whether to substitute a default or abort scene loading.
    ///
    /// Deterministic: the same expression, registered-variable set and flag
    /// always produce byte-identical output and an identical texture set.
    pub fn transpile(
        &self,
        expr: &str,
        uv_access: &str,
        has_surface_info: bool,
    ) -> GlintResult<TranspileResult> {
        let tokens = tokenize(expr)?;
        let ast = Parser::new(tokens).parse()?;

        let mut emitter = Emitter {
            registry: self,
            uv_access,
            has_surface_info,
            textures: BTreeSet::new(),
        };
        let (source, ty) = emitter.emit(&ast)?;

        let (source, scalar_output) = match ty {
            Type::Num => (source, true),
            Type::Color => (source, false),
            Type::Vec => (format!("vec_to_color({source})"), false),
            Type::Bool => {
                return Err(GlintError::expression(
                    "expression evaluates to a bool; expected scalar or color",
                ));
            }
        };

        Ok(TranspileResult {
            expr: source,
            textures: emitter.textures,
            scalar_output,
        })
    }
}

// ── Tokens ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(f32),
    Ident(String),
    Str(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    Eof,
}

fn tokenize(src: &str) -> GlintResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(pos, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((_, c)) => s.push(c),
                        None => {
                            return Err(GlintError::expression("unterminated string literal"));
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = pos;
                let mut end = pos;
                while let Some(&(p, c)) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        end = p + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let text = &src[start..end];
                let value: f32 = text
                    .parse()
                    .map_err(|_| GlintError::expression(format!("invalid number '{text}'")))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = pos;
                let mut end = pos;
                while let Some(&(p, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        end = p + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(src[start..end].to_string()));
            }
            c => {
                return Err(GlintError::expression(format!(
                    "unexpected character '{c}' in expression"
                )));
            }
        }
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

// ── AST ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
enum Expr {
    Number(f32),
    Ident(String),
    Call(String, Vec<Expr>),
    Tex(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    fn suffix(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens.get(self.pos).cloned().unwrap_or(Token::Eof);
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, tok: Token) -> GlintResult<()> {
        let got = self.advance();
        if got == tok {
            Ok(())
        } else {
            Err(GlintError::expression(format!(
                "expected {tok:?}, got {got:?}"
            )))
        }
    }

    fn parse(mut self) -> GlintResult<Expr> {
        let expr = self.parse_additive()?;
        match self.peek() {
            Token::Eof => Ok(expr),
            tok => Err(GlintError::expression(format!(
                "trailing input at {tok:?}"
            ))),
        }
    }

    fn parse_additive(&mut self) -> GlintResult<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_multiplicative(&mut self) -> GlintResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> GlintResult<Expr> {
        if *self.peek() == Token::Minus {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> GlintResult<Expr> {
        match self.advance() {
            Token::Number(v) => Ok(Expr::Number(v)),
            Token::LParen => {
                let inner = self.parse_additive()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if *self.peek() != Token::LParen {
                    return Ok(Expr::Ident(name));
                }
                self.advance();

                // Texture lookups take a string literal, everything else
                // takes expressions.
                if name == "tex" {
                    let tex_name = match self.advance() {
                        Token::Str(s) => s,
                        tok => {
                            return Err(GlintError::expression(format!(
                                "tex() expects a texture name string, got {tok:?}"
                            )));
                        }
                    };
                    self.expect(Token::RParen)?;
                    return Ok(Expr::Tex(tex_name));
                }

                let mut args = Vec::new();
                if *self.peek() != Token::RParen {
                    loop {
                        args.push(self.parse_additive()?);
                        if *self.peek() == Token::Comma {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen)?;
                Ok(Expr::Call(name, args))
            }
            tok => Err(GlintError::expression(format!(
                "unexpected token {tok:?}"
            ))),
        }
    }
}

// ── Emission ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Type {
    Bool,
    Num,
    Vec,
    Color,
}

impl Type {
    fn word(self) -> &'static str {
        match self {
            Type::Bool => "bool",
            Type::Num => "num",
            Type::Vec => "vec",
            Type::Color => "color",
        }
    }
}

const UNARY_NUM_FNS: &[&str] = &[
    "sin", "cos", "abs", "sqrt", "floor", "fract",
];

struct Emitter<'a> {
    registry: &'a Transpiler,
    uv_access: &'a str,
    has_surface_info: bool,
    textures: BTreeSet<String>,
}

impl Emitter<'_> {
    fn emit(&mut self, expr: &Expr) -> GlintResult<(String, Type)> {
        match expr {
            Expr::Number(v) => Ok((format!("{v:?}"), Type::Num)),
            Expr::Ident(name) => self.emit_ident(name),
            Expr::Tex(name) => {
                self.textures.insert(name.clone());
                Ok((
                    format!("tex_lookup(\"{name}\", {})", self.uv_access),
                    Type::Color,
                ))
            }
            Expr::Neg(inner) => {
                let (src, ty) = self.emit(inner)?;
                match ty {
                    Type::Num => Ok((format!("num_neg({src})"), Type::Num)),
                    Type::Vec => Ok((format!("vec_scale({src}, -1.0)"), Type::Vec)),
                    Type::Color => Ok((format!("color_scale({src}, -1.0)"), Type::Color)),
                    Type::Bool => Err(GlintError::expression("cannot negate a bool")),
                }
            }
            Expr::Binary(op, lhs, rhs) => self.emit_binary(*op, lhs, rhs),
            Expr::Call(name, args) => self.emit_call(name, args),
        }
    }

    fn emit_ident(&mut self, name: &str) -> GlintResult<(String, Type)> {
        match name {
            "uv" => Ok((self.uv_access.to_string(), Type::Vec)),
            "P" | "N" => {
                if !self.has_surface_info {
                    return Err(GlintError::expression(format!(
                        "'{name}' requires surface info, which is not available here"
                    )));
                }
                let src = if name == "P" { "point" } else { "normal" };
                Ok((src.to_string(), Type::Vec))
            }
            _ => {
                let reg = self.registry;
                let (param_fn, ty) = if reg.custom_bool.contains(name) {
                    ("param_bool", Type::Bool)
                } else if reg.custom_number.contains(name) {
                    ("param_num", Type::Num)
                } else if reg.custom_vector.contains(name) {
                    ("param_vec", Type::Vec)
                } else if reg.custom_color.contains(name) {
                    ("param_color", Type::Color)
                } else {
                    return Err(GlintError::expression(format!(
                        "unknown variable '{name}'; custom variables must be registered"
                    )));
                };
                Ok((format!("{param_fn}(\"{name}\")"), ty))
            }
        }
    }

    fn emit_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> GlintResult<(String, Type)> {
        let (lhs_src, lhs_ty) = self.emit(lhs)?;
        let (rhs_src, rhs_ty) = self.emit(rhs)?;

        if lhs_ty == Type::Bool || rhs_ty == Type::Bool {
            return Err(GlintError::expression(
                "bools cannot appear in arithmetic; use select()",
            ));
        }

        // Scalars promote to the wider operand; vec/color never mix.
        let (lhs_src, rhs_src, ty) = match (lhs_ty, rhs_ty) {
            (a, b) if a == b => (lhs_src, rhs_src, lhs_ty),
            (Type::Num, Type::Color) => (format!("color_splat({lhs_src})"), rhs_src, Type::Color),
            (Type::Color, Type::Num) => (lhs_src, format!("color_splat({rhs_src})"), Type::Color),
            (Type::Num, Type::Vec) => (format!("vec_splat({lhs_src})"), rhs_src, Type::Vec),
            (Type::Vec, Type::Num) => (lhs_src, format!("vec_splat({rhs_src})"), Type::Vec),
            (a, b) => {
                return Err(GlintError::expression(format!(
                    "cannot combine {} and {} with an arithmetic operator",
                    a.word(),
                    b.word()
                )));
            }
        };

        Ok((
            format!("{}_{}({lhs_src}, {rhs_src})", ty.word(), op.suffix()),
            ty,
        ))
    }

    fn emit_call(&mut self, name: &str, args: &[Expr]) -> GlintResult<(String, Type)> {
        let emitted = args
            .iter()
            .map(|a| self.emit(a))
            .collect::<GlintResult<Vec<_>>>()?;

        let arity = |n: usize| -> GlintResult<()> {
            if emitted.len() == n {
                Ok(())
            } else {
                Err(GlintError::expression(format!(
                    "{name}() expects {n} argument(s), got {}",
                    emitted.len()
                )))
            }
        };

        let all_num = |emitted: &[(String, Type)]| -> GlintResult<()> {
            for (_, ty) in emitted {
                if *ty != Type::Num {
                    return Err(GlintError::expression(format!(
                        "{name}() expects scalar arguments"
                    )));
                }
            }
            Ok(())
        };

        match name {
            "vec3" => {
                arity(3)?;
                all_num(&emitted)?;
                Ok((
                    format!(
                        "make_vec({}, {}, {})",
                        emitted[0].0, emitted[1].0, emitted[2].0
                    ),
                    Type::Vec,
                ))
            }
            "color" => {
                arity(3)?;
                all_num(&emitted)?;
                Ok((
                    format!(
                        "make_color({}, {}, {})",
                        emitted[0].0, emitted[1].0, emitted[2].0
                    ),
                    Type::Color,
                ))
            }
            "pow" | "min" | "max" => {
                arity(2)?;
                all_num(&emitted)?;
                Ok((
                    format!("num_{name}({}, {})", emitted[0].0, emitted[1].0),
                    Type::Num,
                ))
            }
            "clamp" => {
                arity(3)?;
                all_num(&emitted)?;
                Ok((
                    format!(
                        "num_clamp({}, {}, {})",
                        emitted[0].0, emitted[1].0, emitted[2].0
                    ),
                    Type::Num,
                ))
            }
            "mix" => {
                arity(3)?;
                let (t_src, t_ty) = &emitted[2];
                if *t_ty != Type::Num {
                    return Err(GlintError::expression("mix() blend factor must be scalar"));
                }
                match (emitted[0].1, emitted[1].1) {
                    (Type::Num, Type::Num) => Ok((
                        format!("num_lerp({}, {}, {t_src})", emitted[0].0, emitted[1].0),
                        Type::Num,
                    )),
                    (Type::Color, Type::Color) => Ok((
                        format!("color_lerp({}, {}, {t_src})", emitted[0].0, emitted[1].0),
                        Type::Color,
                    )),
                    _ => Err(GlintError::expression(
                        "mix() endpoints must both be scalar or both be color",
                    )),
                }
            }
            "luminance" => {
                arity(1)?;
                if emitted[0].1 != Type::Color {
                    return Err(GlintError::expression("luminance() expects a color"));
                }
                Ok((format!("color_luminance({})", emitted[0].0), Type::Num))
            }
            "select" => {
                arity(3)?;
                if emitted[0].1 != Type::Bool {
                    return Err(GlintError::expression(
                        "select() condition must be a bool variable",
                    ));
                }
                if emitted[1].1 != emitted[2].1 {
                    return Err(GlintError::expression(
                        "select() branches must have the same type",
                    ));
                }
                let ty = emitted[1].1;
                Ok((
                    format!(
                        "{}_select({}, {}, {})",
                        ty.word(),
                        emitted[0].0,
                        emitted[1].0,
                        emitted[2].0
                    ),
                    ty,
                ))
            }
            _ if UNARY_NUM_FNS.contains(&name) => {
                arity(1)?;
                all_num(&emitted)?;
                Ok((format!("num_{name}({})", emitted[0].0), Type::Num))
            }
            _ => Err(GlintError::expression(format!("unknown function '{name}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transpiler_with_vars() -> Transpiler {
        let mut t = Transpiler::new();
        t.register_custom_number("brightness");
        t.register_custom_color("tint");
        t.register_custom_bool("night");
        t.register_custom_vector("wind");
        t
    }

    #[test]
    fn scalar_expression_tags_scalar_output() {
        let t = Transpiler::new();
        let r = t.transpile("1 + 2 * 3", "uv", true).unwrap();
        assert!(r.scalar_output);
        assert_eq!(r.expr, "num_add(1.0, num_mul(2.0, 3.0))");
        assert!(r.textures.is_empty());
    }

    #[test]
    fn color_expression_is_not_scalar() {
        let t = Transpiler::new();
        let r = t.transpile("color(1, 0, 0) * 0.5", "uv", true).unwrap();
        assert!(!r.scalar_output);
        assert_eq!(
            r.expr,
            "color_mul(make_color(1.0, 0.0, 0.0), color_splat(0.5))"
        );
    }

    #[test]
    fn texture_references_are_collected_exactly() {
        let t = Transpiler::new();
        let r = t
            .transpile(
                "mix(tex(\"wood\"), tex(\"stone\"), 0.5) + tex(\"wood\")",
                "surf_uv",
                true,
            )
            .unwrap();
        let names: Vec<&str> = r.textures.iter().map(String::as_str).collect();
        assert_eq!(names, ["stone", "wood"]);
        assert!(r.expr.contains("tex_lookup(\"wood\", surf_uv)"));
    }

    #[test]
    fn uv_access_is_spliced_verbatim() {
        let t = Transpiler::new();
        let r = t.transpile("tex(\"noise\")", "vec2_zero()", false).unwrap();
        assert_eq!(r.expr, "tex_lookup(\"noise\", vec2_zero())");
    }

    #[test]
    fn surface_intrinsics_require_surface_info() {
        let t = Transpiler::new();
        assert!(t.transpile("N * 0.5", "uv", true).is_ok());
        let err = t.transpile("N * 0.5", "uv", false).unwrap_err();
        assert!(err.to_string().contains("surface info"));
    }

    #[test]
    fn unregistered_variable_is_an_expression_error() {
        let t = Transpiler::new();
        let err = t.transpile("brightness * 2", "uv", true).unwrap_err();
        assert!(matches!(err, GlintError::Expression(_)));
    }

    #[test]
    fn registered_variables_emit_typed_parameter_reads() {
        let t = transpiler_with_vars();
        let r = t
            .transpile("tint * brightness + select(night, color(0,0,0), tint)", "uv", true)
            .unwrap();
        assert!(r.expr.contains("param_color(\"tint\")"));
        assert!(r.expr.contains("param_num(\"brightness\")"));
        assert!(r.expr.contains("color_select(param_bool(\"night\")"));
        assert!(!r.scalar_output);
    }

    #[test]
    fn transpilation_is_deterministic() {
        let t = transpiler_with_vars();
        let expr = "mix(tex(\"a\"), tex(\"b\"), clamp(brightness, 0, 1))";
        let r1 = t.transpile(expr, "uv", true).unwrap();
        let r2 = t.transpile(expr, "uv", true).unwrap();
        assert_eq!(r1, r2);
    }

    #[test]
    fn vector_result_is_coerced_to_color() {
        let t = Transpiler::new();
        let r = t.transpile("vec3(1, 2, 3) * 0.5", "uv", true).unwrap();
        assert!(!r.scalar_output);
        assert!(r.expr.starts_with("vec_to_color("));
    }

    #[test]
    fn malformed_expressions_are_recoverable_errors() {
        let t = Transpiler::new();
        for bad in ["1 +", "foo(", "tex(wood)", "1 ^ 2", "(1, 2)"] {
            assert!(t.transpile(bad, "uv", true).is_err(), "{bad} should fail");
        }
    }
}
