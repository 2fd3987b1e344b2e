//! Late compilation of generated shader source.
//!
//! The loader emits plain-text shader source in a small call-tree grammar
//! (`shader <entry> { <expr> }`); this module turns one entry point of such
//! a source string into an executable [`ShaderHandle`]. Compilation failures
//! are fatal by policy: the source is generated, never user-authored, so a
//! failure means the transpiler/loader and this grammar have drifted apart.
//!
//! Initialization binds all subsequent compilations to the driver module of
//! the resolved target and happens once per process.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use glam::{Vec2, Vec3};
use tracing::debug;

use crate::{
    error::{GlintError, GlintResult},
    image::Image,
};

static JIT_MODULE: OnceLock<PathBuf> = OnceLock::new();

/// Bind the JIT to the backend driver module at `module_path`.
///
/// One-time per process: a second call with the same path is a no-op, a call
/// with a different path is a configuration error. This is global mutable
/// state with process lifetime, scoped conceptually to one render session.
pub fn init_jit(module_path: impl Into<PathBuf>) -> GlintResult<()> {
    let module_path = module_path.into();
    let bound = JIT_MODULE.get_or_init(|| module_path.clone());
    if *bound != module_path {
        return Err(GlintError::config(format!(
            "JIT already bound to '{}', cannot rebind to '{}'",
            bound.display(),
            module_path.display()
        )));
    }
    debug!(module = %module_path.display(), "JIT initialized");
    Ok(())
}

/// Compile one entry point of a generated shader source string.
pub fn compile_source(source: &str, entry_point: &str) -> GlintResult<ShaderHandle> {
    if JIT_MODULE.get().is_none() {
        return Err(GlintError::config(
            "init_jit must be called before compiling shaders",
        ));
    }
    compile_entry(source, entry_point)
}

/// Parameter table for custom variables referenced by generated shaders.
#[derive(Clone, Debug, Default)]
pub struct ShaderParams {
    pub bools: BTreeMap<String, bool>,
    pub numbers: BTreeMap<String, f32>,
    pub vectors: BTreeMap<String, Vec3>,
    pub colors: BTreeMap<String, [f32; 3]>,
}

/// Per-invocation inputs a driver supplies when executing a shader.
pub struct ShaderCtx<'a> {
    pub uv: Vec2,
    pub point: Vec3,
    pub normal: Vec3,
    pub textures: &'a BTreeMap<String, Image>,
    pub params: &'a ShaderParams,
}

impl<'a> ShaderCtx<'a> {
    /// Context for shaders that run without surface info (ray generation and
    /// miss).
    pub fn without_surface(
        uv: Vec2,
        textures: &'a BTreeMap<String, Image>,
        params: &'a ShaderParams,
    ) -> Self {
        Self {
            uv,
            point: Vec3::ZERO,
            normal: Vec3::ZERO,
            textures,
            params,
        }
    }
}

/// Opaque, executable result of compiling one shader entry point. Cheap to
/// clone; held by the runtime for the lifetime of the render session.
#[derive(Clone, Debug)]
pub struct ShaderHandle {
    entry: String,
    program: Arc<Node>,
}

impl ShaderHandle {
    pub fn entry_point(&self) -> &str {
        &self.entry
    }

    /// Execute the shader. Scalar results are splatted across the channels.
    pub fn eval(&self, ctx: &ShaderCtx<'_>) -> [f32; 3] {
        self.program.eval(ctx).to_color()
    }
}

#[cfg(test)]
pub(crate) fn compile_source_is_well_formed(source: &str, entry_point: &str) -> bool {
    compile_entry(source, entry_point).is_ok()
}

#[cfg(test)]
pub(crate) fn test_compile(source: &str, entry_point: &str) -> ShaderHandle {
    compile_entry(source, entry_point).expect("test shader must compile")
}

// ── Generated-source grammar ──────────────────────────────────────────────

#[derive(Debug)]
enum Node {
    Number(f32),
    Str(String),
    Uv,
    Point,
    Normal,
    Call(Op, Vec<Node>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    MakeVec,
    MakeColor,
    Vec2Zero,
    VecToColor,
    ColorSplat,
    VecSplat,
    NumNeg,
    NumAdd,
    NumSub,
    NumMul,
    NumDiv,
    NumSin,
    NumCos,
    NumAbs,
    NumSqrt,
    NumFloor,
    NumFract,
    NumPow,
    NumMin,
    NumMax,
    NumClamp,
    NumLerp,
    NumSelect,
    VecAdd,
    VecSub,
    VecMul,
    VecDiv,
    VecScale,
    VecSelect,
    ColorAdd,
    ColorSub,
    ColorMul,
    ColorDiv,
    ColorScale,
    ColorLerp,
    ColorLuminance,
    ColorSelect,
    TexLookup,
    ParamBool,
    ParamNum,
    ParamVec,
    ParamColor,
}

impl Op {
    fn lookup(name: &str) -> Option<(Op, usize)> {
        let entry = match name {
            "make_vec" => (Op::MakeVec, 3),
            "make_color" => (Op::MakeColor, 3),
            "vec2_zero" => (Op::Vec2Zero, 0),
            "vec_to_color" => (Op::VecToColor, 1),
            "color_splat" => (Op::ColorSplat, 1),
            "vec_splat" => (Op::VecSplat, 1),
            "num_neg" => (Op::NumNeg, 1),
            "num_add" => (Op::NumAdd, 2),
            "num_sub" => (Op::NumSub, 2),
            "num_mul" => (Op::NumMul, 2),
            "num_div" => (Op::NumDiv, 2),
            "num_sin" => (Op::NumSin, 1),
            "num_cos" => (Op::NumCos, 1),
            "num_abs" => (Op::NumAbs, 1),
            "num_sqrt" => (Op::NumSqrt, 1),
            "num_floor" => (Op::NumFloor, 1),
            "num_fract" => (Op::NumFract, 1),
            "num_pow" => (Op::NumPow, 2),
            "num_min" => (Op::NumMin, 2),
            "num_max" => (Op::NumMax, 2),
            "num_clamp" => (Op::NumClamp, 3),
            "num_lerp" => (Op::NumLerp, 3),
            "num_select" => (Op::NumSelect, 3),
            "vec_add" => (Op::VecAdd, 2),
            "vec_sub" => (Op::VecSub, 2),
            "vec_mul" => (Op::VecMul, 2),
            "vec_div" => (Op::VecDiv, 2),
            "vec_scale" => (Op::VecScale, 2),
            "vec_select" => (Op::VecSelect, 3),
            "color_add" => (Op::ColorAdd, 2),
            "color_sub" => (Op::ColorSub, 2),
            "color_mul" => (Op::ColorMul, 2),
            "color_div" => (Op::ColorDiv, 2),
            "color_scale" => (Op::ColorScale, 2),
            "color_lerp" => (Op::ColorLerp, 3),
            "color_luminance" => (Op::ColorLuminance, 1),
            "color_select" => (Op::ColorSelect, 3),
            "tex_lookup" => (Op::TexLookup, 2),
            "param_bool" => (Op::ParamBool, 1),
            "param_num" => (Op::ParamNum, 1),
            "param_vec" => (Op::ParamVec, 1),
            "param_color" => (Op::ParamColor, 1),
            _ => return None,
        };
        Some(entry)
    }
}

fn compile_entry(source: &str, entry_point: &str) -> GlintResult<ShaderHandle> {
    let mut parser = SourceParser::new(source);
    while let Some((name, body)) = parser.next_shader()? {
        if name == entry_point {
            let root = ExprParser::new(&body).parse()?;
            return Ok(ShaderHandle {
                entry: name,
                program: Arc::new(root),
            });
        }
    }
    Err(GlintError::compilation(format!(
        "entry point '{entry_point}' not found in generated source"
    )))
}

/// Splits a source string into `shader <name> { ... }` blocks.
struct SourceParser<'s> {
    rest: &'s str,
}

impl<'s> SourceParser<'s> {
    fn new(source: &'s str) -> Self {
        Self { rest: source }
    }

    fn next_shader(&mut self) -> GlintResult<Option<(String, String)>> {
        let trimmed = self.rest.trim_start();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let Some(after_kw) = trimmed.strip_prefix("shader") else {
            return Err(GlintError::compilation(format!(
                "expected 'shader' keyword, found '{}'",
                trimmed.chars().take(16).collect::<String>()
            )));
        };

        let after_kw = after_kw.trim_start();
        let name_len = after_kw
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(after_kw.len());
        if name_len == 0 {
            return Err(GlintError::compilation("missing shader entry-point name"));
        }
        let name = &after_kw[..name_len];

        let after_name = after_kw[name_len..].trim_start();
        let Some(body_start) = after_name.strip_prefix('{') else {
            return Err(GlintError::compilation(format!(
                "expected '{{' after shader name '{name}'"
            )));
        };

        // Brace matching; generated bodies never contain braces in strings.
        let mut depth = 1usize;
        for (idx, ch) in body_start.char_indices() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let body = &body_start[..idx];
                        self.rest = &body_start[idx + 1..];
                        return Ok(Some((name.to_string(), body.to_string())));
                    }
                }
                _ => {}
            }
        }
        Err(GlintError::compilation(format!(
            "unterminated shader body for '{name}'"
        )))
    }
}

/// Parses one call-tree expression body.
struct ExprParser<'s> {
    src: &'s str,
    pos: usize,
}

impl<'s> ExprParser<'s> {
    fn new(src: &'s str) -> Self {
        Self { src, pos: 0 }
    }

    fn parse(mut self) -> GlintResult<Node> {
        let node = self.parse_expr()?;
        self.skip_ws();
        if self.pos != self.src.len() {
            return Err(GlintError::compilation(format!(
                "trailing input in shader body at '{}'",
                &self.src[self.pos..self.src.len().min(self.pos + 16)]
            )));
        }
        Ok(node)
    }

    fn skip_ws(&mut self) {
        while self.src[self.pos..]
            .chars()
            .next()
            .is_some_and(char::is_whitespace)
        {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn parse_expr(&mut self) -> GlintResult<Node> {
        self.skip_ws();
        match self.peek() {
            Some('"') => self.parse_string().map(Node::Str),
            Some(c) if c.is_ascii_digit() || c == '-' || c == '.' => self.parse_number(),
            Some(c) if c.is_alphabetic() || c == '_' => self.parse_ident_or_call(),
            other => Err(GlintError::compilation(format!(
                "unexpected input in shader body: {other:?}"
            ))),
        }
    }

    fn parse_string(&mut self) -> GlintResult<String> {
        self.pos += 1; // opening quote
        let start = self.pos;
        let Some(len) = self.src[self.pos..].find('"') else {
            return Err(GlintError::compilation("unterminated string literal"));
        };
        self.pos += len + 1;
        Ok(self.src[start..start + len].to_string())
    }

    fn parse_number(&mut self) -> GlintResult<Node> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || c == '.' || c == 'e' || c == '-')
        {
            self.pos += 1;
        }
        let text = &self.src[start..self.pos];
        text.parse::<f32>()
            .map(Node::Number)
            .map_err(|_| GlintError::compilation(format!("invalid number literal '{text}'")))
    }

    fn parse_ident_or_call(&mut self) -> GlintResult<Node> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        let name = &self.src[start..self.pos];
        self.skip_ws();

        if self.peek() != Some('(') {
            return match name {
                "uv" => Ok(Node::Uv),
                "point" => Ok(Node::Point),
                "normal" => Ok(Node::Normal),
                _ => Err(GlintError::compilation(format!(
                    "unknown identifier '{name}' in generated source"
                ))),
            };
        }

        self.pos += 1; // '('
        let mut args = Vec::new();
        self.skip_ws();
        if self.peek() != Some(')') {
            loop {
                args.push(self.parse_expr()?);
                self.skip_ws();
                match self.peek() {
                    Some(',') => {
                        self.pos += 1;
                    }
                    Some(')') => break,
                    other => {
                        return Err(GlintError::compilation(format!(
                            "expected ',' or ')' in argument list, got {other:?}"
                        )));
                    }
                }
            }
        }
        self.pos += 1; // ')'

        let Some((op, arity)) = Op::lookup(name) else {
            return Err(GlintError::compilation(format!(
                "unknown operation '{name}' in generated source"
            )));
        };
        if args.len() != arity {
            return Err(GlintError::compilation(format!(
                "'{name}' expects {arity} argument(s), got {}",
                args.len()
            )));
        }
        Ok(Node::Call(op, args))
    }
}

// ── Evaluation ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
enum Value {
    Bool(bool),
    Num(f32),
    Vec(Vec3),
    Color([f32; 3]),
}

impl Value {
    fn to_num(self) -> f32 {
        match self {
            Value::Bool(b) => b as u32 as f32,
            Value::Num(n) => n,
            Value::Vec(v) => v.x,
            Value::Color(c) => c[0],
        }
    }

    fn to_color(self) -> [f32; 3] {
        match self {
            Value::Bool(b) => {
                let n = b as u32 as f32;
                [n, n, n]
            }
            Value::Num(n) => [n, n, n],
            Value::Vec(v) => [v.x, v.y, v.z],
            Value::Color(c) => c,
        }
    }

    fn to_vec(self) -> Vec3 {
        let c = self.to_color();
        Vec3::new(c[0], c[1], c[2])
    }

    fn to_bool(self) -> bool {
        match self {
            Value::Bool(b) => b,
            other => other.to_num() != 0.0,
        }
    }
}

fn zip_color(a: [f32; 3], b: [f32; 3], f: impl Fn(f32, f32) -> f32) -> [f32; 3] {
    [f(a[0], b[0]), f(a[1], b[1]), f(a[2], b[2])]
}

impl Node {
    fn eval(&self, ctx: &ShaderCtx<'_>) -> Value {
        match self {
            Node::Number(v) => Value::Num(*v),
            // A bare string only appears as a name argument; callers read it
            // through the node, not the value.
            Node::Str(_) => Value::Num(0.0),
            Node::Uv => Value::Vec(Vec3::new(ctx.uv.x, ctx.uv.y, 0.0)),
            Node::Point => Value::Vec(ctx.point),
            Node::Normal => Value::Vec(ctx.normal),
            Node::Call(op, args) => eval_call(*op, args, ctx),
        }
    }

    fn as_name(&self) -> &str {
        match self {
            Node::Str(s) => s,
            _ => "",
        }
    }
}

fn eval_call(op: Op, args: &[Node], ctx: &ShaderCtx<'_>) -> Value {
    let num = |i: usize| args[i].eval(ctx).to_num();
    let vec = |i: usize| args[i].eval(ctx).to_vec();
    let col = |i: usize| args[i].eval(ctx).to_color();

    match op {
        Op::MakeVec => Value::Vec(Vec3::new(num(0), num(1), num(2))),
        Op::MakeColor => Value::Color([num(0), num(1), num(2)]),
        Op::Vec2Zero => Value::Vec(Vec3::ZERO),
        Op::VecToColor => Value::Color(args[0].eval(ctx).to_color()),
        Op::ColorSplat => {
            let n = num(0);
            Value::Color([n, n, n])
        }
        Op::VecSplat => Value::Vec(Vec3::splat(num(0))),
        Op::NumNeg => Value::Num(-num(0)),
        Op::NumAdd => Value::Num(num(0) + num(1)),
        Op::NumSub => Value::Num(num(0) - num(1)),
        Op::NumMul => Value::Num(num(0) * num(1)),
        Op::NumDiv => Value::Num(num(0) / num(1)),
        Op::NumSin => Value::Num(num(0).sin()),
        Op::NumCos => Value::Num(num(0).cos()),
        Op::NumAbs => Value::Num(num(0).abs()),
        Op::NumSqrt => Value::Num(num(0).max(0.0).sqrt()),
        Op::NumFloor => Value::Num(num(0).floor()),
        Op::NumFract => Value::Num(num(0).fract()),
        Op::NumPow => Value::Num(num(0).powf(num(1))),
        Op::NumMin => Value::Num(num(0).min(num(1))),
        Op::NumMax => Value::Num(num(0).max(num(1))),
        Op::NumClamp => {
            let (lo, hi) = (num(1), num(2));
            Value::Num(num(0).clamp(lo.min(hi), lo.max(hi)))
        }
        Op::NumLerp => {
            let t = num(2);
            Value::Num(num(0) * (1.0 - t) + num(1) * t)
        }
        Op::NumSelect => {
            if args[0].eval(ctx).to_bool() {
                Value::Num(num(1))
            } else {
                Value::Num(num(2))
            }
        }
        Op::VecAdd => Value::Vec(vec(0) + vec(1)),
        Op::VecSub => Value::Vec(vec(0) - vec(1)),
        Op::VecMul => Value::Vec(vec(0) * vec(1)),
        Op::VecDiv => Value::Vec(vec(0) / vec(1)),
        Op::VecScale => Value::Vec(vec(0) * num(1)),
        Op::VecSelect => {
            if args[0].eval(ctx).to_bool() {
                Value::Vec(vec(1))
            } else {
                Value::Vec(vec(2))
            }
        }
        Op::ColorAdd => Value::Color(zip_color(col(0), col(1), |a, b| a + b)),
        Op::ColorSub => Value::Color(zip_color(col(0), col(1), |a, b| a - b)),
        Op::ColorMul => Value::Color(zip_color(col(0), col(1), |a, b| a * b)),
        Op::ColorDiv => Value::Color(zip_color(col(0), col(1), |a, b| a / b)),
        Op::ColorScale => {
            let s = num(1);
            let c = col(0);
            Value::Color([c[0] * s, c[1] * s, c[2] * s])
        }
        Op::ColorLerp => {
            let t = num(2);
            Value::Color(zip_color(col(0), col(1), |a, b| a * (1.0 - t) + b * t))
        }
        Op::ColorLuminance => {
            let c = col(0);
            Value::Num(0.2126 * c[0] + 0.7152 * c[1] + 0.0722 * c[2])
        }
        Op::ColorSelect => {
            if args[0].eval(ctx).to_bool() {
                Value::Color(col(1))
            } else {
                Value::Color(col(2))
            }
        }
        Op::TexLookup => {
            let name = args[0].as_name();
            let uv = vec(1);
            match ctx.textures.get(name) {
                Some(tex) => Value::Color(tex.sample(Vec2::new(uv.x, uv.y))),
                // Missing texture binding renders as magenta, the classic
                // "missing asset" marker.
                None => Value::Color([1.0, 0.0, 1.0]),
            }
        }
        Op::ParamBool => Value::Bool(
            ctx.params
                .bools
                .get(args[0].as_name())
                .copied()
                .unwrap_or(false),
        ),
        Op::ParamNum => Value::Num(
            ctx.params
                .numbers
                .get(args[0].as_name())
                .copied()
                .unwrap_or(0.0),
        ),
        Op::ParamVec => Value::Vec(
            ctx.params
                .vectors
                .get(args[0].as_name())
                .copied()
                .unwrap_or(Vec3::ZERO),
        ),
        Op::ParamColor => Value::Color(
            ctx.params
                .colors
                .get(args[0].as_name())
                .copied()
                .unwrap_or([0.0; 3]),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(textures: &'a BTreeMap<String, Image>, params: &'a ShaderParams) -> ShaderCtx<'a> {
        ShaderCtx {
            uv: Vec2::new(0.25, 0.75),
            point: Vec3::new(1.0, 2.0, 3.0),
            normal: Vec3::Z,
            textures,
            params,
        }
    }

    #[test]
    fn compiles_and_evaluates_an_entry_point() {
        let source = "shader miss_shader { color_scale(make_color(1.0, 0.5, 0.25), 2.0) }";
        let handle = compile_entry(source, "miss_shader").unwrap();
        let textures = BTreeMap::new();
        let params = ShaderParams::default();
        assert_eq!(handle.eval(&ctx(&textures, &params)), [2.0, 1.0, 0.5]);
    }

    #[test]
    fn picks_the_requested_entry_among_many() {
        let source = "\
shader a { make_color(1.0, 0.0, 0.0) }
shader b { make_color(0.0, 1.0, 0.0) }";
        let handle = compile_entry(source, "b").unwrap();
        let textures = BTreeMap::new();
        let params = ShaderParams::default();
        assert_eq!(handle.eval(&ctx(&textures, &params)), [0.0, 1.0, 0.0]);
        assert_eq!(handle.entry_point(), "b");
    }

    #[test]
    fn missing_entry_point_is_a_compilation_error() {
        let err = compile_entry("shader a { 1.0 }", "missing").unwrap_err();
        assert!(matches!(err, GlintError::Compilation(_)));
    }

    #[test]
    fn malformed_generated_source_is_fatal() {
        for bad in [
            "shade a { 1.0 }",
            "shader a  1.0 }",
            "shader a { unknown_fn(1.0) }",
            "shader a { num_add(1.0) }",
            "shader a { make_color(1.0, 2.0, 3.0) ",
            "shader a { bogus_ident }",
        ] {
            let err = compile_entry(bad, "a").unwrap_err();
            assert!(matches!(err, GlintError::Compilation(_)), "{bad}");
        }
    }

    #[test]
    fn surface_and_param_inputs_flow_through() {
        let source =
            "shader s { color_lerp(vec_to_color(normal), param_color(\"tint\"), param_num(\"t\")) }";
        let handle = compile_entry(source, "s").unwrap();
        let textures = BTreeMap::new();
        let mut params = ShaderParams::default();
        params.colors.insert("tint".into(), [1.0, 1.0, 1.0]);
        params.numbers.insert("t".into(), 0.5);
        assert_eq!(handle.eval(&ctx(&textures, &params)), [0.5, 0.5, 1.0]);
    }

    #[test]
    fn texture_lookup_falls_back_to_magenta() {
        let source = "shader s { tex_lookup(\"missing\", uv) }";
        let handle = compile_entry(source, "s").unwrap();
        let textures = BTreeMap::new();
        let params = ShaderParams::default();
        assert_eq!(handle.eval(&ctx(&textures, &params)), [1.0, 0.0, 1.0]);
    }

    #[test]
    fn init_is_once_per_process() {
        init_jit("/tmp/glint-test-module.so").unwrap();
        // Same path again is fine.
        init_jit("/tmp/glint-test-module.so").unwrap();
        // A different path is a configuration error.
        assert!(init_jit("/tmp/other-module.so").is_err());
        // Once initialized, compilation is available.
        assert!(compile_source("shader s { 1.0 }", "s").is_ok());
    }
}
