//! Compact textual form of graphs, used by tests and debug dumps.
//!
//! ```text
//! graph @joint {
//!   %a: primal f32[4]
//!   %t: tangent f32[4]
//!   %c = mul(%a, %a) : f32[4]
//!   %s = expand(%c, [2, 4])
//!   return (%c, %t)
//! }
//! ```
//!
//! Inputs are declared with their role and optional metadata; operations list their arguments
//! (`%name` references or literals) followed by optional metadata. `return %x` produces a
//! single output, `return (...)` a tuple.

use std::collections::HashMap;
use std::fmt;

use smallvec::SmallVec;
use thiserror::Error;

use super::builder::GraphBuilder;
use super::node::{Arg, DType, GraphOutput, InputRole, Literal, NodeId, NodeKind, TensorMeta};
use super::Graph;

/// Errors raised while parsing the graph text format.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TextGraphError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("{0}")]
    Message(String),
}

impl TextGraphError {
    fn syntax(line: usize, message: impl Into<String>) -> Self {
        TextGraphError::Syntax {
            line,
            message: message.into(),
        }
    }
}

/// Graph paired with the name it was declared under.
#[derive(Debug, Clone)]
pub struct ParsedGraph {
    pub name: String,
    pub graph: Graph,
}

/// Parses a graph written in the text format described in the module docs.
///
/// # Example
/// ```
/// use aotgrad::graph::text::parse_graph;
///
/// let graph = parse_graph(r#"
/// graph @square {
///   %x: primal f32[3]
///   %y = mul(%x, %x) : f32[3]
///   return %y
/// }
/// "#).expect("valid graph");
/// assert_eq!(graph.num_inputs(), 1);
/// assert_eq!(graph.output_values().len(), 1);
/// ```
pub fn parse_graph(src: &str) -> Result<Graph, TextGraphError> {
    parse_named_graph(src).map(|parsed| parsed.graph)
}

pub fn parse_named_graph(src: &str) -> Result<ParsedGraph, TextGraphError> {
    let mut lines = src
        .lines()
        .enumerate()
        .map(|(idx, raw)| (idx + 1, strip_comment(raw).trim()))
        .filter(|(_, line)| !line.is_empty());

    let (header_line, header) = lines
        .next()
        .ok_or_else(|| TextGraphError::Message("input is empty".to_string()))?;
    let name = parse_header(header_line, header)?;

    let mut builder = GraphBuilder::new();
    let mut values: HashMap<String, NodeId> = HashMap::new();
    let mut output: Option<GraphOutput> = None;
    let mut closed = false;

    for (line_no, line) in lines {
        if closed {
            return Err(TextGraphError::syntax(line_no, "content after closing `}`"));
        }
        if line == "}" {
            closed = true;
            continue;
        }
        if output.is_some() {
            return Err(TextGraphError::syntax(
                line_no,
                "`return` must be the last statement",
            ));
        }
        if let Some(rest) = line.strip_prefix("return") {
            output = Some(parse_return(line_no, rest.trim(), &values)?);
            continue;
        }
        let (name, id) = parse_statement(line_no, line, &mut builder, &values)?;
        if values.insert(name.clone(), id).is_some() {
            return Err(TextGraphError::syntax(
                line_no,
                format!("value `%{name}` defined twice"),
            ));
        }
    }

    if !closed {
        return Err(TextGraphError::Message(
            "missing `}` to end graph body".to_string(),
        ));
    }
    let output =
        output.ok_or_else(|| TextGraphError::Message("graph has no `return`".to_string()))?;
    let graph = builder
        .finish(output)
        .map_err(|err| TextGraphError::Message(err.to_string()))?;
    Ok(ParsedGraph { name, graph })
}

fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn parse_header(line_no: usize, header: &str) -> Result<String, TextGraphError> {
    let rest = header
        .strip_prefix("graph")
        .ok_or_else(|| TextGraphError::syntax(line_no, "header must start with `graph`"))?
        .trim();
    let rest = rest
        .strip_suffix('{')
        .ok_or_else(|| TextGraphError::syntax(line_no, "missing `{` after graph name"))?
        .trim();
    let name = rest.strip_prefix('@').unwrap_or(rest).trim();
    if name.is_empty() {
        return Err(TextGraphError::syntax(line_no, "graph name cannot be empty"));
    }
    Ok(name.to_string())
}

fn parse_statement(
    line_no: usize,
    line: &str,
    builder: &mut GraphBuilder,
    values: &HashMap<String, NodeId>,
) -> Result<(String, NodeId), TextGraphError> {
    if let Some((lhs, rhs)) = line.split_once('=') {
        let name = parse_value_name(line_no, lhs.trim())?;
        let (call, meta) = split_meta(line_no, rhs.trim())?;
        let open = call
            .find('(')
            .ok_or_else(|| TextGraphError::syntax(line_no, "missing `(` after operator"))?;
        let close = call
            .rfind(')')
            .ok_or_else(|| TextGraphError::syntax(line_no, "missing `)` after arguments"))?;
        let op = call[..open].trim();
        if op.is_empty() {
            return Err(TextGraphError::syntax(line_no, "operator name cannot be empty"));
        }
        let mut args: SmallVec<[Arg; 4]> = SmallVec::new();
        for raw in split_top_level(&call[open + 1..close]) {
            args.push(parse_arg(line_no, raw, values)?);
        }
        let id = builder.op(name.clone(), op, args, meta);
        return Ok((name, id));
    }

    let (lhs, rhs) = line
        .split_once(':')
        .ok_or_else(|| TextGraphError::syntax(line_no, "expected `%name: role` or `%name = op(...)`"))?;
    let name = parse_value_name(line_no, lhs.trim())?;
    let rhs = rhs.trim();
    let (role, meta) = match rhs.split_once(char::is_whitespace) {
        Some((role, meta)) => (role, Some(parse_meta(line_no, meta.trim())?)),
        None => (rhs, None),
    };
    let role = match role {
        "primal" => InputRole::Primal,
        "tangent" => InputRole::Tangent,
        "saved" => InputRole::Saved,
        other => {
            return Err(TextGraphError::syntax(
                line_no,
                format!("unknown input role `{other}`"),
            ))
        }
    };
    let id = builder.input(name.clone(), role, meta);
    Ok((name, id))
}

fn split_meta(line_no: usize, rhs: &str) -> Result<(&str, Option<TensorMeta>), TextGraphError> {
    let close = rhs.rfind(')').unwrap_or(0);
    match rhs[close..].find(':') {
        Some(pos) => {
            let meta = parse_meta(line_no, rhs[close + pos + 1..].trim())?;
            Ok((rhs[..close + pos].trim(), Some(meta)))
        }
        None => Ok((rhs, None)),
    }
}

fn parse_meta(line_no: usize, text: &str) -> Result<TensorMeta, TextGraphError> {
    let open = text
        .find('[')
        .ok_or_else(|| TextGraphError::syntax(line_no, "metadata must look like `f32[2, 3]`"))?;
    let dtype_name = text[..open].trim();
    let dtype = DType::parse(dtype_name).ok_or_else(|| {
        TextGraphError::syntax(line_no, format!("unknown dtype `{dtype_name}`"))
    })?;
    let dims = text[open..]
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| TextGraphError::syntax(line_no, "unterminated shape"))?;
    let shape = split_top_level(dims)
        .into_iter()
        .map(|dim| {
            dim.parse::<usize>()
                .map_err(|_| TextGraphError::syntax(line_no, format!("invalid dimension `{dim}`")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(TensorMeta::new(dtype, shape))
}

fn parse_return(
    line_no: usize,
    rest: &str,
    values: &HashMap<String, NodeId>,
) -> Result<GraphOutput, TextGraphError> {
    let lookup = |raw: &str| -> Result<NodeId, TextGraphError> {
        let name = parse_value_name(line_no, raw)?;
        values
            .get(&name)
            .copied()
            .ok_or_else(|| TextGraphError::syntax(line_no, format!("unknown return value `%{name}`")))
    };
    match rest.strip_prefix('(').and_then(|inner| inner.strip_suffix(')')) {
        Some(inner) => {
            let ids = split_top_level(inner)
                .into_iter()
                .map(lookup)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(GraphOutput::Tuple(ids))
        }
        None => Ok(GraphOutput::Single(lookup(rest)?)),
    }
}

fn parse_arg(
    line_no: usize,
    raw: &str,
    values: &HashMap<String, NodeId>,
) -> Result<Arg, TextGraphError> {
    if raw.starts_with('%') {
        let name = parse_value_name(line_no, raw)?;
        return values
            .get(&name)
            .copied()
            .map(Arg::Node)
            .ok_or_else(|| TextGraphError::syntax(line_no, format!("unknown value `%{name}`")));
    }
    parse_literal(raw)
        .map(Arg::Literal)
        .ok_or_else(|| TextGraphError::syntax(line_no, format!("invalid literal `{raw}`")))
}

fn parse_literal(raw: &str) -> Option<Literal> {
    match raw {
        "true" => return Some(Literal::Bool(true)),
        "false" => return Some(Literal::Bool(false)),
        _ => {}
    }
    if let Some(inner) = raw.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
        let ints = split_top_level(inner)
            .into_iter()
            .map(|item| item.parse::<i64>().ok())
            .collect::<Option<Vec<_>>>()?;
        return Some(Literal::Ints(ints));
    }
    if let Ok(value) = raw.parse::<i64>() {
        return Some(Literal::Int(value));
    }
    raw.parse::<f64>().ok().map(Literal::Float)
}

fn parse_value_name(line_no: usize, raw: &str) -> Result<String, TextGraphError> {
    let name = raw
        .strip_prefix('%')
        .ok_or_else(|| TextGraphError::syntax(line_no, format!("value `{raw}` must start with `%`")))?;
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(TextGraphError::syntax(
            line_no,
            format!("invalid value name `{raw}`"),
        ));
    }
    Ok(name.to_string())
}

fn split_top_level(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (idx, ch) in input.char_indices() {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(input[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    let tail = input[start..].trim();
    if !tail.is_empty() || !parts.is_empty() {
        parts.push(tail);
    }
    parts
}

pub(crate) fn write_graph(graph: &Graph, name: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "graph @{name} {{")?;
    for node in graph.nodes() {
        match &node.kind {
            NodeKind::Input(role) => {
                write!(f, "  %{}: {}", node.name, role.as_str())?;
                if let Some(meta) = &node.meta {
                    write!(f, " {meta}")?;
                }
                writeln!(f)?;
            }
            NodeKind::Operation { op, args } => {
                write!(f, "  %{} = {}(", node.name, op)?;
                for (idx, arg) in args.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    match arg {
                        Arg::Node(id) => write!(f, "%{}", graph.node(*id).name)?,
                        Arg::Literal(lit) => write!(f, "{lit}")?,
                    }
                }
                f.write_str(")")?;
                if let Some(meta) = &node.meta {
                    write!(f, " : {meta}")?;
                }
                writeln!(f)?;
            }
            NodeKind::Output(output) => match output {
                GraphOutput::Single(id) => writeln!(f, "  return %{}", graph.node(*id).name)?,
                GraphOutput::Tuple(ids) => {
                    f.write_str("  return (")?;
                    for (idx, id) in ids.iter().enumerate() {
                        if idx > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "%{}", graph.node(*id).name)?;
                    }
                    writeln!(f, ")")?;
                }
            },
        }
    }
    writeln!(f, "}}")
}

/// Renders `graph` under an explicit name.
pub fn print_graph(graph: &Graph, name: &str) -> String {
    struct Named<'a>(&'a Graph, &'a str);
    impl fmt::Display for Named<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write_graph(self.0, self.1, f)
        }
    }
    Named(graph, name).to_string()
}
