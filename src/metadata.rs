//! Metadata descriptor (§6): a small human-readable, s-expression-like text
//! format — deliberately not JSON/serde, mirroring the hand-rolled
//! descriptor grammars this stack uses for its own on-disk control files
//! rather than pulling in a general serialization framework for a handful
//! of scalar fields.
//!
//! Grammar (one form per line, blank lines and `;`-prefixed comments
//! ignored):
//!
//! ```text
//! (field "density")
//! (dimensions 256 256 256)
//! (dtype f32)
//! (num-levels 3)
//! (brick-dims 32 32 32)
//! (bricks-per-chunk 1 512)
//! (bricks-per-file 1 4096)
//! (transform ":210210:210:210")
//! (group-levels false)
//! (group-sub-levels false)
//! (group-bit-planes true)
//! (value-range -1.25 4.75)
//! ```

use std::fmt::Write as _;

use crate::address::GroupingFlags;
use crate::error::{Idx2Error, Idx2Result};
use crate::grid::V3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    F32,
    F64,
    I16,
    I32,
    U8,
    U16,
}

impl DataType {
    pub fn byte_size(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F64 => 8,
            DataType::I16 | DataType::U16 => 2,
            DataType::U8 => 1,
        }
    }

    fn parse(s: &str) -> Idx2Result<Self> {
        Ok(match s {
            "f32" => DataType::F32,
            "f64" => DataType::F64,
            "i16" => DataType::I16,
            "i32" => DataType::I32,
            "u8" => DataType::U8,
            "u16" => DataType::U16,
            other => return Err(Idx2Error::UnsupportedDataType(other.to_string())),
        })
    }

    fn as_str(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::I16 => "i16",
            DataType::I32 => "i32",
            DataType::U8 => "u8",
            DataType::U16 => "u16",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Metadata {
    pub field: String,
    pub dimensions: V3,
    pub dtype: DataType,
    pub num_levels: usize,
    pub brick_dims: V3,
    /// One entry per level: (bricks_per_chunk, bricks_per_file).
    pub bricks_per_chunk: Vec<u32>,
    pub bricks_per_file: Vec<u32>,
    pub transform: String,
    pub grouping: GroupingFlags,
    pub value_range: (f64, f64),
}

impl Metadata {
    pub fn write_to_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "(field \"{}\")", self.field);
        let _ = writeln!(out, "(dimensions {} {} {})", self.dimensions.x, self.dimensions.y, self.dimensions.z);
        let _ = writeln!(out, "(dtype {})", self.dtype.as_str());
        let _ = writeln!(out, "(num-levels {})", self.num_levels);
        let _ = writeln!(out, "(brick-dims {} {} {})", self.brick_dims.x, self.brick_dims.y, self.brick_dims.z);
        let _ = writeln!(
            out,
            "(bricks-per-chunk {})",
            self.bricks_per_chunk.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ")
        );
        let _ = writeln!(
            out,
            "(bricks-per-file {})",
            self.bricks_per_file.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ")
        );
        let _ = writeln!(out, "(transform \"{}\")", self.transform);
        let _ = writeln!(out, "(group-levels {})", self.grouping.group_levels);
        let _ = writeln!(out, "(group-sub-levels {})", self.grouping.group_sub_levels);
        let _ = writeln!(out, "(group-bit-planes {})", self.grouping.group_bit_planes);
        let _ = writeln!(out, "(value-range {} {})", self.value_range.0, self.value_range.1);
        out
    }

    pub fn parse(text: &str) -> Idx2Result<Self> {
        let mut field = None;
        let mut dimensions = None;
        let mut dtype = None;
        let mut num_levels = None;
        let mut brick_dims = None;
        let mut bricks_per_chunk = None;
        let mut bricks_per_file = None;
        let mut transform = None;
        let mut group_levels = false;
        let mut group_sub_levels = false;
        let mut group_bit_planes = false;
        let mut value_range = None;

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            let (name, args) = parse_form(line)?;
            match name {
                "field" => field = Some(unquote(args.first().copied().unwrap_or(""))?),
                "dimensions" => dimensions = Some(parse_v3(&args)?),
                "dtype" => dtype = Some(DataType::parse(args.first().copied().unwrap_or(""))?),
                "num-levels" => num_levels = Some(parse_usize(&args, "num-levels")?),
                "brick-dims" => brick_dims = Some(parse_v3(&args)?),
                "bricks-per-chunk" => bricks_per_chunk = Some(parse_u32_list(&args)?),
                "bricks-per-file" => bricks_per_file = Some(parse_u32_list(&args)?),
                "transform" => transform = Some(unquote(args.first().copied().unwrap_or(""))?),
                "group-levels" => group_levels = parse_bool(&args)?,
                "group-sub-levels" => group_sub_levels = parse_bool(&args)?,
                "group-bit-planes" => group_bit_planes = parse_bool(&args)?,
                "value-range" => value_range = Some(parse_f64_pair(&args)?),
                other => {
                    return Err(Idx2Error::SyntaxError {
                        what: "metadata".into(),
                        detail: format!("unknown form '{other}'"),
                    })
                }
            }
        }

        Ok(Metadata {
            field: field.ok_or_else(|| missing("field"))?,
            dimensions: dimensions.ok_or_else(|| missing("dimensions"))?,
            dtype: dtype.ok_or_else(|| missing("dtype"))?,
            num_levels: num_levels.ok_or_else(|| missing("num-levels"))?,
            brick_dims: brick_dims.ok_or_else(|| missing("brick-dims"))?,
            bricks_per_chunk: bricks_per_chunk.ok_or_else(|| missing("bricks-per-chunk"))?,
            bricks_per_file: bricks_per_file.ok_or_else(|| missing("bricks-per-file"))?,
            transform: transform.ok_or_else(|| missing("transform"))?,
            grouping: GroupingFlags { group_levels, group_sub_levels, group_bit_planes },
            value_range: value_range.ok_or_else(|| missing("value-range"))?,
        })
    }
}

fn missing(field: &str) -> Idx2Error {
    Idx2Error::IncompatibleMetadata(format!("missing required form '{field}'"))
}

fn parse_form(line: &str) -> Idx2Result<(&str, Vec<&str>)> {
    let line = line.strip_prefix('(').ok_or_else(|| syntax("expected '('"))?;
    let line = line.strip_suffix(')').ok_or_else(|| syntax("expected ')'"))?;
    let tokens = tokenize(line);
    let name = tokens.first().copied().ok_or_else(|| syntax("empty form"))?;
    Ok((name, tokens[1..].to_vec()))
}

fn syntax(detail: &str) -> Idx2Error {
    Idx2Error::SyntaxError { what: "metadata".into(), detail: detail.to_string() }
}

/// Split on whitespace while keeping quoted strings intact.
fn tokenize(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let start = i;
        if bytes[i] == b'"' {
            i += 1;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            i = (i + 1).min(bytes.len());
        } else {
            while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                i += 1;
            }
        }
        out.push(&s[start..i]);
    }
    out
}

fn unquote(s: &str) -> Idx2Result<String> {
    let s = s.strip_prefix('"').and_then(|s| s.strip_suffix('"')).ok_or_else(|| syntax("expected quoted string"))?;
    Ok(s.to_string())
}

fn parse_v3(args: &[&str]) -> Idx2Result<V3> {
    if args.len() != 3 {
        return Err(syntax("expected 3 integers"));
    }
    let parse_one = |s: &str| s.parse::<i32>().map_err(|_| syntax("expected integer"));
    Ok(V3::new(parse_one(args[0])?, parse_one(args[1])?, parse_one(args[2])?))
}

fn parse_usize(args: &[&str], what: &str) -> Idx2Result<usize> {
    args.first()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| syntax(&format!("expected integer for '{what}'")))
}

fn parse_u32_list(args: &[&str]) -> Idx2Result<Vec<u32>> {
    args.iter().map(|s| s.parse::<u32>().map_err(|_| syntax("expected integer list"))).collect()
}

fn parse_bool(args: &[&str]) -> Idx2Result<bool> {
    match args.first().copied() {
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        _ => Err(syntax("expected 'true' or 'false'")),
    }
}

fn parse_f64_pair(args: &[&str]) -> Idx2Result<(f64, f64)> {
    if args.len() != 2 {
        return Err(syntax("expected 2 floats"));
    }
    let a = args[0].parse::<f64>().map_err(|_| syntax("expected float"))?;
    let b = args[1].parse::<f64>().map_err(|_| syntax("expected float"))?;
    Ok((a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Metadata {
        Metadata {
            field: "density".into(),
            dimensions: V3::new(256, 256, 256),
            dtype: DataType::F32,
            num_levels: 3,
            brick_dims: V3::new(32, 32, 32),
            bricks_per_chunk: vec![512, 512, 512],
            bricks_per_file: vec![4096, 4096, 4096],
            transform: ":210210:210:210".into(),
            grouping: GroupingFlags { group_levels: false, group_sub_levels: false, group_bit_planes: true },
            value_range: (-1.25, 4.75),
        }
    }

    #[test]
    fn round_trips_through_text() {
        let meta = sample();
        let text = meta.write_to_string();
        let parsed = Metadata::parse(&text).unwrap();
        assert_eq!(parsed.field, meta.field);
        assert_eq!(parsed.dimensions, meta.dimensions);
        assert_eq!(parsed.dtype, meta.dtype);
        assert_eq!(parsed.transform, meta.transform);
        assert_eq!(parsed.grouping.group_bit_planes, true);
        assert_eq!(parsed.value_range, meta.value_range);
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let text = "; a comment\n\n(field \"x\")\n(dimensions 1 1 1)\n(dtype u8)\n(num-levels 1)\n(brick-dims 1 1 1)\n(bricks-per-chunk 1)\n(bricks-per-file 1)\n(transform \"0\")\n(group-levels false)\n(group-sub-levels false)\n(group-bit-planes false)\n(value-range 0 1)\n";
        let parsed = Metadata::parse(text).unwrap();
        assert_eq!(parsed.field, "x");
    }

    #[test]
    fn missing_required_form_errors() {
        let err = Metadata::parse("(field \"x\")\n");
        assert!(err.is_err());
    }

    #[test]
    fn unknown_dtype_errors() {
        let text = sample().write_to_string().replace("f32", "f128");
        assert!(Metadata::parse(&text).is_err());
    }
}
