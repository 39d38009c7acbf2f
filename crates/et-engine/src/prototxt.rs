//! A narrow, hand-written parser/renderer for the restricted textproto
//! dialect Caffe solver and net specifications use: an ordered sequence of
//! top-level `key: value` scalars and `key { ... }` blocks, with at most one
//! level of nesting and scalar leaves inside blocks. This is not a general
//! textproto implementation — just enough structure to rewrite the handful
//! of fields spec §4.7 names (`net`, `snapshot_prefix`, per-layer `source`).

use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Scalar(String),
    Block(Vec<(String, String)>),
}

/// An ordered list of top-level `key: value` / `key { ... }` entries.
/// Order is preserved on render so round-tripping an unmodified document is
/// a no-op.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    entries: Vec<(String, Field)>,
}

impl Document {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut entries = Vec::new();
        let mut lines = text.lines().peekable();

        while let Some(raw) = lines.next() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, rest) = line
                .split_once(':')
                .or_else(|| line.split_once('{').map(|(k, _)| (k, "{")))
                .ok_or_else(|| anyhow::anyhow!("malformed prototxt line: {raw:?}"))?;
            let key = key.trim().to_string();

            if rest.trim_start().starts_with('{') {
                let mut inner = Vec::new();
                loop {
                    let next = lines
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("unterminated block {key:?}"))?;
                    let next = next.trim();
                    if next == "}" {
                        break;
                    }
                    if next.is_empty() || next.starts_with('#') {
                        continue;
                    }
                    let (ik, iv) = next
                        .split_once(':')
                        .ok_or_else(|| anyhow::anyhow!("malformed block entry: {next:?}"))?;
                    inner.push((ik.trim().to_string(), unquote(iv.trim())));
                }
                entries.push((key, Field::Block(inner)));
            } else {
                entries.push((key, Field::Scalar(unquote(rest.trim()))));
            }
        }

        Ok(Self { entries })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, field) in &self.entries {
            match field {
                Field::Scalar(value) => {
                    let _ = writeln!(out, "{key}: {}", quote_if_needed(value));
                }
                Field::Block(inner) => {
                    let _ = writeln!(out, "{key} {{");
                    for (ik, iv) in inner {
                        let _ = writeln!(out, "  {ik}: {}", quote_if_needed(iv));
                    }
                    let _ = writeln!(out, "}}");
                }
            }
        }
        out
    }

    /// Sets the first top-level scalar entry matching `key`, or appends one
    /// if none exists.
    pub fn set_scalar(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some((_, field)) = self.entries.iter_mut().find(|(k, _)| k == key) {
            *field = Field::Scalar(value);
        } else {
            self.entries.push((key.to_string(), Field::Scalar(value)));
        }
    }

    pub fn scalar(&self, key: &str) -> Option<&str> {
        self.entries.iter().find_map(|(k, f)| match f {
            Field::Scalar(v) if k == key => Some(v.as_str()),
            _ => None,
        })
    }

    /// Iterates every top-level block named `key` (e.g. `layer`), mutably.
    pub fn blocks_mut<'a>(
        &'a mut self,
        key: &'a str,
    ) -> impl Iterator<Item = &'a mut Vec<(String, String)>> + 'a {
        self.entries.iter_mut().filter_map(move |(k, f)| match f {
            Field::Block(inner) if k == key => Some(inner),
            _ => None,
        })
    }
}

/// Sets the first `field` key inside a block entry list, appending it if
/// absent — used while rewriting per-layer `source`.
pub fn set_block_field(block: &mut Vec<(String, String)>, field: &str, value: impl Into<String>) {
    let value = value.into();
    if let Some((_, v)) = block.iter_mut().find(|(k, _)| k == field) {
        *v = value;
    } else {
        block.push((field.to_string(), value));
    }
}

pub fn block_field<'a>(block: &'a [(String, String)], field: &str) -> Option<&'a str> {
    block.iter().find(|(k, _)| k == field).map(|(_, v)| v.as_str())
}

fn unquote(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        trimmed.to_string()
    }
}

fn quote_if_needed(value: &str) -> String {
    if value.parse::<f64>().is_ok() || value == "TRAIN" || value == "TEST" {
        value.to_string()
    } else {
        format!("\"{value}\"")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalar_and_block() {
        let text = "net: \"net.prototxt\"\nmax_iter: 10000\nlayer {\n  name: \"data\"\n  phase: TRAIN\n  source: \"train_lmdb\"\n}\n";
        let doc = Document::parse(text).unwrap();
        assert_eq!(doc.scalar("net"), Some("net.prototxt"));
        assert_eq!(doc.scalar("max_iter"), Some("10000"));

        let rendered = doc.render();
        let reparsed = Document::parse(&rendered).unwrap();
        assert_eq!(doc, reparsed);
    }

    #[test]
    fn set_scalar_overwrites_existing() {
        let mut doc = Document::parse("net: \"old.prototxt\"\nsnapshot_prefix: \"old\"\n").unwrap();
        doc.set_scalar("net", "solver-net.prototxt");
        doc.set_scalar("snapshot_prefix", "snapshot");
        assert_eq!(doc.scalar("net"), Some("solver-net.prototxt"));
        assert_eq!(doc.scalar("snapshot_prefix"), Some("snapshot"));
    }

    #[test]
    fn rewrites_layer_source_by_phase() {
        let text = "layer {\n  name: \"data\"\n  phase: TRAIN\n  source: \"old_train\"\n}\nlayer {\n  name: \"data\"\n  phase: TEST\n  source: \"old_test\"\n}\n";
        let mut doc = Document::parse(text).unwrap();
        for block in doc.blocks_mut("layer") {
            match block_field(block, "phase") {
                Some("TRAIN") => set_block_field(block, "source", "train-index.txt"),
                Some("TEST") => set_block_field(block, "source", "test-index.txt"),
                _ => {}
            }
        }
        let rendered = doc.render();
        assert!(rendered.contains("source: \"train-index.txt\""));
        assert!(rendered.contains("source: \"test-index.txt\""));
    }
}
