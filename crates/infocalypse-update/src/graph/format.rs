//! Line-oriented text form of the graph.
//!
//! ```text
//! I:<index>:<base>...:|:<head>...
//! E:<from>:<to>:<length>[:<chk>...]
//! ```
//!
//! Unresolved CHK slots are written as `pending` / `pending1`. An edge line
//! with no CHKs parses as a single `pending` slot. Lines starting with `#`
//! are comments; the two inserted graph copies use them to differ.

use std::collections::BTreeMap;
use std::fmt::Write;

use infocalypse_keys::Chk;

use super::EdgeEntry;
use super::IndexEntry;
use super::UpdateGraph;
use crate::error::UpdateError;
use crate::error::UpdateResult;
use crate::types::ChangesetId;
use crate::types::ChkSlot;
use crate::types::IndexId;
use crate::types::IndexPair;

const PENDING: &str = "pending";
const PENDING_ALT: &str = "pending1";

impl UpdateGraph {
    /// Serialize to the text form.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (index, entry) in &self.indices {
            let _ = write!(out, "I:{index}");
            for base in &entry.bases {
                let _ = write!(out, ":{base}");
            }
            out.push_str(":|");
            for head in &entry.heads {
                let _ = write!(out, ":{head}");
            }
            out.push('\n');
        }
        for (pair, entry) in &self.edges {
            let _ = write!(out, "E:{}:{}:{}", pair.from, pair.to, entry.length);
            for slot in &entry.chks {
                match slot {
                    ChkSlot::Pending => out.push_str(":pending"),
                    ChkSlot::PendingAlt => out.push_str(":pending1"),
                    ChkSlot::Chk(chk) => {
                        let _ = write!(out, ":{chk}");
                    }
                }
            }
            out.push('\n');
        }
        out
    }

    /// Size of the text form in bytes.
    pub fn serialized_len(&self) -> usize {
        self.to_text().len()
    }

    /// Parse the text form and check the structural invariants.
    pub fn parse(text: &str) -> UpdateResult<Self> {
        let mut indices: BTreeMap<IndexId, IndexEntry> = BTreeMap::new();
        let mut edges: BTreeMap<IndexPair, EdgeEntry> = BTreeMap::new();

        for (line_no, line) in text.lines().enumerate() {
            let line_no = line_no + 1;
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let err = |message: String| UpdateError::GraphParse { line: line_no, message };
            let fields: Vec<&str> = line.split(':').collect();
            match fields[0] {
                "I" => {
                    let (index, entry) = parse_index(&fields).map_err(err)?;
                    if indices.insert(index, entry).is_some() {
                        return Err(err(format!("duplicate index {index}")));
                    }
                }
                "E" => {
                    let (pair, entry) = parse_edge(&fields).map_err(err)?;
                    if edges.insert(pair, entry).is_some() {
                        return Err(err(format!("duplicate edge {pair}")));
                    }
                }
                other => return Err(err(format!("unknown record type {other:?}"))),
            }
        }

        let graph = UpdateGraph::from_parts(indices, edges);
        graph.validate().map_err(|source| UpdateError::GraphParse {
            line: 0,
            message: source.to_string(),
        })?;
        Ok(graph)
    }
}

fn parse_number<T: std::str::FromStr>(field: &str, what: &str) -> Result<T, String> {
    field.parse().map_err(|_| format!("bad {what} {field:?}"))
}

fn parse_index(fields: &[&str]) -> Result<(IndexId, IndexEntry), String> {
    let index: IndexId = parse_number(fields.get(1).copied().unwrap_or_default(), "index")?;
    let rest = fields.get(2..).unwrap_or_default();
    let split = rest.iter().position(|field| *field == "|").ok_or("missing head separator")?;
    let revs = |list: &[&str]| -> Result<Vec<ChangesetId>, String> {
        list.iter().map(|hex| ChangesetId::from_hex(hex).map_err(|e| e.to_string())).collect()
    };
    let bases = revs(&rest[..split])?;
    let heads = revs(&rest[split + 1..])?;
    Ok((index, IndexEntry::new(bases, heads)))
}

fn parse_edge(fields: &[&str]) -> Result<(IndexPair, EdgeEntry), String> {
    if fields.len() < 4 {
        return Err("edge needs from, to and length".to_string());
    }
    let from: IndexId = parse_number(fields[1], "from index")?;
    let to: IndexId = parse_number(fields[2], "to index")?;
    let length: u64 = parse_number(fields[3], "length")?;

    let mut chks: Vec<ChkSlot> = fields[4..]
        .iter()
        .map(|field| match *field {
            PENDING => Ok(ChkSlot::Pending),
            PENDING_ALT => Ok(ChkSlot::PendingAlt),
            uri => Chk::parse(uri).map(ChkSlot::Chk).map_err(|e| e.to_string()),
        })
        .collect::<Result<_, _>>()?;
    if chks.is_empty() {
        chks.push(ChkSlot::Pending);
    }
    Ok((IndexPair::new(from, to), EdgeEntry { length, chks }))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::types::NULL_REV;

    #[test]
    fn test_text_round_trip() {
        let mut graph = linear_graph(3, 1234);
        graph.add_edge(IndexPair::new(0, 2), 99, ChkSlot::Pending).unwrap();
        graph.add_edge(IndexPair::new(0, 2), 99, ChkSlot::PendingAlt).unwrap();

        let text = graph.to_text();
        assert!(text.contains("E:0:2:99:pending:pending1\n"));
        assert_eq!(UpdateGraph::parse(&text).unwrap(), graph);
    }

    #[test]
    fn test_sentinel_line() {
        let text = UpdateGraph::new().to_text();
        assert_eq!(text, format!("I:-1:|:{NULL_REV}\n"));
    }

    #[test]
    fn test_comments_and_missing_chk_list() {
        let text = format!("#A\nI:-1:|:{NULL_REV}\nI:0:{NULL_REV}:|:{}\nE:-1:0:42\n", rev(1));
        let graph = UpdateGraph::parse(&text).unwrap();
        assert_eq!(graph.get_chk(IndexPair::new(-1, 0).triple(0)).unwrap(), &ChkSlot::Pending);
        assert_eq!(graph.edge_length(IndexPair::new(-1, 0)).unwrap(), 42);
    }

    #[test]
    fn test_parse_errors_report_line() {
        let text = format!("I:-1:|:{NULL_REV}\nE:-1:x:1\n");
        match UpdateGraph::parse(&text) {
            Err(UpdateError::GraphParse { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(UpdateGraph::parse("X:1\n").is_err());
        assert!(UpdateGraph::parse(&format!("I:-1:{NULL_REV}\n")).is_err());
    }

    #[test]
    fn test_parse_rejects_invariant_violations() {
        // Gap between indices.
        let text = format!("I:-1:|:{NULL_REV}\nI:1:{NULL_REV}:|:{}\n", rev(1));
        assert!(UpdateGraph::parse(&text).is_err());
        // Edge to a missing index.
        let text = format!("I:-1:|:{NULL_REV}\nE:-1:3:10:pending\n");
        assert!(UpdateGraph::parse(&text).is_err());
    }
}
