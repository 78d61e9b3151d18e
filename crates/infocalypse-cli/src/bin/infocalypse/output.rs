//! Output formatting for CLI responses.
//!
//! Supports both human-readable and JSON output formats for
//! integration with scripts and other tools.

use infocalypse_store::SskKeypair;
use infocalypse_update::TopKey;
use infocalypse_update::UpdateGraph;
use infocalypse_update::ops::RepoInfo;
use infocalypse_update::sm::InsertOutcome;
use infocalypse_update::sm::InsertReport;
use infocalypse_update::sm::PullOutcome;
use infocalypse_update::sm::PullReport;
use serde_json::json;

/// Trait for types that can be output in multiple formats.
pub trait Outputable {
    /// Convert to JSON value for structured output.
    fn to_json(&self) -> serde_json::Value;

    /// Convert to human-readable string.
    fn to_human(&self) -> String;
}

/// Print a value in the appropriate format.
pub fn print_output<T: Outputable>(value: &T, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&value.to_json())
                .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize: {}\"}}", e))
        );
    } else {
        println!("{}", value.to_human());
    }
}

/// A generated keypair, shown as USKs under `name`.
pub struct KeypairOutput {
    pub keypair: SskKeypair,
    pub name: String,
}

impl Outputable for KeypairOutput {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "insert_uri": self.keypair.insert.to_usk(self.name.as_str(), 0).to_string(),
            "request_uri": self.keypair.request.to_usk(self.name.as_str(), 0).to_string(),
        })
    }

    fn to_human(&self) -> String {
        format!(
            "Insert URI:  {}\nRequest URI: {}\n\nKeep the insert URI private.",
            self.keypair.insert.to_usk(self.name.as_str(), 0),
            self.keypair.request.to_usk(self.name.as_str(), 0)
        )
    }
}

fn insert_outcome_name(outcome: InsertOutcome) -> &'static str {
    match outcome {
        InsertOutcome::Inserted => "inserted",
        InsertOutcome::Reinserted => "reinserted",
        InsertOutcome::UpToDate => "up_to_date",
    }
}

pub struct InsertOutput {
    pub report: InsertReport,
}

impl Outputable for InsertOutput {
    fn to_json(&self) -> serde_json::Value {
        let report = &self.report;
        json!({
            "outcome": insert_outcome_name(report.outcome),
            "version": report.version,
            "request_uri": report.request_uri.to_string(),
            "new_edges": report.new_edges.iter().map(|edge| edge.to_string()).collect::<Vec<_>>(),
            "graph_chks": report.graph_chks.iter().map(|chk| chk.to_string()).collect::<Vec<_>>(),
        })
    }

    fn to_human(&self) -> String {
        let report = &self.report;
        match report.outcome {
            InsertOutcome::UpToDate => {
                format!("Nothing new to push. Latest version: {}", report.request_uri)
            }
            InsertOutcome::Inserted => format!(
                "Inserted {} bundle(s).\nRequest URI: {}",
                report.new_edges.len(),
                report.request_uri
            ),
            InsertOutcome::Reinserted => format!(
                "Reinserted {} block set(s) for version {}.\nRequest URI: {}",
                report.new_edges.len(),
                report.version,
                report.request_uri
            ),
        }
    }
}

pub struct PullOutput {
    pub report: PullReport,
}

impl Outputable for PullOutput {
    fn to_json(&self) -> serde_json::Value {
        let report = &self.report;
        let bundles_applied = match report.outcome {
            PullOutcome::AllHeadsPresent => 0,
            PullOutcome::Updated { bundles_applied } => bundles_applied,
        };
        json!({
            "version": report.version,
            "request_uri": report.request_uri.to_string(),
            "bundles_applied": bundles_applied,
            "heads": report.heads.iter().map(|head| head.to_hex()).collect::<Vec<_>>(),
        })
    }

    fn to_human(&self) -> String {
        let report = &self.report;
        let summary = match report.outcome {
            PullOutcome::AllHeadsPresent => "Already up to date.".to_string(),
            PullOutcome::Updated { bundles_applied } => format!("Applied {bundles_applied} bundle(s)."),
        };
        let heads: Vec<String> = report.heads.iter().map(|head| head.short()).collect();
        format!("{summary}\nVersion: {}\nHeads:   {}", report.version, heads.join(" "))
    }
}

pub struct InfoOutput {
    pub info: RepoInfo,
}

fn top_key_json(top_key: &TopKey) -> serde_json::Value {
    json!({
        "graph_chks": top_key.graph_chks.iter().map(|chk| chk.to_string()).collect::<Vec<_>>(),
        "updates": top_key.updates.iter().map(|update| json!({
            "length": update.length,
            "parents": update.parents.iter().map(|rev| rev.to_hex()).collect::<Vec<_>>(),
            "heads": update.heads.iter().map(|rev| rev.to_hex()).collect::<Vec<_>>(),
            "parents_complete": update.parents_complete,
            "heads_complete": update.heads_complete,
            "chks": update.chks.len(),
        })).collect::<Vec<_>>(),
    })
}

fn graph_json(graph: &UpdateGraph) -> serde_json::Value {
    json!({
        "latest_index": graph.latest_index(),
        "indices": graph.indices().count(),
        "edges": graph.edges().map(|(pair, entry)| json!({
            "from": pair.from,
            "to": pair.to,
            "length": entry.length,
            "copies": entry.chks.len(),
        })).collect::<Vec<_>>(),
    })
}

impl Outputable for InfoOutput {
    fn to_json(&self) -> serde_json::Value {
        let info = &self.info;
        json!({
            "request_uri": info.request_uri.to_string(),
            "version": info.version,
            "top_key": top_key_json(&info.top_key),
            "graph": info.graph.as_ref().map(graph_json),
        })
    }

    fn to_human(&self) -> String {
        let info = &self.info;
        let mut out = format!(
            "Repository Info\n\
             ===============\n\
             URI:        {}\n\
             Version:    {}\n\
             Graph CHKs: {}",
            info.request_uri,
            info.version,
            info.top_key.graph_chks.len()
        );
        for update in &info.top_key.updates {
            let heads: Vec<String> = update.heads.iter().map(|rev| rev.short()).collect();
            let more = if update.heads_complete { "" } else { " ..." };
            out.push_str(&format!(
                "\nUpdate:     {} bytes, {} copies, heads {}{more}",
                update.length,
                update.chks.len(),
                heads.join(" ")
            ));
        }
        if let Some(graph) = &info.graph {
            out.push_str(&format!(
                "\nGraph:      {} indices, {} edges, latest index {}",
                graph.indices().count(),
                graph.edges().count(),
                graph.latest_index()
            ));
            for (pair, entry) in graph.edges() {
                out.push_str(&format!("\n  {pair}: {} bytes x{}", entry.length, entry.chks.len()));
            }
        }
        out
    }
}
