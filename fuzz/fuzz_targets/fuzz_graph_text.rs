//! Fuzz target for the update graph text format.
//!
//! Graph text comes from whoever controls the repository's USK, so it is
//! untrusted input on every pull.
//!
//! Attack vectors tested:
//! - Malformed `I:`/`E:` lines and bad CHKs
//! - Edges referring to missing indices
//! - Huge or negative index numbers

use bolero::check;
use infocalypse_update::UpdateGraph;

#[test]
fn fuzz_graph_text() {
    check!().with_type::<Vec<u8>>().for_each(|data| {
        let Ok(text) = std::str::from_utf8(data) else {
            return;
        };
        if let Ok(graph) = UpdateGraph::parse(text) {
            // Anything that parses must survive a second trip unchanged.
            let again = UpdateGraph::parse(&graph.to_text()).expect("serialized graph must parse");
            assert_eq!(again, graph);
            let _ = graph.validate();
            let _ = graph.get_top_key_edges();
        }
    });
}
