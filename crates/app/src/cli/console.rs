//! Line protocol of the interactive `run` session
//!
//! Lines that start with `:` drive the simulated page (element discovery,
//! playback, inspection). Every other non-empty line is a JSON command for
//! the state owner.

use eq8comp_core::domain::ElementId;

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleLine {
    Empty,
    /// Raw JSON for the state owner
    Command(String),
    /// Print the live graphs
    Graph,
    Add(ElementId),
    Remove(ElementId),
    Play(ElementId),
    /// Replace the tracked set with exactly these elements
    Scan(Vec<ElementId>),
    Quit,
    Unknown(String),
}

impl ConsoleLine {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return ConsoleLine::Empty;
        }
        let Some(directive) = line.strip_prefix(':') else {
            return ConsoleLine::Command(line.to_string());
        };

        let mut words = directive.split_whitespace();
        let verb = words.next().unwrap_or_default();
        let args: Vec<ElementId> = words.map(ElementId::new).collect();

        match (verb, args.as_slice()) {
            ("graph", []) => ConsoleLine::Graph,
            ("quit", []) | ("q", []) => ConsoleLine::Quit,
            ("add", [element]) => ConsoleLine::Add(element.clone()),
            ("remove", [element]) => ConsoleLine::Remove(element.clone()),
            ("play", [element]) => ConsoleLine::Play(element.clone()),
            ("scan", _) => ConsoleLine::Scan(args),
            _ => ConsoleLine::Unknown(line.to_string()),
        }
    }
}

/// Element ids for `count` simulated media elements
pub fn element_ids(count: usize) -> Vec<ElementId> {
    (1..=count)
        .map(|i| ElementId::new(format!("media-{}", i)))
        .collect()
}
