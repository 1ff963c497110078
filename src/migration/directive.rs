//! In-script directives
//!
//! Directives are standalone comment lines that change how a script is run
//! instead of being executed. They are matched verbatim after trimming, and
//! only on comment statements, so the same text inside a string literal is
//! plain data.

use crate::migration::splitter::Statement;
use serde::Serialize;

/// Run the whole migration outside a transaction
pub const DISABLE_TX: &str = "---- disable-tx ----";

/// Separates the up section (above) from the down section (below) in a single file
pub const UP_DOWN_SEPARATOR: &str = "---- create above / drop below ----";

const HAZARD_PREFIX: &str = "---- hazard:";
const DIRECTIVE_SUFFIX: &str = "----";

/// A risky operation flagged by a `---- hazard: <TYPE> // <message> ----` directive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hazard {
    pub kind: String,
    pub message: String,
    /// The statement the directive annotates, if one followed it
    pub statement: Option<String>,
}

impl std::fmt::Display for Hazard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    DisableTx,
    Separator,
    Hazard { kind: String, message: String },
}

/// Recognise a directive in one comment's text
pub fn parse_directive(comment: &str) -> Option<Directive> {
    let line = comment.trim();
    if line == DISABLE_TX {
        return Some(Directive::DisableTx);
    }
    if line == UP_DOWN_SEPARATOR {
        return Some(Directive::Separator);
    }
    let body = line
        .strip_prefix(HAZARD_PREFIX)?
        .strip_suffix(DIRECTIVE_SUFFIX)?
        .trim();
    let (kind, message) = match body.split_once("//") {
        Some((kind, message)) => (kind.trim(), message.trim()),
        None => (body, ""),
    };
    if kind.is_empty() {
        return None;
    }
    Some(Directive::Hazard {
        kind: kind.to_string(),
        message: message.to_string(),
    })
}

/// Executable statements of one direction plus the hazards flagged among them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    pub statements: Vec<String>,
    pub hazards: Vec<Hazard>,
}

impl Section {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty() && self.hazards.is_empty()
    }
}

/// Result of scanning a split script for directives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    pub up: Section,
    /// Present only when the script contained the up/down separator
    pub down: Option<Section>,
    pub disable_tx: bool,
}

/// Partition statements into sections and collect directives
///
/// Comments are consulted and dropped; only queries end up in a section. A
/// hazard attaches to the next query in the same section, or to the query
/// whose text contains the directive line. A hazard with no query after it
/// still counts, so the gate cannot be dodged by placing the directive last.
/// A separator line inside a query does not split it.
pub fn scan(statements: &[Statement]) -> Script {
    let mut script = Script::default();
    let mut pending: Vec<Hazard> = Vec::new();
    let mut below_separator = false;

    for statement in statements {
        let section = if below_separator {
            script.down.get_or_insert_with(Section::default)
        } else {
            &mut script.up
        };

        if statement.is_query() {
            for comment in &statement.line_comments {
                match parse_directive(&comment.text) {
                    Some(Directive::DisableTx) => script.disable_tx = true,
                    Some(Directive::Hazard { kind, message }) => pending.push(Hazard {
                        kind,
                        message,
                        statement: None,
                    }),
                    Some(Directive::Separator) => log::warn!(
                        "Ignoring up/down separator inside a statement at line {}",
                        comment.location.line
                    ),
                    None => {}
                }
            }
            for mut hazard in pending.drain(..) {
                hazard.statement = Some(statement.content.clone());
                section.hazards.push(hazard);
            }
            section.statements.push(statement.content.clone());
            continue;
        }

        match parse_directive(&statement.content) {
            Some(Directive::DisableTx) => script.disable_tx = true,
            Some(Directive::Separator) => {
                section.hazards.append(&mut pending);
                below_separator = true;
                script.down.get_or_insert_with(Section::default);
            }
            Some(Directive::Hazard { kind, message }) => pending.push(Hazard {
                kind,
                message,
                statement: None,
            }),
            None => {}
        }
    }

    let tail = if below_separator {
        script.down.get_or_insert_with(Section::default)
    } else {
        &mut script.up
    };
    tail.hazards.append(&mut pending);

    script
}
