//! Entry file patching.
//!
//! The entry file is split into a small structured document: its import
//! block and the body of the top-level returned fragment
//! (`return ( <> ... </> )`). New imports and render tags are added to
//! those lists and the document is serialized back out. Everything else
//! in the file is carried through byte for byte.

use serde::Serialize;

/// Result of patching the entry file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PatchOutcome {
    /// At least one of the import or the render tag was inserted.
    Applied {
        import_added: bool,
        render_added: bool,
    },
    /// Both were already present.
    Unchanged,
    /// The entry file has no recognizable anchor; nothing was changed.
    NoAnchor { reason: String },
}

impl PatchOutcome {
    /// Whether the source text changed.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    fn no_anchor(reason: impl Into<String>) -> Self {
        Self::NoAnchor {
            reason: reason.into(),
        }
    }
}

/// Source text plus the outcome that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patched {
    pub source: String,
    pub outcome: PatchOutcome,
}

/// The entry file, split at its two anchors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDocument {
    /// Text up to and including the last import statement.
    head: String,
    /// Existing import statements, in order.
    imports: Vec<String>,
    /// Text between the import block and the render insertion point.
    middle: String,
    /// Existing fragment body, as written.
    body: String,
    /// Text from the render insertion point to the end.
    tail: String,
    /// Indentation for new render lines, or `None` for an inline fragment.
    indent: Option<String>,
    added_imports: Vec<String>,
    added_renders: Vec<String>,
}

impl EntryDocument {
    /// Split `source` at its anchors.
    pub fn parse(source: &str) -> Result<Self, PatchOutcome> {
        let (import_end, imports) = import_block(source);
        let fragment = returned_fragment(source)?;

        if fragment.open < import_end {
            return Err(PatchOutcome::no_anchor("returned markup precedes imports"));
        }

        let close = fragment.close;
        let line_start = source[..close].rfind('\n').map_or(0, |i| i + 1);
        let lead = &source[line_start..close];
        let (insert_at, indent) = if line_start > fragment.open && lead.trim().is_empty() {
            (line_start, Some(format!("{lead}  ")))
        } else {
            (close, None)
        };

        Ok(Self {
            head: source[..import_end].to_string(),
            imports,
            middle: source[import_end..fragment.open].to_string(),
            body: source[fragment.open..insert_at].to_string(),
            tail: source[insert_at..].to_string(),
            indent,
            added_imports: Vec::new(),
            added_renders: Vec::new(),
        })
    }

    /// Existing import statements.
    pub fn imports(&self) -> &[String] {
        &self.imports
    }

    /// Whether any import statement binds `symbol`.
    pub fn imports_symbol(&self, symbol: &str) -> bool {
        self.imports
            .iter()
            .chain(&self.added_imports)
            .any(|statement| binds_symbol(statement, symbol))
    }

    /// Whether the returned fragment already renders `<symbol`.
    pub fn renders_symbol(&self, symbol: &str) -> bool {
        let tag = format!("<{symbol}");
        let found = |text: &str| {
            text.match_indices(&tag).any(|(idx, _)| {
                text[idx + tag.len()..]
                    .chars()
                    .next()
                    .map_or(true, |c| !is_ident(c))
            })
        };
        found(&self.body) || self.added_renders.iter().any(|r| found(r))
    }

    /// Add `import <symbol> from '<module>';` unless the symbol is bound.
    pub fn add_import(&mut self, symbol: &str, module: &str) -> bool {
        if self.imports_symbol(symbol) {
            return false;
        }
        self.added_imports
            .push(format!("import {symbol} from '{module}';"));
        true
    }

    /// Add `<symbol />` to the fragment unless it is already rendered.
    pub fn add_render(&mut self, symbol: &str) -> bool {
        if self.renders_symbol(symbol) {
            return false;
        }
        self.added_renders.push(format!("<{symbol} />"));
        true
    }

    /// Serialize back to text.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(
            self.head.len() + self.middle.len() + self.body.len() + self.tail.len() + 64,
        );
        out.push_str(&self.head);
        for import in &self.added_imports {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(import);
            out.push('\n');
        }
        out.push_str(&self.middle);
        out.push_str(&self.body);
        for tag in &self.added_renders {
            match &self.indent {
                Some(indent) => {
                    out.push_str(indent);
                    out.push_str(tag);
                    out.push('\n');
                }
                None => out.push_str(tag),
            }
        }
        out.push_str(&self.tail);
        out
    }
}

/// Register `symbol` (imported from `module`) in the entry file `source`.
///
/// Idempotent: patching the output again with the same arguments returns
/// it unchanged.
pub fn patch_entry(source: &str, symbol: &str, module: &str) -> Patched {
    let mut document = match EntryDocument::parse(source) {
        Ok(document) => document,
        Err(outcome) => {
            return Patched {
                source: source.to_string(),
                outcome,
            }
        }
    };

    let import_added = document.add_import(symbol, module);
    let render_added = document.add_render(symbol);
    if !import_added && !render_added {
        return Patched {
            source: source.to_string(),
            outcome: PatchOutcome::Unchanged,
        };
    }
    Patched {
        source: document.render(),
        outcome: PatchOutcome::Applied {
            import_added,
            render_added,
        },
    }
}

/// Turn a file name into a component symbol.
///
/// Takes the stem, keeps identifier characters, and upper-cases the first
/// letter. Returns `None` if nothing usable remains.
pub fn component_symbol(filename: &str) -> Option<String> {
    let name = filename.rsplit('/').next().unwrap_or(filename);
    let stem = name.split('.').next().unwrap_or(name);
    let cleaned: String = stem.chars().filter(|c| is_ident(*c)).collect();
    let cleaned = cleaned.trim_start_matches(|c: char| c.is_ascii_digit());
    let mut chars = cleaned.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().chain(chars).collect())
}

fn is_ident(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn binds_symbol(statement: &str, symbol: &str) -> bool {
    let clause = statement
        .trim_start()
        .strip_prefix("import")
        .unwrap_or(statement);
    let clause = clause.split(" from ").next().unwrap_or(clause);
    clause.split(|c: char| !is_ident(c)).any(|word| word == symbol)
}

/// End offset of the import block and its statements.
///
/// Multi-line statements run until the line that ends with `;`.
fn import_block(source: &str) -> (usize, Vec<String>) {
    let mut imports = Vec::new();
    let mut end = 0;
    let mut offset = 0;
    let mut current: Option<(usize, String)> = None;

    for line in source.split_inclusive('\n') {
        let line_end = offset + line.len();
        let trimmed = line.trim();
        match current.as_mut() {
            Some((_, statement)) => statement.push_str(line),
            None if trimmed.starts_with("import ") => current = Some((offset, line.to_string())),
            None => {}
        }
        if trimmed.ends_with(';') {
            if let Some((_, statement)) = current.take() {
                imports.push(statement.trim_end().to_string());
                end = line_end;
            }
        }
        offset = line_end;
    }

    (end, imports)
}

struct Fragment {
    /// Offset just past the opening `<>`.
    open: usize,
    /// Offset of the matching closing `</>`.
    close: usize,
}

/// Locate `return ( <> ... </> )`.
fn returned_fragment(source: &str) -> Result<Fragment, PatchOutcome> {
    let returns: Vec<usize> = source
        .match_indices("return")
        .map(|(idx, _)| idx)
        .filter(|&idx| {
            let before = source[..idx].chars().next_back();
            let after = source[idx + "return".len()..].chars().next();
            before.map_or(true, |c| !is_ident(c)) && after.map_or(true, |c| !is_ident(c))
        })
        .collect();

    let start = match returns.as_slice() {
        [] => return Err(PatchOutcome::no_anchor("no return statement")),
        [only] => *only + "return".len(),
        _ => {
            return Err(PatchOutcome::no_anchor(
                "multiple return statements; render target is ambiguous",
            ))
        }
    };

    let rest = source[start..].trim_start();
    let Some(rest) = rest.strip_prefix('(') else {
        return Err(PatchOutcome::no_anchor("return is not followed by '('"));
    };
    let Some(after_open) = rest.trim_start().strip_prefix("<>") else {
        return Err(PatchOutcome::no_anchor("returned markup is not a fragment"));
    };
    let open = source.len() - after_open.len();

    let mut depth = 1usize;
    let mut cursor = open;
    while cursor < source.len() {
        let text = &source[cursor..];
        if text.starts_with("</>") {
            depth -= 1;
            if depth == 0 {
                let after = source[cursor + 3..].trim_start();
                if !after.starts_with(')') {
                    return Err(PatchOutcome::no_anchor("fragment is not closed by ')'"));
                }
                return Ok(Fragment {
                    open,
                    close: cursor,
                });
            }
            cursor += 3;
        } else if text.starts_with("<>") {
            depth += 1;
            cursor += 2;
        } else {
            cursor += text.chars().next().map_or(1, char::len_utf8);
        }
    }
    Err(PatchOutcome::no_anchor("unterminated fragment"))
}
