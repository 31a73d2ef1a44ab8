// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! The manifest pattern language and its compiler.
//!
//! Two surface languages compile to regular expressions:
//!
//! - *Path patterns* describe directory trees. `{{name}}` declares a user
//!   variable occupying exactly one path segment. The compiled form is one
//!   anchored regex per path segment (a *layer*), plus a template used to
//!   reconstruct the matched path as a group key.
//! - *File-name patterns* describe artifact names. `${name}` / `${name:op}`
//!   bind a previously declared user variable (optionally case-folded), and
//!   `%X` markers capture time fields or generic character classes.
//!
//! Both languages may embed `%X` substitution markers; the full table lives
//! in [`write_substitution_into`].

use std::collections::HashMap;
use std::fmt::Write as _;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::timestamp::TimeField;

/// Regex fragment matched by user variables and `%v` substitutions: one path
/// segment, never empty, no dots or backslashes, non-greedy.
const VARIABLE_VALUE_SYNTAX: &str = "[^\\\\./]+?";

/// The marker character introducing a time-field or character-class
/// substitution. Must be ASCII and not a regex meta character.
pub const SUBSTITUTION_MARKER: char = '%';

static VARIABLE_DEF_RAW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{(?P<var>\w+)\}\}").expect("variable definition regex is valid")
});

// Matches `${name}` / `${name:op}` tokens after the pattern has been
// regex-escaped, hence the escaped `$`, `{`, and `}`.
static VARIABLE_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\\$\\\{(?P<var>\w+)(?::(?P<op>[a-zA-Z]*))?\\\}")
        .expect("variable reference regex is valid")
});

/// Errors produced while compiling manifest patterns.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    /// The generated expression was rejected by the regex engine, e.g.
    /// because the same time field or variable is captured twice within one
    /// pattern.
    #[error("invalid pattern expression: {0}")]
    Regex(#[from] regex::Error),

    /// A file pattern referenced a variable the path pattern never declared.
    #[error("use of undefined variable '{0}'")]
    UndefinedVariable(String),
}

/// A case conversion applied to a bound variable value before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// Fold the bound value to lowercase.
    Lower,
    /// Fold the bound value to uppercase.
    Upper,
}

impl Conversion {
    /// Applies the conversion to `value`.
    pub fn apply(&self, value: &str) -> String {
        match self {
            Self::Lower => value.to_lowercase(),
            Self::Upper => value.to_uppercase(),
        }
    }

    fn from_op(op: &str) -> Option<Self> {
        match op {
            "" => None,
            "lower" => Some(Self::Lower),
            "upper" => Some(Self::Upper),
            _ => {
                tracing::warn!(operation = op, "unknown operation, defaulting to no op");
                None
            }
        }
    }
}

/// One variable slot of a [`DirectoryFilter`], in capture order across all
/// layers. Slots exist for user variables (`{{name}}`) and for `%X`
/// substitutions embedded in path literals.
#[derive(Debug, Clone)]
pub struct VariableDefinition {
    /// The variable name; `%X` substitutions keep their marker spelling.
    pub name: String,
    /// Set when the substitution captures a time field.
    pub parser: Option<TimeField>,
    /// Fused variables do not participate in group identity.
    pub fuse: bool,
}

/// Resolution of one capture group of a compiled file pattern.
#[derive(Debug, Clone, Copy, Default)]
pub struct VariableReference {
    /// 1-based index into the directory binding. `0` means the capture is a
    /// time field or character class internal to the file pattern.
    pub offset: usize,
    /// Case conversion applied to the bound directory value before comparing
    /// it against the file capture.
    pub conversion: Option<Conversion>,
    /// Set when the capture carries a time field.
    pub parser: Option<TimeField>,
}

/// The compiled form of a path pattern.
#[derive(Debug, Clone)]
pub struct DirectoryFilter {
    /// The normalised source pattern.
    pub pattern: String,
    /// Literal fragments interleaved with the variables; always exactly one
    /// more literal than there are variables.
    pub template: Vec<String>,
    /// One anchored regex per path segment. Empty for the disk root.
    pub layers: Vec<Regex>,
    /// All capture slots, in capture order across the layers.
    pub variables: Vec<VariableDefinition>,
}

/// Compiles a path pattern into a [`DirectoryFilter`] plus the 1-based
/// offsets of its user variables, which file-pattern compilation needs to
/// resolve `${name}` references.
pub fn parse_path_pattern(
    pattern: &str,
) -> Result<(DirectoryFilter, HashMap<String, usize>), PatternError> {
    let normalized = pattern.trim_matches('/');

    if normalized.is_empty() || normalized == "." {
        // The pattern refers to the disk root.
        let filter = DirectoryFilter {
            pattern: ".".to_owned(),
            template: vec![".".to_owned()],
            layers: Vec::new(),
            variables: Vec::new(),
        };
        return Ok((filter, HashMap::new()));
    }

    let normalized = normalized.strip_prefix("./").unwrap_or(normalized);
    let (captures, leftovers) = split_pattern(normalized);

    let mut variable_offsets = HashMap::new();
    let mut layers = Vec::with_capacity(normalized.matches('/').count() + 1);
    let mut template = Vec::new();
    let mut variables: Vec<VariableDefinition> = Vec::new();
    let mut offset = 1usize;
    let mut expr = String::from("^");

    for (i, literal) in leftovers.iter().enumerate() {
        let mut segment = literal.as_str();
        let var_count = variables.len();

        while let Some(slash) = segment.find('/') {
            let vars = expand_substitutions_into(&regex::escape(&segment[..slash]), &mut expr);
            offset += vars.len();
            variables.extend(vars);

            expr.push('$');
            layers.push(Regex::new(&expr)?);

            expr.clear();
            expr.push('^');
            segment = &segment[slash + 1..];
        }

        let vars = expand_substitutions_into(&regex::escape(segment), &mut expr);
        offset += vars.len();
        variables.extend(vars);
        append_to_template(&mut template, literal, &variables[var_count..]);

        if i < captures.len() {
            variables.push(VariableDefinition {
                name: captures[i].clone(),
                parser: None,
                fuse: false,
            });
            variable_offsets.insert(captures[i].clone(), offset);
            offset += 1;

            let _ = write!(expr, "(?P<_{}>{})", captures[i], VARIABLE_VALUE_SYNTAX);
        }
    }

    expr.push('$');
    layers.push(Regex::new(&expr)?);

    let filter = DirectoryFilter {
        pattern: normalized.to_owned(),
        template,
        layers,
        variables,
    };

    Ok((filter, variable_offsets))
}

/// Splits a path pattern on its `{{name}}` tokens, yielding the variable
/// names and the literal fragments around them (one more literal than there
/// are names).
fn split_pattern(pattern: &str) -> (Vec<String>, Vec<String>) {
    if pattern.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let mut captures = Vec::new();
    let mut leftovers = Vec::new();
    let mut last = 0;

    for found in VARIABLE_DEF_RAW.captures_iter(pattern) {
        let whole = found.get(0).expect("group 0 always participates");
        leftovers.push(pattern[last..whole.start()].to_owned());
        last = whole.end();
        captures.push(found["var"].to_owned());
    }

    leftovers.push(pattern[last..].to_owned());

    (captures, leftovers)
}

/// Splits `fragment` at each substitution marker it contains, appending the
/// pieces to the template so that literals and capture slots alternate.
fn append_to_template(
    template: &mut Vec<String>,
    fragment: &str,
    substitutions: &[VariableDefinition],
) {
    let mut fragment = fragment;

    for substitution in substitutions {
        let offset = fragment
            .find(&substitution.name)
            .expect("substitution names are taken from this fragment");
        template.push(fragment[..offset].to_owned());
        fragment = &fragment[offset + substitution.name.len()..];
    }

    template.push(fragment.to_owned());
}

/// Expands the `%X` substitution markers of `input` (an already
/// regex-escaped fragment) into `text`, returning one [`VariableDefinition`]
/// per capture the expansion introduced.
fn expand_substitutions_into(input: &str, text: &mut String) -> Vec<VariableDefinition> {
    let mut captures = Vec::new();
    text.reserve(input.len());
    let mut substitute = false;

    for ch in input.chars() {
        if substitute {
            // Escaping may have put a backslash in front of a marker
            // character ('?' in particular); skip it and read the marker
            // proper from the next character.
            if ch == '\\' {
                continue;
            }
            substitute = false;
            if let Some(parser) = write_substitution_into(ch, text) {
                captures.push(VariableDefinition {
                    name: format!("{SUBSTITUTION_MARKER}{ch}"),
                    parser,
                    fuse: false,
                });
            }
        } else if ch == SUBSTITUTION_MARKER {
            substitute = true;
        } else {
            text.push(ch);
        }
    }

    if substitute {
        // The last character was a single '%'.
        text.push(SUBSTITUTION_MARKER);
    }

    captures
}

/// Writes the expansion of one substitution marker into `to`.
///
/// Returns `None` when the marker does not introduce a capture (`%%` and
/// unknown markers); otherwise the contained option carries the time field
/// the capture binds, if any.
fn write_substitution_into(marker: char, to: &mut String) -> Option<Option<TimeField>> {
    let parser = match marker {
        SUBSTITUTION_MARKER => {
            to.push(SUBSTITUTION_MARKER);
            return None;
        }
        'Y' => {
            to.push_str("(?P<year>[0-9]{4})");
            Some(TimeField::Year)
        }
        'y' => {
            to.push_str("(?P<year>[0-9]{2})");
            Some(TimeField::Year)
        }
        'M' => {
            to.push_str("(?P<month>0[1-9]|1[0-2])");
            Some(TimeField::Month)
        }
        'D' => {
            to.push_str("(?P<day>0[1-9]|[1,2][0-9]|3[0,1])");
            Some(TimeField::Day)
        }
        'h' => {
            to.push_str("(?P<hour>[0,1][0-9]|2[0-3])");
            Some(TimeField::Hour)
        }
        'm' => {
            to.push_str("(?P<minute>[0-5][0-9])");
            Some(TimeField::Minute)
        }
        's' => {
            to.push_str("(?P<second>[0-5][0-9])");
            Some(TimeField::Second)
        }
        'i' => {
            to.push_str("(0|[1-9][0-9]*)");
            None
        }
        'I' => {
            to.push_str("([0-9]+)");
            None
        }
        'x' => {
            to.push_str("([0-9a-f]+)");
            None
        }
        'X' => {
            to.push_str("([0-9A-F]+)");
            None
        }
        'w' => {
            to.push_str("(\\w+)");
            None
        }
        'v' => {
            to.push('(');
            to.push_str(VARIABLE_VALUE_SYNTAX);
            to.push(')');
            None
        }
        '?' => {
            to.push_str("(.+?)");
            None
        }
        other => {
            // The given character is not a valid substitute; emit a warning
            // and output nothing.
            tracing::warn!("'%{other}' is not a valid substitution, ignoring it");
            return None;
        }
    };

    Some(parser)
}

/// Compiles a file-name pattern into an anchored regex.
pub fn parse_file_pattern(pattern: &str) -> Result<Regex, PatternError> {
    let escaped = format!("^{}$", regex::escape(pattern));

    let replacement = format!("(?P<${{op}}_${{var}}>{VARIABLE_VALUE_SYNTAX})");
    let substituted = VARIABLE_REF.replace_all(&escaped, replacement.as_str());

    let mut expanded = String::new();
    expand_substitutions_into(&substituted, &mut expanded);

    Ok(Regex::new(&expanded)?)
}

/// Builds the [`VariableReference`] table for a compiled file pattern: one
/// entry per capture group, resolving `op_name` groups against the path
/// pattern's variable offsets and bare names against the time fields.
pub fn parse_variable_references(
    pattern: &Regex,
    variable_offsets: &HashMap<String, usize>,
) -> Result<Vec<VariableReference>, PatternError> {
    let mut references = Vec::with_capacity(pattern.captures_len());

    for name in pattern.capture_names() {
        let Some(name) = name else {
            // The whole-match pseudo group and anonymous class captures.
            references.push(VariableReference::default());
            continue;
        };

        let Some((op, variable)) = name.split_once('_') else {
            references.push(VariableReference {
                offset: 0,
                conversion: None,
                parser: TimeField::from_name(name),
            });
            continue;
        };

        let Some(&offset) = variable_offsets.get(variable) else {
            return Err(PatternError::UndefinedVariable(variable.to_owned()));
        };

        references.push(VariableReference {
            offset,
            conversion: Conversion::from_op(op),
            parser: None,
        });
    }

    Ok(references)
}
