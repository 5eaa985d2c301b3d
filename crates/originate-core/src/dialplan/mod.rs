//! Dial string parsing
//!
//! Turns a raw dial string into a [`DialPlan`]:
//!
//! ```text
//! {a=1,b=2}[c=3|d=4]sofia/gw/100,sofia/gw/101|loopback/200
//! ^^^^^^^^^ global variables
//!          ^^^^^^^^^ per-leg inline variables
//!                   ^^^^^^^^^^^^ leg: endpoint type "sofia", data "gw/100"
//!                                ,  AND separator (dial in parallel)
//!                                             | OR separator (serial fallback)
//! ```
//!
//! ## Features
//!
//! - Multiple leading `{...}` blocks, merged with later keys winning
//! - Inline `[...]` blocks before the leg or trailing the endpoint type, with
//!   either `|` or `,` between pairs
//! - Single-quoted values protect separators: `{caller='a,b'}`
//! - Bracket-aware splitting: separators inside `[...]`/`{...}` never split groups
//!
//! Structural errors (unbalanced blocks) fail the parse. Unknown endpoint types
//! are left for the leg launcher to reject.

use std::fmt;

use tracing::{debug, warn};

use crate::errors::{OriginateError, Result};
use crate::variables::Variables;

/// Upper bound on OR-groups per plan and legs per AND-group.
pub const MAX_PEERS: usize = 128;

/// One leg to dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegSpec {
    pub endpoint_type: String,
    pub data: String,
    pub variables: Variables,
}

impl LegSpec {
    pub fn new(endpoint_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            endpoint_type: endpoint_type.into(),
            data: data.into(),
            variables: Variables::new(),
        }
    }
}

impl fmt::Display for LegSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.variables.is_empty() {
            f.write_str("[")?;
            write_vars(f, &self.variables, '|')?;
            f.write_str("]")?;
        }
        write!(f, "{}/{}", self.endpoint_type, self.data)
    }
}

/// Legs dialed in parallel; the first qualifying leg wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AndGroup {
    pub legs: Vec<LegSpec>,
}

impl AndGroup {
    pub fn len(&self) -> usize {
        self.legs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.legs.is_empty()
    }
}

/// One serial fallback alternative of a dial plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrGroup {
    pub and_group: AndGroup,
}

/// Parsed dial string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialPlan {
    pub variables: Variables,
    pub or_groups: Vec<OrGroup>,
}

impl fmt::Display for DialPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.variables.is_empty() {
            f.write_str("{")?;
            write_vars(f, &self.variables, ',')?;
            f.write_str("}")?;
        }
        for (i, group) in self.or_groups.iter().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            for (j, leg) in group.and_group.legs.iter().enumerate() {
                if j > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{}", leg)?;
            }
        }
        Ok(())
    }
}

fn write_vars(f: &mut fmt::Formatter<'_>, vars: &Variables, sep: char) -> fmt::Result {
    for (i, (k, v)) in vars.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        if v.contains(&[',', '|', '[', ']', '{', '}'][..]) {
            write!(f, "{}='{}'", k, v)?;
        } else {
            write!(f, "{}={}", k, v)?;
        }
    }
    Ok(())
}

/// Parser switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    /// Keep only the first leg of the first group.
    pub no_block: bool,
    /// Limit on OR-groups and on legs per AND-group, within `1..=MAX_PEERS`.
    pub max_peers: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            no_block: false,
            max_peers: MAX_PEERS,
        }
    }
}

impl DialPlan {
    pub fn parse(raw: &str) -> Result<Self> {
        Self::parse_with(raw, ParseOptions::default())
    }

    pub fn parse_with(raw: &str, options: ParseOptions) -> Result<Self> {
        let mut variables = Variables::new();
        let mut rest = raw.trim_start();

        while rest.starts_with('{') {
            let end = find_block_end(rest, '{', '}')
                .ok_or_else(|| OriginateError::parse("unbalanced '{' block", offset_in(raw, rest)))?;
            for (k, v) in parse_var_list(&rest[1..end], &[','])? {
                variables.shift_remove(&k);
                variables.insert(k, v);
            }
            rest = rest[end + 1..].trim_start();
        }

        if rest.trim().is_empty() {
            return Err(OriginateError::EmptyDialString);
        }

        let max_peers = options.max_peers.clamp(1, MAX_PEERS);
        let mut or_groups = Vec::new();
        for segment in split_top_level(raw, rest, &['|'])? {
            let mut legs = Vec::new();
            for leg_str in split_top_level(raw, segment, &[','])? {
                let leg_str = leg_str.trim();
                if leg_str.is_empty() {
                    debug!("Skipping empty leg in dial string");
                    continue;
                }
                legs.push(parse_leg(raw, leg_str)?);
            }
            if legs.is_empty() {
                continue;
            }
            if legs.len() > max_peers {
                warn!("AND group has {} legs, keeping the first {}", legs.len(), max_peers);
                legs.truncate(max_peers);
            }
            or_groups.push(OrGroup {
                and_group: AndGroup { legs },
            });
        }

        if or_groups.is_empty() {
            return Err(OriginateError::EmptyDialString);
        }
        if or_groups.len() > max_peers {
            warn!("Dial string has {} OR groups, keeping the first {}", or_groups.len(), max_peers);
            or_groups.truncate(max_peers);
        }

        if options.no_block {
            let total: usize = or_groups.iter().map(|g| g.and_group.len()).sum();
            if total > 1 {
                warn!("Only calling the first element in the list in this mode");
            }
            or_groups.truncate(1);
            if let Some(group) = or_groups.first_mut() {
                group.and_group.legs.truncate(1);
            }
        }

        Ok(DialPlan {
            variables,
            or_groups,
        })
    }

    /// Total number of legs across every group.
    pub fn leg_count(&self) -> usize {
        self.or_groups.iter().map(|g| g.and_group.len()).sum()
    }
}

fn parse_leg(raw: &str, leg_str: &str) -> Result<LegSpec> {
    let mut variables = Variables::new();
    let mut rest = leg_str;

    if rest.starts_with('[') {
        let end = find_block_end(rest, '[', ']')
            .ok_or_else(|| OriginateError::parse("unbalanced '[' block", offset_in(raw, rest)))?;
        variables.extend(parse_var_list(&rest[1..end], &['|', ','])?);
        rest = rest[end + 1..].trim_start();
    }

    let (mut endpoint_type, data) = match find_top_level(rest, '/') {
        Some(slash) => (&rest[..slash], &rest[slash + 1..]),
        None => (rest, ""),
    };

    if let Some(open) = endpoint_type.find('[') {
        let block = &endpoint_type[open..];
        match find_block_end(block, '[', ']') {
            Some(end) if end == block.len() - 1 => {
                variables.extend(parse_var_list(&block[1..end], &['|', ','])?);
                endpoint_type = &endpoint_type[..open];
            }
            _ => {
                return Err(OriginateError::parse(
                    "malformed variable block on endpoint type",
                    offset_in(raw, block),
                ))
            }
        }
    }

    Ok(LegSpec {
        endpoint_type: endpoint_type.trim().to_string(),
        data: data.to_string(),
        variables,
    })
}

/// Parse `k=v` pairs separated by any of `seps`. Pairs without `=` or with an
/// empty key are dropped.
fn parse_var_list(body: &str, seps: &[char]) -> Result<Variables> {
    let mut vars = Variables::new();
    for item in split_top_level(body, body, seps)? {
        let item = item.trim();
        let Some((key, value)) = item.split_once('=') else {
            if !item.is_empty() {
                debug!("Ignoring malformed variable '{}'", item);
            }
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Index of the byte closing the block opened at `s[0]`, honouring nesting and
/// single quotes.
fn find_block_end(s: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut quoted = false;
    for (i, c) in s.char_indices() {
        if c == '\'' {
            quoted = !quoted;
        } else if quoted {
            continue;
        } else if c == open {
            depth += 1;
        } else if c == close {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

fn find_top_level(s: &str, target: char) -> Option<usize> {
    let mut depth = 0i32;
    let mut quoted = false;
    for (i, c) in s.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            _ if quoted => {}
            '[' | '{' => depth += 1,
            ']' | '}' => depth -= 1,
            _ if depth == 0 && c == target => return Some(i),
            _ => {}
        }
    }
    None
}

/// Split on any separator that is outside brackets, braces and quotes.
fn split_top_level<'a>(raw: &str, s: &'a str, seps: &[char]) -> Result<Vec<&'a str>> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quoted = false;
    let mut start = 0;
    let mut opened_at = 0;

    for (i, c) in s.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            _ if quoted => {}
            '[' | '{' => {
                if depth == 0 {
                    opened_at = i;
                }
                depth += 1;
            }
            ']' | '}' => {
                depth -= 1;
                if depth < 0 {
                    return Err(OriginateError::parse(
                        format!("unexpected '{}'", c),
                        offset_in(raw, s) + i,
                    ));
                }
            }
            _ if depth == 0 && seps.contains(&c) => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err(OriginateError::parse(
            "unbalanced bracket",
            offset_in(raw, s) + opened_at,
        ));
    }
    parts.push(&s[start..]);
    Ok(parts)
}

/// Byte offset of a subslice inside the string it was sliced from.
fn offset_in(raw: &str, sub: &str) -> usize {
    let base = raw.as_ptr() as usize;
    let ptr = sub.as_ptr() as usize;
    if ptr >= base && ptr <= base + raw.len() {
        ptr - base
    } else {
        0
    }
}
