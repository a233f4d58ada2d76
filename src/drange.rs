//! Byte ranges: the `[start:len]`, `[start-end]`, `[start:]` specifiers used
//! to slice field values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How far a single range specifier extends past its start offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DRangeEnd {
    /// `[start:len]`
    Length(i64),
    /// `[start-end]`, end inclusive
    Offset(i64),
    /// `[start:]`
    ToTheEnd,
}

/// One byte-range specifier. Offsets may be negative, counting from the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DRangeNode {
    pub start: i64,
    pub end: DRangeEnd,
}

impl DRangeNode {
    pub fn length(start: i64, length: i64) -> Self {
        Self {
            start,
            end: DRangeEnd::Length(length),
        }
    }

    pub fn offset(start: i64, end: i64) -> Self {
        Self {
            start,
            end: DRangeEnd::Offset(end),
        }
    }

    pub fn to_the_end(start: i64) -> Self {
        Self {
            start,
            end: DRangeEnd::ToTheEnd,
        }
    }

    /// Checks the layout-independent invariants: a positive length, and no
    /// negative span when both offsets have the same sign.
    pub fn validate(&self) -> Result<(), String> {
        match self.end {
            DRangeEnd::Length(len) if len <= 0 => Err(format!(
                "Range {} has a non-positive length of {}.",
                self, len
            )),
            DRangeEnd::Offset(end)
                if (self.start >= 0) == (end >= 0) && end < self.start =>
            {
                Err(format!(
                    "Range {} ends before it starts.",
                    self
                ))
            }
            _ => Ok(()),
        }
    }

    /// Statically known length, if any.
    pub fn static_length(&self) -> Option<i64> {
        match self.end {
            DRangeEnd::Length(len) => Some(len),
            DRangeEnd::Offset(end) if (self.start >= 0) == (end >= 0) => {
                end.checked_sub(self.start)?.checked_add(1)
            }
            _ => None,
        }
    }

    fn resolve(&self, len: usize) -> Option<(usize, usize)> {
        let len = len as i64;
        let start = if self.start < 0 { len + self.start } else { self.start };
        if start < 0 || start > len {
            return None;
        }
        let end = match self.end {
            DRangeEnd::Length(n) => start.checked_add(n)?,
            DRangeEnd::Offset(e) => {
                let e = if e < 0 { len + e } else { e };
                e.checked_add(1)?
            }
            DRangeEnd::ToTheEnd => len,
        };
        if end < start || end > len {
            return None;
        }
        Some((start as usize, end as usize))
    }
}

impl fmt::Display for DRangeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            DRangeEnd::Length(len) => write!(f, "{}:{}", self.start, len),
            DRangeEnd::Offset(end) => write!(f, "{}-{}", self.start, end),
            DRangeEnd::ToTheEnd => write!(f, "{}:", self.start),
        }
    }
}

/// A list of specifiers; the sliced bytes of each are concatenated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DRange {
    nodes: Vec<DRangeNode>,
}

impl DRange {
    pub fn new(nodes: Vec<DRangeNode>) -> Self {
        Self { nodes }
    }

    pub fn single(node: DRangeNode) -> Self {
        Self { nodes: vec![node] }
    }

    /// The whole value, `[0:]`.
    pub fn whole() -> Self {
        Self::single(DRangeNode::to_the_end(0))
    }

    pub fn nodes(&self) -> &[DRangeNode] {
        &self.nodes
    }

    pub fn validate(&self) -> Result<(), String> {
        self.nodes.iter().try_for_each(DRangeNode::validate)
    }

    /// Total length when every specifier has a static length.
    pub fn static_length(&self) -> Option<i64> {
        self.nodes
            .iter()
            .try_fold(0i64, |total, node| total.checked_add(node.static_length()?))
    }

    /// Slices `data`; `None` if any specifier falls outside it.
    pub fn apply(&self, data: &[u8]) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        for node in &self.nodes {
            let (start, end) = node.resolve(data.len())?;
            out.extend_from_slice(&data[start..end]);
        }
        Some(out)
    }
}

impl fmt::Display for DRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", node)?;
        }
        f.write_str("]")
    }
}
