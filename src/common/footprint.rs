//! Recursive memory-footprint reporting.
//!
//! Every major component exposes its approximate memory usage as a tree of
//! named children, so operators can see where the memory of a running
//! instance goes.

use std::collections::BTreeMap;
use std::fmt;

/// The memory usage of a component and its sub-components.
#[derive(Clone, Debug, Default)]
pub struct MemoryFootprint {
    self_size: usize,
    children: BTreeMap<&'static str, MemoryFootprint>,
}

impl MemoryFootprint {
    /// Creates a footprint covering `self_size` bytes with no children.
    pub fn new(self_size: usize) -> Self {
        Self {
            self_size,
            children: BTreeMap::new(),
        }
    }

    /// Registers the footprint of a named sub-component.
    pub fn add_child(&mut self, name: &'static str, child: MemoryFootprint) {
        self.children.insert(name, child);
    }

    /// Returns the footprint of a named sub-component.
    pub fn child(&self, name: &str) -> Option<&MemoryFootprint> {
        self.children.get(name)
    }

    /// Returns the bytes attributed to this component alone.
    pub fn self_size(&self) -> usize {
        self.self_size
    }

    /// Returns the total bytes of this component and all children.
    pub fn total(&self) -> usize {
        self.self_size + self.children.values().map(|c| c.total()).sum::<usize>()
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, name: &str, depth: usize) -> fmt::Result {
        writeln!(
            f,
            "{:indent$}{}: {} bytes",
            "",
            name,
            self.total(),
            indent = depth * 2
        )?;
        for (child_name, child) in &self.children {
            child.fmt_indented(f, child_name, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for MemoryFootprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, "total", 0)
    }
}
