//! DSP symbol tables.
//!
//! A [`SymbolTable`] is the named parameter directory shipped with a DSP
//! program. Names are case-insensitive and stored uppercased. Logical values
//! wider than one 16-bit word are spread over consecutive symbols named
//! `BASE0`, `BASE1` (and `BASE2` for the two 48-bit counters);
//! [`SymbolTable::lookup`] resolves either form and reports how many words
//! back the value.

use crate::error::{DxpError, Result};
use std::collections::HashMap;

/// Counters that span three words (`NAME0`..`NAME2`) instead of two.
pub const THREE_WORD_COUNTERS: [&str; 2] = ["LIVETIME", "REALTIME"];

/// Access rights of a DSP symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Host may read and write
    ReadWrite,
    /// Host may only read
    ReadOnly,
    /// Host may only write
    WriteOnly,
}

impl Access {
    /// True unless write-only.
    pub fn is_readable(self) -> bool {
        self != Self::WriteOnly
    }

    /// True unless read-only.
    pub fn is_writable(self) -> bool {
        self != Self::ReadOnly
    }
}

/// One entry of a [`SymbolTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Uppercased symbol name
    pub name: String,
    /// Offset from the start of parameter memory
    pub address: u16,
    /// Host access rights
    pub access: Access,
    /// Lower bound for writes (0/0 means unbounded)
    pub lower_bound: u16,
    /// Upper bound for writes (0/0 means unbounded)
    pub upper_bound: u16,
}

impl Symbol {
    /// True if this symbol declares a range.
    pub fn is_bounded(&self) -> bool {
        !(self.lower_bound == 0 && self.upper_bound == 0)
    }

    /// Clamp `value` into the declared range. Returns the value to write and
    /// whether clamping happened.
    pub fn clamp(&self, value: u16) -> (u16, bool) {
        if !self.is_bounded() {
            return (value, false);
        }
        if value < self.lower_bound {
            (self.lower_bound, true)
        } else if value > self.upper_bound {
            (self.upper_bound, true)
        } else {
            (value, false)
        }
    }
}

/// Result of resolving a symbol name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolLookup<'a> {
    /// The name exists as a single-word symbol
    Single(&'a Symbol),
    /// The name is a multi-word value; words in `NAME0, NAME1, ...` order
    Words(Vec<&'a Symbol>),
}

impl SymbolLookup<'_> {
    /// Number of 16-bit words backing the value.
    pub fn word_count(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Words(words) => words.len(),
        }
    }

    /// All symbols involved, in word order.
    pub fn symbols(&self) -> Vec<&Symbol> {
        match self {
            Self::Single(sym) => vec![*sym],
            Self::Words(words) => words.clone(),
        }
    }
}

/// Ordered, name-indexed set of DSP symbols.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    index: HashMap<String, usize>,
    max_name_len: usize,
}

impl SymbolTable {
    /// Create an empty table accepting names up to `max_name_len` characters.
    pub fn new(max_name_len: usize) -> Self {
        Self {
            symbols: Vec::new(),
            index: HashMap::new(),
            max_name_len,
        }
    }

    /// Longest accepted symbol name.
    pub fn max_name_len(&self) -> usize {
        self.max_name_len
    }

    /// Append a symbol. Names are uppercased; duplicates and over-long names
    /// are rejected.
    pub fn push(&mut self, mut symbol: Symbol) -> Result<()> {
        symbol.name = symbol.name.to_ascii_uppercase();
        if symbol.name.is_empty() || symbol.name.len() > self.max_name_len {
            return Err(DxpError::bad_parameter(format!(
                "symbol name '{}' must be 1..={} characters",
                symbol.name, self.max_name_len
            )));
        }
        if self.index.contains_key(&symbol.name) {
            return Err(DxpError::bad_parameter(format!(
                "duplicate symbol '{}'",
                symbol.name
            )));
        }
        self.index.insert(symbol.name.clone(), self.symbols.len());
        self.symbols.push(symbol);
        Ok(())
    }

    /// Number of symbols (also the parameter block length in words).
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// True if the table has no symbols.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Exact lookup of a single symbol.
    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.index
            .get(&name.to_ascii_uppercase())
            .map(|&i| &self.symbols[i])
    }

    /// Symbol at position `index`.
    pub fn by_index(&self, index: usize) -> Option<&Symbol> {
        self.symbols.get(index)
    }

    /// Iterate in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    /// Resolve `name`, falling back to its multi-word form.
    pub fn lookup(&self, name: &str) -> Result<SymbolLookup<'_>> {
        let upper = name.to_ascii_uppercase();
        if upper.len() > self.max_name_len {
            return Err(DxpError::UnknownSymbol { name: upper });
        }
        if let Some(sym) = self.get(&upper) {
            return Ok(SymbolLookup::Single(sym));
        }

        let nwords = if THREE_WORD_COUNTERS.contains(&upper.as_str()) {
            3
        } else {
            2
        };
        let words: Option<Vec<&Symbol>> = (0..nwords)
            .map(|i| self.get(&format!("{upper}{i}")))
            .collect();
        match words {
            Some(words) => Ok(SymbolLookup::Words(words)),
            None => Err(DxpError::UnknownSymbol { name: upper }),
        }
    }
}

/// Combine words read in `NAME0, NAME1, NAME2` order into one value:
/// `w0 * 65536 + w1 + w2 * 65536^2`.
pub fn combine_words(words: &[u16]) -> f64 {
    match words {
        [] => 0.0,
        [w] => f64::from(*w),
        [w0, w1] => f64::from(*w0) * 65536.0 + f64::from(*w1),
        [w0, w1, w2, ..] => {
            f64::from(*w0) * 65536.0 + f64::from(*w1) + f64::from(*w2) * 65536.0 * 65536.0
        }
    }
}

/// Inverse of [`combine_words`] for `count` words.
pub fn split_words(value: u64, count: usize) -> Vec<u16> {
    let low = (value & 0xFFFF) as u16;
    let mid = ((value >> 16) & 0xFFFF) as u16;
    let high = ((value >> 32) & 0xFFFF) as u16;
    match count {
        0 => Vec::new(),
        1 => vec![low],
        2 => vec![mid, low],
        _ => vec![mid, low, high],
    }
}
