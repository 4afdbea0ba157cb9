//! # pathtrie
//!
//! A path-template matching engine: a compact radix trie with a small
//! instruction VM for parameter-bearing edges.
//!
//! Templates like `/api/users/{id}`, `/files/{name}.{ext}` or `/static/*` are
//! compiled into a flat, index-addressed trie. Matching an input path is a
//! single zero-allocation walk that records the byte range of every captured
//! parameter into a caller-owned buffer.
//!
//! ## Example
//!
//! ```rust
//! use pathtrie::{MatchResult, PathTrie};
//!
//! let mut trie: PathTrie<u64> = PathTrie::new();
//! trie.insert("/api/users/{id}", 7).unwrap();
//!
//! let mut caps = vec![0u32; trie.required_caps()];
//! let mut out = MatchResult::default();
//! assert!(trie.search(b"/api/users/123", &mut caps, &mut out));
//! assert_eq!(trie.value(out.node_index), Some(&7));
//! assert_eq!(&b"/api/users/123"[caps[0] as usize..caps[1] as usize], b"123");
//! ```
//!
//! The engine knows nothing about HTTP: no methods, no URL decoding, no
//! middleware. Inputs are decoded ASCII byte strings; method dispatch lives in
//! the `pathtrie-router` crate.

#![warn(clippy::all)]

use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::debug;

// =============================================================================
// Errors
// =============================================================================

/// Alias for results carrying [`TrieError`].
pub type Result<T> = std::result::Result<T, TrieError>;

/// Why a template failed to compile. The byte index of the offending position
/// is carried alongside in [`TrieError::InvalidTemplate`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TemplateErrorKind {
    #[error("template must start with the delimiter")]
    MissingLeadingDelimiter,
    #[error("unclosed '{{'")]
    UnclosedBrace,
    #[error("empty parameter name")]
    EmptyParamName,
    #[error("parameter names may only contain [A-Za-z0-9_]")]
    InvalidParamChar,
    #[error("parameter name is used twice in one template")]
    DuplicateParamName,
    #[error("non-ASCII byte")]
    NonAscii,
    #[error("escape at end of template")]
    TrailingEscape,
    #[error("'*' is only allowed as a trailing segment")]
    WildcardNotTrailing,
    #[error("unmatched '}}'")]
    StrayRBrace,
    #[error("adjacent parameters need a separating literal")]
    AdjacentParams,
}

/// Errors surfaced by construction and mutation. The search path never
/// returns errors; a non-match is simply `false`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrieError {
    #[error("invalid delimiter {0:?}: must be one of '/', ':', '|'")]
    InvalidDelimiter(char),
    #[error("engine is frozen")]
    Frozen,
    #[error("invalid template at byte {index}: {kind}")]
    InvalidTemplate {
        kind: TemplateErrorKind,
        index: usize,
    },
    #[error("template is already registered")]
    Duplicate,
    #[error("node already holds the maximum number of parameter edge variants")]
    TooManyParamVariants,
    #[error("template registry was dropped by finalize")]
    Unavailable,
}

/// A batch insert failure: the underlying error plus the offending row's
/// template.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("batch insert failed for {template:?}: {error}")]
pub struct BatchError {
    pub template: String,
    #[source]
    pub error: TrieError,
}

#[inline]
fn template_err(kind: TemplateErrorKind, index: usize) -> TrieError {
    TrieError::InvalidTemplate { kind, index }
}

// =============================================================================
// Configuration
// =============================================================================

/// Engine construction options.
#[derive(Debug, Clone)]
pub struct Config {
    /// Segment delimiter. One of `/`, `:`, `|`.
    pub delimiter: u8,
    /// Initial transitions-table capacity, in nodes.
    pub capacity_hint: usize,
    /// Skip the per-search ASCII scan. The embedder must then guarantee that
    /// every searched path is pure ASCII; behavior on other input is
    /// undefined.
    pub assume_ascii: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            delimiter: b'/',
            capacity_hint: 64,
            assume_ascii: false,
        }
    }
}

impl Config {
    /// Check that this configuration is accepted by [`PathTrie::with_config`].
    pub fn validate(&self) -> Result<()> {
        match self.delimiter {
            b'/' | b':' | b'|' => Ok(()),
            other => Err(TrieError::InvalidDelimiter(other as char)),
        }
    }
}

// =============================================================================
// Instruction stream
// =============================================================================
//
// Param-bearing edges carry a linear program in a shared append-only `u32`
// buffer. Each word is [operand:24][opcode:8]:
//
//   END                            one word; program succeeded
//   MATCH_LITERAL[ch]              one word; consume exactly byte `ch`
//   MATCH_LITERAL_SEQ[len] [off]   two words; consume `len` bytes equal to
//                                  literal_pool[off..off+len]
//   CAPTURE_UNTIL[stop] [ordinal]  two words; consume up to `stop` or end of
//                                  input, record [start,end) at capture
//                                  slot `ordinal`
//
// Programs are referenced by their start offset and always end with END.

const OP_MASK: u32 = 0xFF;
const OPERAND_SHIFT: u32 = 8;

const OP_END: u32 = 0;
const OP_MATCH_LITERAL: u32 = 1;
const OP_MATCH_LITERAL_SEQ: u32 = 2;
const OP_CAPTURE_UNTIL: u32 = 3;

/// `END` carries no operand, so the whole word is the opcode.
const END_WORD: u32 = OP_END;

// Recognized program shapes. The search VM dispatches the two common shapes
// without the per-op interpreter loop; observable behavior is identical.
const SHAPE_GENERIC: u8 = 0;
/// `CAPTURE_UNTIL(delimiter); END`: a whole-segment parameter like `/{id}`.
const SHAPE_CAPTURE_TO_DELIMITER: u8 = 1;
/// `CAPTURE_UNTIL(sep); MATCH_LITERAL(sep); CAPTURE_UNTIL(delimiter); END`:
/// the `{name}.{ext}` shape.
const SHAPE_CAPTURE_SEP_CAPTURE: u8 = 2;

fn classify_program(words: &[u32], delimiter: u8) -> u8 {
    if words.len() == 3
        && words[0] & OP_MASK == OP_CAPTURE_UNTIL
        && (words[0] >> OPERAND_SHIFT) as u8 == delimiter
        && words[2] == END_WORD
    {
        return SHAPE_CAPTURE_TO_DELIMITER;
    }
    if words.len() == 6
        && words[0] & OP_MASK == OP_CAPTURE_UNTIL
        && words[2] & OP_MASK == OP_MATCH_LITERAL
        && words[0] >> OPERAND_SHIFT == words[2] >> OPERAND_SHIFT
        && words[3] & OP_MASK == OP_CAPTURE_UNTIL
        && (words[3] >> OPERAND_SHIFT) as u8 == delimiter
        && words[5] == END_WORD
    {
        return SHAPE_CAPTURE_SEP_CAPTURE;
    }
    SHAPE_GENERIC
}

// =============================================================================
// Node arena
// =============================================================================
//
// Nodes live in an append-only `Vec<Node>`; index 0 is a sentinel and index 1
// is the root. Indices are never reused and nodes are never relocated, so a
// node index stays valid for the lifetime of the engine (`delete` only
// tombstones). Static transitions for node N occupy the 128-slot window
// [N*128, (N+1)*128) of one shared buffer; slot value 0 means "no edge".

const TRANS_WIDTH: usize = 128;
const MAX_PARAM_SLOTS: usize = 4;
const ROOT: u32 = 1;

const FLAG_TERMINAL: u8 = 1 << 0;
const FLAG_HAS_PARAM: u8 = 1 << 1;
const FLAG_HAS_WILDCARD: u8 = 1 << 2;

#[derive(Clone, Copy)]
struct Node {
    flags: u8,
    /// Used entries of `programs`/`children`/`shapes`.
    param_slots: u8,
    /// Per-slot program shape (fast-path dispatch tag).
    shapes: [u8; MAX_PARAM_SLOTS],
    /// Index into the values arena; 0 = none.
    value: u32,
    /// Window into the parameter key pool, set on terminals.
    keys_start: u32,
    keys_len: u16,
    /// Per-slot program start offsets into the instruction stream.
    programs: [u32; MAX_PARAM_SLOTS],
    /// Per-slot destination nodes.
    children: [u32; MAX_PARAM_SLOTS],
    /// Trailing-wildcard destination; 0 = none.
    wildcard: u32,
}

impl Node {
    const EMPTY: Node = Node {
        flags: 0,
        param_slots: 0,
        shapes: [SHAPE_GENERIC; MAX_PARAM_SLOTS],
        value: 0,
        keys_start: 0,
        keys_len: 0,
        programs: [0; MAX_PARAM_SLOTS],
        children: [0; MAX_PARAM_SLOTS],
        wildcard: 0,
    };

    #[inline]
    fn is_terminal(&self) -> bool {
        self.flags & FLAG_TERMINAL != 0
    }

    #[inline]
    fn has_params(&self) -> bool {
        self.flags & FLAG_HAS_PARAM != 0
    }
}

// =============================================================================
// Template pieces
// =============================================================================

/// A parsed template piece. Static bytes descend one trie level each; a
/// program covers the param-bearing tail of one segment; the wildcard is
/// always last.
enum Piece {
    Byte(u8),
    Program(Vec<u32>),
    Wildcard,
}

// =============================================================================
// PathTrie
// =============================================================================

/// A path-template matching engine.
///
/// Features:
/// - Index-addressed node arena with one shared 128-wide ASCII transitions
///   table
/// - Per-edge instruction programs for parameters, with slot-order priority
///   and up to 4 variants per node
/// - Zero-allocation search writing capture ranges into a caller-owned buffer
/// - Tombstone deletes and an irreversible freeze for lock-free readers
#[derive(Clone)]
pub struct PathTrie<V> {
    delimiter: u8,
    assume_ascii: bool,
    frozen: bool,

    // === Trie structure ===
    nodes: Vec<Node>,
    /// Static transitions; node N owns slots [N*128, (N+1)*128).
    transitions: Vec<u32>,

    // === Param-edge programs ===
    instrs: Vec<u32>,
    literal_pool: Vec<u8>,

    // === Terminal payloads ===
    /// Index 0 is reserved so that `Node::value == 0` means "none".
    values: Vec<Option<V>>,
    /// Parameter names, appended per terminal in declaration order.
    key_pool: Vec<Box<str>>,

    /// Exact template -> terminal node, used by `delete` and duplicate
    /// detection. Dropped by `finalize(_, drop_intern_map = true)`.
    templates: Option<FxHashMap<Box<str>, u32>>,

    /// Live (non-tombstoned) template count.
    count: usize,
    /// Highest parameter count ever inserted; drives [`Self::required_caps`].
    max_params: u32,
}

/// Reusable search output. All fields are reset at the start of every
/// [`PathTrie::search`] call.
///
/// The matched payload is not stored here (it would borrow the engine); fetch
/// it with [`PathTrie::value`] using `node_index`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchResult {
    pub found: bool,
    /// Terminal node of the matched template; stable for the engine lifetime.
    pub node_index: u32,
    /// Number of `[start, end)` pairs written to the capture buffer.
    pub param_count: u32,
    /// Byte range consumed by a trailing wildcard, if one matched.
    pub wildcard: Option<(u32, u32)>,
}

impl MatchResult {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// An assembled match returned by the allocating [`PathTrie::find`]
/// convenience wrapper.
#[derive(Debug)]
pub struct Match<'t, 'p, V> {
    pub value: &'t V,
    pub node_index: u32,
    /// `(name, captured substring)` in template declaration order.
    pub params: Vec<(&'t str, &'p str)>,
    /// Path tail consumed by a trailing wildcard, if any.
    pub wildcard: Option<&'p str>,
}

impl<V> PathTrie<V> {
    /// Create an engine with the default configuration (`/` delimiter).
    pub fn new() -> Self {
        Self::with_config(Config::default()).expect("default config is valid")
    }

    pub fn with_config(config: Config) -> Result<Self> {
        config.validate()?;
        let cap = config.capacity_hint.max(2);
        let mut nodes = Vec::with_capacity(cap);
        nodes.resize(2, Node::EMPTY); // sentinel at 0, root at 1
        Ok(Self {
            delimiter: config.delimiter,
            assume_ascii: config.assume_ascii,
            frozen: false,
            nodes,
            transitions: vec![0; cap * TRANS_WIDTH],
            instrs: Vec::new(),
            literal_pool: Vec::new(),
            values: vec![None], // value index 0 = none
            key_pool: Vec::new(),
            templates: Some(FxHashMap::default()),
            count: 0,
            max_params: 0,
        })
    }

    /// Number of live (non-deleted) templates.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Configured delimiter byte.
    #[inline]
    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Number of allocated nodes, the sentinel excluded. Never decreases.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Highest parameter count across all templates ever inserted.
    #[inline]
    pub fn max_params(&self) -> usize {
        self.max_params as usize
    }

    /// Minimum capture-buffer length accepted by [`Self::search`]
    /// (`2 * max_params`).
    #[inline]
    pub fn required_caps(&self) -> usize {
        self.max_params as usize * 2
    }

    /// Approximate heap usage of all pools, in bytes.
    pub fn memory_usage(&self) -> usize {
        let map = self.templates.as_ref().map_or(0, |m| {
            m.capacity() * (std::mem::size_of::<(Box<str>, u32)>() + 8)
                + m.keys().map(|k| k.len()).sum::<usize>()
        });
        self.nodes.capacity() * std::mem::size_of::<Node>()
            + self.transitions.capacity() * 4
            + self.instrs.capacity() * 4
            + self.literal_pool.capacity()
            + self.values.capacity() * std::mem::size_of::<Option<V>>()
            + self.key_pool.capacity() * std::mem::size_of::<Box<str>>()
            + self.key_pool.iter().map(|k| k.len()).sum::<usize>()
            + map
    }

    pub fn shrink_to_fit(&mut self) {
        self.nodes.shrink_to_fit();
        self.transitions.shrink_to_fit();
        self.instrs.shrink_to_fit();
        self.literal_pool.shrink_to_fit();
        self.values.shrink_to_fit();
        self.key_pool.shrink_to_fit();
        if let Some(map) = &mut self.templates {
            map.shrink_to_fit();
        }
    }

    /// Payload of a terminal node, typically `out.node_index` after a
    /// successful search. `None` for tombstoned or non-terminal nodes.
    #[inline]
    pub fn value(&self, node_index: u32) -> Option<&V> {
        let n = self.nodes.get(node_index as usize)?;
        self.values.get(n.value as usize)?.as_ref()
    }

    /// Parameter names of a terminal node, in declaration order.
    pub fn param_keys(&self, node_index: u32) -> Vec<&str> {
        let Some(n) = self.nodes.get(node_index as usize) else {
            return Vec::new();
        };
        self.key_pool[n.keys_start as usize..][..n.keys_len as usize]
            .iter()
            .map(|k| k.as_ref())
            .collect()
    }

    // === Node allocation ===

    fn alloc_node(&mut self) -> u32 {
        let idx = self.nodes.len();
        debug_assert!(idx <= u32::MAX as usize);
        self.nodes.push(Node::EMPTY);
        // The transitions buffer must always cover node_count * 128 slots.
        let needed = self.nodes.len() * TRANS_WIDTH;
        if self.transitions.len() < needed {
            let mut grown = self.transitions.len();
            while grown < needed {
                grown *= 2;
            }
            self.transitions.resize(grown, 0);
        }
        idx as u32
    }

    #[inline]
    fn static_child(&self, node: u32, byte: u8) -> u32 {
        debug_assert!(byte < 0x80);
        self.transitions[node as usize * TRANS_WIDTH + byte as usize]
    }

    // === Template parsing and program emission ===

    fn parse_template<'t>(&mut self, template: &'t str) -> Result<(Vec<Piece>, Vec<&'t str>)> {
        use TemplateErrorKind::*;

        let bytes = template.as_bytes();
        if bytes.first() != Some(&self.delimiter) {
            return Err(template_err(MissingLeadingDelimiter, 0));
        }

        let mut pieces = Vec::with_capacity(bytes.len());
        let mut names: Vec<&str> = Vec::new();
        let mut i = 0usize;
        // '*' is only legal directly after an unescaped delimiter.
        let mut after_plain_delimiter = false;

        while i < bytes.len() {
            let b = bytes[i];
            match b {
                _ if b >= 0x80 => return Err(template_err(NonAscii, i)),
                b'\\' => {
                    let Some(&lit) = bytes.get(i + 1) else {
                        return Err(template_err(TrailingEscape, i));
                    };
                    if lit >= 0x80 {
                        return Err(template_err(NonAscii, i + 1));
                    }
                    pieces.push(Piece::Byte(lit));
                    after_plain_delimiter = false;
                    i += 2;
                }
                b'}' => return Err(template_err(StrayRBrace, i)),
                b'*' => {
                    if i + 1 != bytes.len() || !after_plain_delimiter {
                        return Err(template_err(WildcardNotTrailing, i));
                    }
                    pieces.push(Piece::Wildcard);
                    i += 1;
                }
                b'{' => {
                    let words = self.compile_segment(template, &mut i, &mut names)?;
                    pieces.push(Piece::Program(words));
                    after_plain_delimiter = false;
                }
                _ => {
                    after_plain_delimiter = b == self.delimiter;
                    pieces.push(Piece::Byte(b));
                    i += 1;
                }
            }
        }
        Ok((pieces, names))
    }

    /// Emit the instruction program for one param-bearing segment tail.
    ///
    /// On entry `*i` points at the opening `{`; on exit it points at the
    /// segment-terminating delimiter (or the end of the template). Literal
    /// runs of two or more bytes go through the literal pool; the pool and
    /// instruction buffers may grow even if the template later fails, which
    /// is harmless and not observable.
    fn compile_segment<'t>(
        &mut self,
        template: &'t str,
        i: &mut usize,
        names: &mut Vec<&'t str>,
    ) -> Result<Vec<u32>> {
        use TemplateErrorKind::*;

        let bytes = template.as_bytes();
        let d = self.delimiter;
        let mut words = Vec::with_capacity(8);
        loop {
            debug_assert_eq!(bytes[*i], b'{');
            let open = *i;
            let name_start = open + 1;
            let mut j = name_start;
            while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
                j += 1;
            }
            if j == bytes.len() {
                return Err(template_err(UnclosedBrace, open));
            }
            if bytes[j] != b'}' {
                return Err(template_err(InvalidParamChar, j));
            }
            if j == name_start {
                return Err(template_err(EmptyParamName, open));
            }
            let name = &template[name_start..j];
            if names.iter().any(|n| *n == name) {
                return Err(template_err(DuplicateParamName, name_start));
            }
            let ordinal = names.len() as u32;
            names.push(name);
            *i = j + 1;

            // The capture's stop byte is the first literal byte that follows
            // within the segment, or the delimiter if none does.
            if *i >= bytes.len() || bytes[*i] == d {
                words.push(OP_CAPTURE_UNTIL | (u32::from(d) << OPERAND_SHIFT));
                words.push(ordinal);
                break;
            }
            if bytes[*i] == b'{' {
                return Err(template_err(AdjacentParams, *i));
            }

            // Collect the escape-resolved literal run up to the next '{',
            // the delimiter, or the end of the template.
            let mut run = Vec::new();
            while *i < bytes.len() {
                let b = bytes[*i];
                if b == d || b == b'{' {
                    break;
                }
                match b {
                    b'\\' => {
                        let Some(&lit) = bytes.get(*i + 1) else {
                            return Err(template_err(TrailingEscape, *i));
                        };
                        if lit >= 0x80 {
                            return Err(template_err(NonAscii, *i + 1));
                        }
                        run.push(lit);
                        *i += 2;
                    }
                    b'}' => return Err(template_err(StrayRBrace, *i)),
                    b'*' => return Err(template_err(WildcardNotTrailing, *i)),
                    _ if b >= 0x80 => return Err(template_err(NonAscii, *i)),
                    _ => {
                        run.push(b);
                        *i += 1;
                    }
                }
            }

            words.push(OP_CAPTURE_UNTIL | (u32::from(run[0]) << OPERAND_SHIFT));
            words.push(ordinal);
            if run.len() == 1 {
                words.push(OP_MATCH_LITERAL | (u32::from(run[0]) << OPERAND_SHIFT));
            } else {
                let off = self.literal_pool.len() as u32;
                self.literal_pool.extend_from_slice(&run);
                words.push(OP_MATCH_LITERAL_SEQ | ((run.len() as u32) << OPERAND_SHIFT));
                words.push(off);
            }

            if *i >= bytes.len() || bytes[*i] == d {
                break;
            }
            debug_assert_eq!(bytes[*i], b'{');
        }
        words.push(OP_END);
        Ok(words)
    }

    /// Word-for-word program identity, literal-pool offsets included. A
    /// freshly-emitted program that appends new pool bytes therefore never
    /// aliases an older sequence program; only offset-free programs dedupe.
    fn program_equals(&self, start: u32, words: &[u32]) -> bool {
        let start = start as usize;
        if start + words.len() > self.instrs.len() {
            return false;
        }
        self.instrs[start..start + words.len()] == *words
    }

    fn find_identical_slot(&self, node: u32, words: &[u32]) -> Option<usize> {
        let n = &self.nodes[node as usize];
        (0..n.param_slots as usize).find(|&s| self.program_equals(n.programs[s], words))
    }

    /// Dry walk over the existing structure. Detects `TooManyParamVariants`
    /// and terminal collisions before `build` mutates anything; once the walk
    /// leaves existing nodes every later node is fresh and cannot conflict.
    fn preflight(&self, pieces: &[Piece]) -> Result<()> {
        let mut cur = ROOT;
        for piece in pieces {
            match piece {
                Piece::Byte(c) => {
                    let next = self.static_child(cur, *c);
                    if next == 0 {
                        return Ok(());
                    }
                    cur = next;
                }
                Piece::Program(words) => match self.find_identical_slot(cur, words) {
                    Some(slot) => cur = self.nodes[cur as usize].children[slot],
                    None => {
                        if self.nodes[cur as usize].param_slots as usize == MAX_PARAM_SLOTS {
                            return Err(TrieError::TooManyParamVariants);
                        }
                        return Ok(());
                    }
                },
                Piece::Wildcard => {
                    let w = self.nodes[cur as usize].wildcard;
                    if w == 0 {
                        return Ok(());
                    }
                    cur = w;
                }
            }
        }
        if self.nodes[cur as usize].is_terminal() {
            return Err(TrieError::Duplicate);
        }
        Ok(())
    }

    /// Walk the pieces, allocating nodes and edges as needed. Returns the
    /// terminal node. `preflight` must have accepted the same pieces.
    fn build(&mut self, pieces: &[Piece]) -> u32 {
        let mut cur = ROOT;
        for piece in pieces {
            match piece {
                Piece::Byte(c) => {
                    let next = self.static_child(cur, *c);
                    cur = if next != 0 {
                        next
                    } else {
                        let child = self.alloc_node();
                        self.transitions[cur as usize * TRANS_WIDTH + *c as usize] = child;
                        child
                    };
                }
                Piece::Program(words) => {
                    cur = match self.find_identical_slot(cur, words) {
                        Some(slot) => self.nodes[cur as usize].children[slot],
                        None => {
                            let start = self.instrs.len() as u32;
                            self.instrs.extend_from_slice(words);
                            let shape = classify_program(words, self.delimiter);
                            let child = self.alloc_node();
                            let n = &mut self.nodes[cur as usize];
                            let slot = n.param_slots as usize;
                            debug_assert!(slot < MAX_PARAM_SLOTS, "admitted by preflight");
                            n.programs[slot] = start;
                            n.children[slot] = child;
                            n.shapes[slot] = shape;
                            n.param_slots += 1;
                            n.flags |= FLAG_HAS_PARAM;
                            child
                        }
                    };
                }
                Piece::Wildcard => {
                    let w = self.nodes[cur as usize].wildcard;
                    cur = if w != 0 {
                        w
                    } else {
                        let child = self.alloc_node();
                        let n = &mut self.nodes[cur as usize];
                        n.wildcard = child;
                        n.flags |= FLAG_HAS_WILDCARD;
                        child
                    };
                }
            }
        }
        cur
    }

    /// Register a template. The payload is returned by [`Self::value`] for
    /// the terminal node reported on a successful search.
    ///
    /// A failed insert leaves no observable change: templates are fully
    /// validated, and terminal collisions and variant overflow detected,
    /// before any node or edge is created.
    pub fn insert(&mut self, template: &str, value: V) -> Result<()> {
        if self.frozen {
            return Err(TrieError::Frozen);
        }
        if let Some(map) = &self.templates {
            if map.contains_key(template) {
                return Err(TrieError::Duplicate);
            }
        }
        let (pieces, names) = self.parse_template(template)?;
        self.preflight(&pieces)?;

        let node = self.build(&pieces);
        debug_assert!(
            !self.nodes[node as usize].is_terminal(),
            "terminal collisions are rejected by preflight"
        );

        let value_index = self.values.len() as u32;
        self.values.push(Some(value));
        let keys_start = self.key_pool.len() as u32;
        for name in &names {
            self.key_pool.push((*name).into());
        }
        {
            let n = &mut self.nodes[node as usize];
            n.flags |= FLAG_TERMINAL;
            n.value = value_index;
            n.keys_start = keys_start;
            n.keys_len = names.len() as u16;
        }
        self.max_params = self.max_params.max(names.len() as u32);
        self.count += 1;
        if let Some(map) = &mut self.templates {
            map.insert(template.into(), node);
        }
        debug!(template, node, params = names.len(), "template registered");
        Ok(())
    }

    /// Insert a batch of `(template, value)` rows. Duplicates within the
    /// batch, and against already-registered templates, are rejected before
    /// anything is inserted; other failures abort at the offending row.
    pub fn insert_batch<'a, I>(&mut self, entries: I) -> std::result::Result<(), BatchError>
    where
        I: IntoIterator<Item = (&'a str, V)>,
    {
        let entries: Vec<(&str, V)> = entries.into_iter().collect();
        let mut seen = FxHashSet::default();
        for (template, _) in &entries {
            if !seen.insert(*template) {
                return Err(BatchError {
                    template: (*template).into(),
                    error: TrieError::Duplicate,
                });
            }
            if let Some(map) = &self.templates {
                if map.contains_key(*template) {
                    return Err(BatchError {
                        template: (*template).into(),
                        error: TrieError::Duplicate,
                    });
                }
            }
        }
        for (template, value) in entries {
            self.insert(template, value).map_err(|error| BatchError {
                template: template.into(),
                error,
            })?;
        }
        Ok(())
    }

    /// Like [`Self::insert_batch`] for map-shaped input. Rows are sorted by
    /// template first, so param-variant priority does not depend on the
    /// map's iteration order.
    pub fn insert_batch_from_map<I>(&mut self, entries: I) -> std::result::Result<(), BatchError>
    where
        I: IntoIterator<Item = (String, V)>,
    {
        let mut entries: Vec<(String, V)> = entries.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(map) = &self.templates {
            for (template, _) in &entries {
                if map.contains_key(template.as_str()) {
                    return Err(BatchError {
                        template: template.clone(),
                        error: TrieError::Duplicate,
                    });
                }
            }
        }
        for (template, value) in entries {
            self.insert(&template, value)
                .map_err(|error| BatchError { template, error })?;
        }
        Ok(())
    }

    /// Remove a template, returning its payload. Tombstone-only: the node
    /// and its edges stay, only the terminal state is cleared. Absent
    /// templates are a no-op (`Ok(None)`).
    pub fn delete(&mut self, template: &str) -> Result<Option<V>> {
        if self.frozen {
            return Err(TrieError::Frozen);
        }
        let map = self.templates.as_mut().ok_or(TrieError::Unavailable)?;
        let Some(node) = map.remove(template) else {
            return Ok(None);
        };
        let n = &mut self.nodes[node as usize];
        debug_assert!(n.is_terminal(), "intern map only holds terminals");
        n.flags &= !FLAG_TERMINAL;
        let value_index = n.value as usize;
        n.value = 0;
        n.keys_start = 0;
        n.keys_len = 0;
        self.count -= 1;
        let old = self.values[value_index].take();
        debug!(template, node, "template removed");
        Ok(old)
    }

    /// Irreversibly freeze mutation and/or drop the template intern map.
    ///
    /// After `freeze`, `insert` and `delete` fail with [`TrieError::Frozen`]
    /// and the engine may be shared across threads without synchronization
    /// (all search state is caller-owned). Dropping the intern map releases
    /// its memory; `delete` then fails with [`TrieError::Unavailable`].
    pub fn finalize(&mut self, freeze: bool, drop_intern_map: bool) {
        if drop_intern_map {
            self.templates = None;
        }
        if freeze {
            self.frozen = true;
            self.shrink_to_fit();
        }
        debug!(
            frozen = self.frozen,
            interned = self.templates.is_some(),
            "finalize"
        );
    }

    // =========================================================================
    // Search VM
    // =========================================================================

    /// Match `path` against the registered templates.
    ///
    /// `caps` must hold at least [`Self::required_caps`] slots; capture `i`
    /// of the winning template lands in `caps[2*i..2*i+2]` as a `[start, end)`
    /// byte range. `out` is fully reset before the walk. Returns `false` for
    /// non-matches, non-ASCII input (unless `assume_ascii`), and an
    /// undersized capture buffer; it never allocates and never fails
    /// observably.
    ///
    /// Priority at every position: static edge, then param slots in insertion
    /// order, then the trailing wildcard. There is no backtracking across a
    /// taken static edge or a succeeded param slot.
    pub fn search(&self, path: &[u8], caps: &mut [u32], out: &mut MatchResult) -> bool {
        out.reset();
        if !self.assume_ascii && !path.is_ascii() {
            return false;
        }
        if caps.len() < self.required_caps() {
            return false;
        }

        let mut node = ROOT;
        let mut cursor = 0usize;
        let mut cap_written = 0u32;

        'walk: loop {
            if cursor == path.len() {
                let n = &self.nodes[node as usize];
                if n.is_terminal() {
                    self.fill(out, node, cap_written, None);
                    return true;
                }
                // A trailing wildcard accepts the empty tail after its
                // delimiter.
                if n.wildcard != 0 && self.nodes[n.wildcard as usize].is_terminal() {
                    self.fill(out, n.wildcard, cap_written, Some((cursor, cursor)));
                    return true;
                }
                return false;
            }

            let c = path[cursor];
            // 1. Static edge.
            let next = self.transitions[node as usize * TRANS_WIDTH + c as usize];
            if next != 0 {
                node = next;
                cursor += 1;
                continue;
            }

            let n = &self.nodes[node as usize];
            // 2. Param slots, insertion order. A failed slot leaves
            //    `cap_written` untouched, which is the whole rewind.
            if n.has_params() {
                for slot in 0..n.param_slots as usize {
                    if let Some((new_cursor, written)) =
                        self.run_program(n.programs[slot], n.shapes[slot], path, cursor, caps)
                    {
                        node = n.children[slot];
                        cursor = new_cursor;
                        cap_written = written;
                        continue 'walk;
                    }
                }
            }

            // 3. Trailing wildcard, only onto a live terminal.
            if n.wildcard != 0 && self.nodes[n.wildcard as usize].is_terminal() {
                self.fill(out, n.wildcard, cap_written, Some((cursor, path.len())));
                return true;
            }
            return false;
        }
    }

    #[inline]
    fn fill(
        &self,
        out: &mut MatchResult,
        node: u32,
        cap_written: u32,
        wild: Option<(usize, usize)>,
    ) {
        debug_assert_eq!(
            cap_written,
            u32::from(self.nodes[node as usize].keys_len),
            "capture count must equal the terminal's key count"
        );
        out.found = true;
        out.node_index = node;
        out.param_count = cap_written;
        out.wildcard = wild.map(|(s, e)| (s as u32, e as u32));
    }

    /// Execute one param-edge program on `path[cursor..]`. Returns the new
    /// cursor and capture high-water mark, or `None` on mismatch.
    #[inline]
    fn run_program(
        &self,
        start: u32,
        shape: u8,
        path: &[u8],
        cursor: usize,
        caps: &mut [u32],
    ) -> Option<(usize, u32)> {
        match shape {
            SHAPE_CAPTURE_TO_DELIMITER => {
                let idx = self.instrs[start as usize + 1] as usize;
                let mut end = cursor;
                while end < path.len() && path[end] != self.delimiter {
                    end += 1;
                }
                caps[2 * idx] = cursor as u32;
                caps[2 * idx + 1] = end as u32;
                Some((end, idx as u32 + 1))
            }
            SHAPE_CAPTURE_SEP_CAPTURE => {
                let p = start as usize;
                let sep = (self.instrs[p] >> OPERAND_SHIFT) as u8;
                let idx0 = self.instrs[p + 1] as usize;
                let idx1 = self.instrs[p + 4] as usize;
                let mut end0 = cursor;
                while end0 < path.len() && path[end0] != sep {
                    end0 += 1;
                }
                if end0 == path.len() {
                    return None; // separator literal missing
                }
                let from1 = end0 + 1;
                let mut end1 = from1;
                while end1 < path.len() && path[end1] != self.delimiter {
                    end1 += 1;
                }
                caps[2 * idx0] = cursor as u32;
                caps[2 * idx0 + 1] = end0 as u32;
                caps[2 * idx1] = from1 as u32;
                caps[2 * idx1 + 1] = end1 as u32;
                Some((end1, idx1 as u32 + 1))
            }
            _ => self.exec_generic(start, path, cursor, caps),
        }
    }

    fn exec_generic(
        &self,
        start: u32,
        path: &[u8],
        mut cursor: usize,
        caps: &mut [u32],
    ) -> Option<(usize, u32)> {
        let mut pc = start as usize;
        let mut written = 0u32;
        loop {
            let word = self.instrs[pc];
            match word & OP_MASK {
                OP_END => return Some((cursor, written)),
                OP_MATCH_LITERAL => {
                    let ch = (word >> OPERAND_SHIFT) as u8;
                    if cursor >= path.len() || path[cursor] != ch {
                        return None;
                    }
                    cursor += 1;
                    pc += 1;
                }
                OP_MATCH_LITERAL_SEQ => {
                    let len = (word >> OPERAND_SHIFT) as usize;
                    let off = self.instrs[pc + 1] as usize;
                    let lit = &self.literal_pool[off..off + len];
                    if path.len() - cursor < len || &path[cursor..cursor + len] != lit {
                        return None;
                    }
                    cursor += len;
                    pc += 2;
                }
                OP_CAPTURE_UNTIL => {
                    let stop = (word >> OPERAND_SHIFT) as u8;
                    let idx = self.instrs[pc + 1] as usize;
                    let from = cursor;
                    while cursor < path.len() && path[cursor] != stop {
                        cursor += 1;
                    }
                    caps[2 * idx] = from as u32;
                    caps[2 * idx + 1] = cursor as u32;
                    written = idx as u32 + 1;
                    pc += 2;
                }
                other => unreachable!("corrupt instruction stream: opcode {other}"),
            }
        }
    }

    /// Allocating convenience wrapper around [`Self::search`]: one call,
    /// params assembled as `(name, substring)` pairs.
    pub fn find<'t, 'p>(&'t self, path: &'p str) -> Option<Match<'t, 'p, V>> {
        let mut caps = vec![0u32; self.required_caps()];
        let mut out = MatchResult::default();
        if !self.search(path.as_bytes(), &mut caps, &mut out) {
            return None;
        }
        let n = &self.nodes[out.node_index as usize];
        let value = self.values[n.value as usize]
            .as_ref()
            .expect("terminal nodes hold a live payload");
        let keys = &self.key_pool[n.keys_start as usize..][..n.keys_len as usize];
        let params = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let s = caps[2 * i] as usize;
                let e = caps[2 * i + 1] as usize;
                (key.as_ref(), &path[s..e])
            })
            .collect();
        let wildcard = out.wildcard.map(|(s, e)| &path[s as usize..e as usize]);
        Some(Match {
            value,
            node_index: out.node_index,
            params,
            wildcard,
        })
    }

    // =========================================================================
    // Prefix queries
    // =========================================================================

    fn walk_static(&self, bytes: &[u8]) -> Option<u32> {
        let mut node = ROOT;
        for &b in bytes {
            if b >= 0x80 {
                return None;
            }
            let next = self.static_child(node, b);
            if next == 0 {
                return None;
            }
            node = next;
        }
        Some(node)
    }

    /// True iff `prefix` is fully consumable over static transitions alone.
    pub fn is_prefix(&self, prefix: &[u8]) -> bool {
        self.walk_static(prefix).is_some()
    }

    /// Payloads of every live terminal beneath `prefix`, collected over
    /// static, param, and wildcard edges. Allocates; not a hot-path call.
    pub fn prefix_search(&self, prefix: &[u8]) -> Vec<&V> {
        let Some(start) = self.walk_static(prefix) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            let n = &self.nodes[node as usize];
            if n.is_terminal() {
                if let Some(v) = self.values[n.value as usize].as_ref() {
                    found.push(v);
                }
            }
            // Push in reverse visit order: statics ascending, then params in
            // slot order, then the wildcard.
            if n.wildcard != 0 {
                stack.push(n.wildcard);
            }
            for slot in (0..n.param_slots as usize).rev() {
                stack.push(n.children[slot]);
            }
            let base = node as usize * TRANS_WIDTH;
            for byte in (0..TRANS_WIDTH).rev() {
                let child = self.transitions[base + byte];
                if child != 0 {
                    stack.push(child);
                }
            }
        }
        found
    }
}

impl<V> Default for PathTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for PathTrie<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathTrie")
            .field("templates", &self.count)
            .field("nodes", &self.node_count())
            .field("frozen", &self.frozen)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================


#[cfg(test)]
mod proptests;
