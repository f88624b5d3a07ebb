//! Simulated values and memory.
//!
//! Memory is a set of objects, one per alloca execution, global or heap
//! allocation. An object is not a byte array: it maps field paths to typed
//! leaf values, so a struct stored whole can be read back field by field
//! (and the other way round) without committing to a byte layout. A pointer
//! is an object plus a field path; pointer casts leave it untouched.
//!
//! Pointers that travel through integers (`ptrtoint`, the 64-bit FIFO
//! channel words) are interned: each distinct pointer gets a stable word,
//! and `inttoptr` of that word yields the same pointer again.

use std::collections::BTreeMap;
use std::fmt;

use rustc_hash::FxHashMap;
use strand_codegen::lir::{mask_to_width, sign_extend, Type};

use crate::SimError;

/// The location of a value: an object and a field path inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr {
    pub object: u32,
    pub path: Vec<u32>,
}

impl Addr {
    pub fn field(&self, index: u32) -> Addr {
        let mut path = self.path.clone();
        path.push(index);
        Addr {
            object: self.object,
            path,
        }
    }
}

/// A simulated pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ptr {
    Null,
    Mem(Addr),
    Function(String),
    /// `blockaddress(@function, %block)`.
    Block { function: String, block: String },
    /// A runtime channel handle.
    Chan(u32),
    /// A runtime select descriptor handle.
    Select(u32),
    /// An integer that was turned into a pointer without ever being one.
    Raw(u64),
}

/// A simulated first-class value.
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Int { bits: u32, value: u64 },
    F32(f32),
    F64(f64),
    Ptr(Ptr),
    Struct(Vec<Val>),
    Undef,
}

impl Val {
    pub fn int(bits: u32, value: i64) -> Val {
        Val::Int {
            bits,
            value: mask_to_width(value as u64, bits),
        }
    }

    pub fn bool(value: bool) -> Val {
        Val::int(1, value as i64)
    }

    pub fn null() -> Val {
        Val::Ptr(Ptr::Null)
    }

    /// The zero value of `ty`.
    pub fn zero(ty: &Type) -> Val {
        match ty {
            Type::Int(bits) => Val::Int {
                bits: *bits,
                value: 0,
            },
            Type::F32 => Val::F32(0.0),
            Type::F64 => Val::F64(0.0),
            Type::Ptr(_) => Val::null(),
            Type::Struct(fields) => Val::Struct(fields.iter().map(Val::zero).collect()),
            Type::Void | Type::Func(_) => Val::Undef,
        }
    }

    /// The integer as a two's complement signed value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Val::Int { bits, value } => Some(sign_extend(*value, *bits)),
            _ => None,
        }
    }

    /// The integer zero-extended.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Val::Int { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_u64().map(|v| v != 0)
    }

    pub fn as_ptr(&self) -> Option<&Ptr> {
        match self {
            Val::Ptr(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Int { bits: 1, value } => write!(f, "{}", *value != 0),
            Val::Int { bits, value } => write!(f, "{}", sign_extend(*value, *bits)),
            Val::F32(v) => write!(f, "{v}"),
            Val::F64(v) => write!(f, "{v}"),
            Val::Ptr(p) => write!(f, "{p:?}"),
            Val::Struct(fields) => {
                f.write_str("{ ")?;
                for (i, v) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str(" }")
            }
            Val::Undef => f.write_str("undef"),
        }
    }
}

// ── Objects ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Object {
    cells: BTreeMap<Vec<u32>, Val>,
}

impl Object {
    /// Drop every cell at, below or above `path`.
    fn clear_overlapping(&mut self, path: &[u32]) {
        self.cells
            .retain(|p, _| !(p.starts_with(path) || path.starts_with(p)));
    }

    fn write(&mut self, path: Vec<u32>, value: Val) {
        match value {
            Val::Struct(fields) => {
                for (i, field) in fields.into_iter().enumerate() {
                    let mut sub = path.clone();
                    sub.push(i as u32);
                    self.write(sub, field);
                }
            }
            leaf => {
                self.cells.insert(path, leaf);
            }
        }
    }

    /// Read `path` as `ty`, assembling structs from their fields.
    fn read_typed(&self, path: &[u32], ty: &Type) -> Val {
        if let Type::Struct(fields) = ty {
            let vals = fields
                .iter()
                .enumerate()
                .map(|(i, f)| {
                    let mut sub = path.to_vec();
                    sub.push(i as u32);
                    self.read_typed(&sub, f)
                })
                .collect();
            return Val::Struct(vals);
        }
        self.cells.get(path).cloned().unwrap_or(Val::Undef)
    }

    /// Read `path` with no type at hand, assembling structs from whatever
    /// fields have been written.
    fn read_any(&self, path: &[u32]) -> Val {
        if let Some(v) = self.cells.get(path) {
            return v.clone();
        }
        let depth = path.len();
        let width = self
            .cells
            .keys()
            .filter(|p| p.len() > depth && p.starts_with(path))
            .map(|p| p[depth] + 1)
            .max();
        match width {
            Some(n) => Val::Struct(
                (0..n)
                    .map(|i| {
                        let mut sub = path.to_vec();
                        sub.push(i);
                        self.read_any(&sub)
                    })
                    .collect(),
            ),
            None => Val::Undef,
        }
    }
}

/// The object store.
#[derive(Debug)]
pub struct Memory {
    objects: Vec<Object>,
    word_of: FxHashMap<Ptr, u64>,
    ptr_of: FxHashMap<u64, Ptr>,
    next_word: u64,
}

impl Default for Memory {
    fn default() -> Self {
        Memory {
            objects: Vec::new(),
            word_of: FxHashMap::default(),
            ptr_of: FxHashMap::default(),
            next_word: 0x1000,
        }
    }
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an empty object and return a pointer to it.
    pub fn allocate(&mut self) -> Ptr {
        let object = self.objects.len() as u32;
        self.objects.push(Object::default());
        Ptr::Mem(Addr {
            object,
            path: Vec::new(),
        })
    }

    /// Number of objects ever allocated.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn object<'a>(&'a self, ptr: &'a Ptr) -> Result<(&'a Object, &'a [u32]), SimError> {
        match ptr {
            Ptr::Mem(addr) => self
                .objects
                .get(addr.object as usize)
                .map(|o| (o, addr.path.as_slice()))
                .ok_or_else(|| SimError::BadMemory(format!("dangling object {}", addr.object))),
            other => Err(SimError::BadMemory(format!("access through {other:?}"))),
        }
    }

    pub fn store(&mut self, ptr: &Ptr, value: Val) -> Result<(), SimError> {
        let addr = match ptr {
            Ptr::Mem(addr) => addr,
            other => return Err(SimError::BadMemory(format!("store through {other:?}"))),
        };
        let object = self
            .objects
            .get_mut(addr.object as usize)
            .ok_or_else(|| SimError::BadMemory(format!("dangling object {}", addr.object)))?;
        object.clear_overlapping(&addr.path);
        object.write(addr.path.clone(), value);
        Ok(())
    }

    /// Load a value of type `ty`.
    pub fn load(&self, ptr: &Ptr, ty: &Type) -> Result<Val, SimError> {
        let (object, path) = self.object(ptr)?;
        Ok(object.read_typed(path, ty))
    }

    /// Load whatever was stored at `ptr`.
    pub fn load_any(&self, ptr: &Ptr) -> Result<Val, SimError> {
        let (object, path) = self.object(ptr)?;
        Ok(object.read_any(path))
    }

    // ── Pointer/word interning ───────────────────────────────────────

    /// The integer form of `ptr`.
    pub fn ptr_to_word(&mut self, ptr: &Ptr) -> u64 {
        match ptr {
            Ptr::Null => 0,
            Ptr::Raw(word) => *word,
            other => {
                if let Some(word) = self.word_of.get(other) {
                    return *word;
                }
                let word = self.next_word;
                self.next_word += 16;
                self.word_of.insert(other.clone(), word);
                self.ptr_of.insert(word, other.clone());
                word
            }
        }
    }

    /// The pointer whose integer form is `word`.
    pub fn word_to_ptr(&self, word: u64) -> Ptr {
        if word == 0 {
            return Ptr::Null;
        }
        self.ptr_of.get(&word).cloned().unwrap_or(Ptr::Raw(word))
    }
}
