//! Component parameters.
//!
//! A [`Params`] bundle is a flat map from parameter name to a string value.
//! Keys are interned into dense 32-bit ids shared by every bundle that uses
//! the same [`KeyInterner`] (by default the process-wide one), so copying a
//! bundle or building prefix views never duplicates key text.
//!
//! # Example
//!
//! ```
//! use simcore::params::Params;
//!
//! let mut params = Params::new();
//! params.insert("cpu.freq", "2GHz");
//! params.insert("cpu.cores", "4");
//! params.insert("vec", "[1, 2, 3]");
//!
//! let cores: u32 = params.find("cpu.cores", 1).unwrap();
//! assert_eq!(cores, 4);
//! assert_eq!(params.find_array::<i32>("vec").unwrap(), vec![1, 2, 3]);
//!
//! let cpu = params.scoped("cpu");
//! assert_eq!(cpu.get_raw("freq"), Some("2GHz"));
//! ```

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{SimError, SimResult};
use crate::time::UnitAlgebra;

/// Dense id of an interned parameter key.
pub type KeyId = u32;

#[derive(Default)]
struct InternTable {
    ids: HashMap<Arc<str>, KeyId>,
    names: Vec<Arc<str>>,
}

impl InternTable {
    /// Copies the entries `view` has not seen yet. The table only grows, so
    /// a view is always a prefix of it.
    fn refresh(&self, view: &mut InternTable) {
        for name in &self.names[view.names.len()..] {
            let id = view.names.len() as KeyId;
            view.names.push(Arc::clone(name));
            view.ids.insert(Arc::clone(name), id);
        }
    }
}

static NEXT_INTERNER: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Per-thread copies of every interner this thread has read from.
    static VIEWS: RefCell<HashMap<u64, InternTable>> = RefCell::new(HashMap::new());
}

/// Maps parameter key strings to dense 32-bit ids.
///
/// Insertions take the write lock once per new key. Each thread keeps its
/// own copy of the keys it has seen, so looking up a known key takes no
/// lock at all.
pub struct KeyInterner {
    serial: u64,
    table: RwLock<InternTable>,
}

impl Default for KeyInterner {
    fn default() -> Self {
        Self {
            serial: NEXT_INTERNER.fetch_add(1, Ordering::Relaxed),
            table: RwLock::new(InternTable::default()),
        }
    }
}

static GLOBAL_INTERNER: Lazy<Arc<KeyInterner>> = Lazy::new(|| Arc::new(KeyInterner::new()));

impl KeyInterner {
    /// Creates an empty interner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` on this thread's view, refreshing it from the shared table
    /// first if `f` returns `None` on the stale view.
    fn with_view<T>(&self, f: impl Fn(&InternTable) -> Option<T>) -> Option<T> {
        VIEWS.with(|views| {
            let mut views = views.borrow_mut();
            let view = views.entry(self.serial).or_default();
            if let Some(found) = f(view) {
                return Some(found);
            }
            self.table.read().refresh(view);
            f(view)
        })
    }

    /// The process-wide interner.
    pub fn global() -> Arc<KeyInterner> {
        Arc::clone(&GLOBAL_INTERNER)
    }

    /// Returns the id of `key`, interning it on first use.
    pub fn intern(&self, key: &str) -> KeyId {
        if let Some(id) = self.lookup(key) {
            return id;
        }
        let mut table = self.table.write();
        if let Some(id) = table.ids.get(key) {
            return *id;
        }
        let id = table.names.len() as KeyId;
        let name: Arc<str> = Arc::from(key);
        table.names.push(Arc::clone(&name));
        table.ids.insert(name, id);
        id
    }

    /// Returns the id of `key` without interning it.
    pub fn lookup(&self, key: &str) -> Option<KeyId> {
        self.with_view(|view| view.ids.get(key).copied())
    }

    /// Returns the key text for an id.
    pub fn name(&self, id: KeyId) -> Option<Arc<str>> {
        self.with_view(|view| view.names.get(id as usize).cloned())
    }

    /// Number of keys this thread can resolve without locking.
    pub fn cached_len(&self) -> usize {
        VIEWS.with(|views| views.borrow().get(&self.serial).map_or(0, |view| view.names.len()))
    }

    /// Number of interned keys.
    pub fn len(&self) -> usize {
        self.table.read().names.len()
    }

    /// Returns true if nothing has been interned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for KeyInterner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyInterner").field("keys", &self.len()).finish()
    }
}

/// A value that can be parsed from, and written back to, a parameter string.
///
/// Parsing normalizes surrounding whitespace; integers additionally accept
/// `0x`/`0b`/`0o` prefixes. Writing always produces the canonical decimal
/// form, so `to_param(parse(s))` equals `s` up to that normalization.
pub trait ParamValue: Sized {
    /// Parses the value from its string form.
    fn parse_param(text: &str) -> Result<Self, String>;

    /// Renders the value as a parameter string.
    fn to_param(&self) -> String;
}

macro_rules! int_param {
    ($($ty:ty),*) => {$(
        impl ParamValue for $ty {
            fn parse_param(text: &str) -> Result<Self, String> {
                let text = text.trim();
                let (negative, body) = match text.strip_prefix('-') {
                    Some(rest) => (true, rest),
                    None => (false, text.strip_prefix('+').unwrap_or(text)),
                };
                let (radix, digits) = if let Some(d) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
                    (16, d)
                } else if let Some(d) = body.strip_prefix("0b").or_else(|| body.strip_prefix("0B")) {
                    (2, d)
                } else if let Some(d) = body.strip_prefix("0o").or_else(|| body.strip_prefix("0O")) {
                    (8, d)
                } else {
                    (10, body)
                };
                let signed = if negative { format!("-{}", digits) } else { digits.to_string() };
                <$ty>::from_str_radix(&signed, radix).map_err(|e| e.to_string())
            }

            fn to_param(&self) -> String {
                self.to_string()
            }
        }
    )*};
}

int_param!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

macro_rules! float_param {
    ($($ty:ty),*) => {$(
        impl ParamValue for $ty {
            fn parse_param(text: &str) -> Result<Self, String> {
                text.trim().parse::<$ty>().map_err(|e| e.to_string())
            }

            fn to_param(&self) -> String {
                self.to_string()
            }
        }
    )*};
}

float_param!(f32, f64);

impl ParamValue for bool {
    fn parse_param(text: &str) -> Result<Self, String> {
        match text.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" | "t" | "y" => Ok(true),
            "false" | "no" | "off" | "0" | "f" | "n" => Ok(false),
            other => Err(format!("'{}' is not a boolean", other)),
        }
    }

    fn to_param(&self) -> String {
        self.to_string()
    }
}

impl ParamValue for String {
    fn parse_param(text: &str) -> Result<Self, String> {
        Ok(text.to_string())
    }

    fn to_param(&self) -> String {
        self.clone()
    }
}

impl ParamValue for UnitAlgebra {
    fn parse_param(text: &str) -> Result<Self, String> {
        text.parse::<UnitAlgebra>().map_err(|e| e.to_string())
    }

    fn to_param(&self) -> String {
        self.to_string()
    }
}

/// Splits a bracketed list `[a, b, "c, d"]` into its trimmed elements.
///
/// A value without brackets is treated as a one-element list.
fn split_array(text: &str) -> Result<Vec<String>, String> {
    let trimmed = text.trim();
    let body = match (trimmed.strip_prefix('['), trimmed.ends_with(']')) {
        (Some(rest), true) => &rest[..rest.len() - 1],
        (None, false) => return Ok(vec![unquote(trimmed)]),
        _ => return Err(format!("unbalanced brackets in '{}'", text)),
    };
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut items = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in body.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                current.push(c);
            }
            (None, ',') => {
                items.push(unquote(current.trim()));
                current.clear();
            }
            (None, c) => current.push(c),
        }
    }
    if quote.is_some() {
        return Err(format!("unterminated quote in '{}'", text));
    }
    items.push(unquote(current.trim()));
    Ok(items)
}

fn unquote(text: &str) -> String {
    let bytes = text.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return text[1..text.len() - 1].to_string();
        }
    }
    text.to_string()
}

/// A bundle of string-valued parameters with typed accessors.
#[derive(Clone)]
pub struct Params {
    interner: Arc<KeyInterner>,
    entries: HashMap<KeyId, String>,
    allowed: Vec<HashSet<String>>,
}

impl Default for Params {
    fn default() -> Self {
        Self::new()
    }
}

impl Params {
    /// Creates an empty bundle using the process-wide interner.
    pub fn new() -> Self {
        Self::with_interner(KeyInterner::global())
    }

    /// Creates an empty bundle using an explicit interner.
    pub fn with_interner(interner: Arc<KeyInterner>) -> Self {
        Self {
            interner,
            entries: HashMap::new(),
            allowed: Vec::new(),
        }
    }

    /// Builds a bundle from key/value pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut params = Self::new();
        for (k, v) in pairs {
            params.insert(k.as_ref(), v);
        }
        params
    }

    /// The interner shared by this bundle.
    pub fn interner(&self) -> &Arc<KeyInterner> {
        &self.interner
    }

    /// Inserts or replaces a parameter.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        let id = self.interner.intern(key);
        self.entries.insert(id, value.into());
    }

    /// Removes a parameter, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let id = self.interner.lookup(key)?;
        self.entries.remove(&id)
    }

    /// Returns the dense id of a key.
    pub fn key_id(&self, key: &str) -> KeyId {
        self.interner.intern(key)
    }

    /// Returns the raw string value of a key.
    pub fn get_raw(&self, key: &str) -> Option<&str> {
        let id = self.interner.lookup(key)?;
        self.entries.get(&id).map(String::as_str)
    }

    /// Returns true if the key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.get_raw(key).is_some()
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the bundle is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .keys()
            .filter_map(|id| self.interner.name(*id))
            .map(|name| name.to_string())
            .collect();
        keys.sort();
        keys
    }

    /// Pushes a set of keys the owner expects to read.
    ///
    /// While a set is pushed, looking up a key outside it logs a warning.
    pub fn push_allowed_keys<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed.push(keys.into_iter().map(Into::into).collect());
    }

    /// Pops the most recently pushed allowed-key set.
    pub fn pop_allowed_keys(&mut self) {
        self.allowed.pop();
    }

    /// Returns the keys present in the bundle that the top allowed set does not name.
    ///
    /// Each one is also reported as a warning.
    pub fn unexpected_keys(&self) -> Vec<String> {
        let Some(allowed) = self.allowed.last() else {
            return Vec::new();
        };
        let unexpected: Vec<String> = self.keys().into_iter().filter(|k| !allowed.contains(k)).collect();
        for key in &unexpected {
            tracing::warn!(key = %key, "parameter is not used by this component");
        }
        unexpected
    }

    fn verify(&self, key: &str) {
        if let Some(allowed) = self.allowed.last() {
            if !allowed.contains(key) {
                tracing::warn!(key = %key, "lookup of undocumented parameter");
            }
        }
    }

    fn parse<T: ParamValue>(&self, key: &str, raw: &str) -> SimResult<T> {
        T::parse_param(raw)
            .map_err(|e| SimError::params(format!("parameter '{}' = '{}': {}", key, raw, e)))
    }

    /// Looks up a typed value, returning `default` when absent.
    pub fn find<T: ParamValue>(&self, key: &str, default: T) -> SimResult<T> {
        self.find_found(key, default).map(|(value, _)| value)
    }

    /// Looks up a typed value and reports whether the key was present.
    pub fn find_found<T: ParamValue>(&self, key: &str, default: T) -> SimResult<(T, bool)> {
        self.verify(key);
        match self.get_raw(key) {
            Some(raw) => Ok((self.parse(key, raw)?, true)),
            None => Ok((default, false)),
        }
    }

    /// Looks up a typed value that may be absent.
    pub fn find_optional<T: ParamValue>(&self, key: &str) -> SimResult<Option<T>> {
        self.verify(key);
        self.get_raw(key).map(|raw| self.parse(key, raw)).transpose()
    }

    /// Looks up a typed value that must be present.
    #[track_caller]
    pub fn find_required<T: ParamValue>(&self, key: &str) -> SimResult<T> {
        self.verify(key);
        match self.get_raw(key) {
            Some(raw) => self.parse(key, raw),
            None => Err(SimError::configuration(format!("missing required parameter '{}'", key))),
        }
    }

    /// Looks up a bracketed list `[a, b, c]`. A missing key yields an empty list.
    pub fn find_array<T: ParamValue>(&self, key: &str) -> SimResult<Vec<T>> {
        self.verify(key);
        let Some(raw) = self.get_raw(key) else {
            return Ok(Vec::new());
        };
        let items = split_array(raw).map_err(|e| SimError::params(format!("parameter '{}': {}", key, e)))?;
        items.iter().map(|item| self.parse(key, item)).collect()
    }

    /// Stores a typed value in its canonical string form.
    pub fn insert_value<T: ParamValue>(&mut self, key: &str, value: &T) {
        self.insert(key, value.to_param());
    }

    /// Stores a list in bracketed form.
    pub fn insert_array<T: ParamValue>(&mut self, key: &str, values: &[T]) {
        let items: Vec<String> = values.iter().map(ParamValue::to_param).collect();
        self.insert(key, format!("[{}]", items.join(", ")));
    }

    /// Returns the parameters whose key starts with `prefix`, with the prefix stripped.
    pub fn find_prefix_params(&self, prefix: &str) -> Params {
        let mut sub = Params::with_interner(Arc::clone(&self.interner));
        for (id, value) in &self.entries {
            if let Some(name) = self.interner.name(*id) {
                if let Some(stripped) = name.strip_prefix(prefix) {
                    if !stripped.is_empty() {
                        sub.insert(stripped, value.clone());
                    }
                }
            }
        }
        sub
    }

    /// Returns the parameters under `scope.`, with `scope.` stripped.
    pub fn scoped(&self, scope: &str) -> Params {
        self.find_prefix_params(&format!("{}.", scope))
    }

    /// Sorted copy of the parameters as a map.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter_map(|(id, v)| self.interner.name(*id).map(|k| (k.to_string(), v.clone())))
            .collect()
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.to_map()).finish()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.to_map() {
            writeln!(f, "{} = {}", key, value)?;
        }
        Ok(())
    }
}
