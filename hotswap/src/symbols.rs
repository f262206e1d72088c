//! Symbol tables of on-disk binaries, rebased onto the running image.
//!
//! Parses ELF and Mach-O with the `object` crate, demangles legacy Rust
//! names and ranks near misses for `SymbolNotFound`.

use hotswap_intercept::PatchError;
use log::debug;
use object::{Object, ObjectSymbol, SymbolKind};
use std::borrow::Cow;
use std::collections::HashMap;
use std::io;
use std::path::Path;

const MAX_SUGGESTIONS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    /// Runtime address (file address plus load bias).
    pub address: usize,
    /// Size in bytes, 0 when the format does not record one.
    pub size: usize,
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, usize>,
}

impl SymbolTable {
    /// Build a table from already-resolved symbols. The first symbol with a
    /// given name wins.
    pub fn from_symbols(mut symbols: Vec<Symbol>) -> Self {
        symbols.sort_by_key(|s| s.address);
        let mut by_name = HashMap::with_capacity(symbols.len());
        for (i, sym) in symbols.iter().enumerate() {
            by_name.entry(sym.name.clone()).or_insert(i);
        }
        Self { symbols, by_name }
    }

    /// Parse text symbols of a binary image, adding `bias` to every address.
    pub fn parse(data: &[u8], bias: usize) -> io::Result<Self> {
        let obj = object::File::parse(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mach = matches!(obj.format(), object::BinaryFormat::MachO);

        let mut raw: Vec<(u64, u64, String)> = Vec::new();
        for sym in obj.symbols().chain(obj.dynamic_symbols()) {
            if sym.kind() != SymbolKind::Text || !sym.is_definition() || sym.address() == 0 {
                continue;
            }
            let name = match sym.name() {
                Ok(n) if !n.is_empty() => n,
                _ => continue,
            };
            let name = if mach { name.strip_prefix('_').unwrap_or(name) } else { name };
            raw.push((sym.address(), sym.size(), demangle(name).into_owned()));
        }
        raw.sort_by_key(|(addr, _, _)| *addr);

        // Mach-O records no sizes: a symbol extends to the next one.
        let mut symbols = Vec::with_capacity(raw.len());
        for (i, (addr, size, name)) in raw.iter().enumerate() {
            let size = if *size > 0 {
                *size
            } else {
                raw[i + 1..].iter().find(|(next, _, _)| next > addr).map_or(0, |(next, _, _)| next - addr)
            };
            symbols.push(Symbol { name: name.clone(), address: *addr as usize + bias, size: size as usize });
        }
        debug!("parsed {} text symbols (bias {bias:#x})", symbols.len());
        Ok(Self::from_symbols(symbols))
    }

    pub fn from_path(path: impl AsRef<Path>, bias: usize) -> io::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        debug!("reading symbols from {}", path.display());
        Self::parse(&data, bias)
    }

    /// Symbols of the running executable, rebased by its load bias.
    pub fn current_exe() -> io::Result<Self> {
        let exe = std::env::current_exe()?;
        Self::from_path(exe, load_bias())
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.by_name.get(name).map(|&i| &self.symbols[i])
    }

    /// Look up a fully qualified name, or fail with ranked suggestions.
    pub fn lookup(&self, name: &str) -> Result<&Symbol, PatchError> {
        self.get(name).ok_or_else(|| PatchError::SymbolNotFound {
            name: name.to_string(),
            suggestions: self.suggestions(name),
        })
    }

    /// The symbol whose range contains `addr`.
    pub fn symbol_at(&self, addr: usize) -> Option<&Symbol> {
        let idx = self.symbols.partition_point(|s| s.address <= addr);
        let sym = self.symbols.get(idx.checked_sub(1)?)?;
        (addr < sym.address + sym.size.max(1)).then_some(sym)
    }

    /// Names resembling `name`: most shared path tokens first, then the
    /// closest last segment.
    pub fn suggestions(&self, name: &str) -> Vec<String> {
        let wanted = tokens(name);
        let last = last_segment(name);
        let limit = (last.len() / 3).max(2);

        let mut ranked: Vec<(usize, usize, &str)> = self
            .by_name
            .keys()
            .filter_map(|candidate| {
                let shared = tokens(candidate).iter().filter(|t| wanted.contains(t)).count();
                let distance = edit_distance(last, last_segment(candidate));
                (shared > 0 || distance <= limit).then_some((shared, distance, candidate.as_str()))
            })
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(b.2)));
        ranked.into_iter().take(MAX_SUGGESTIONS).map(|(_, _, n)| n.to_string()).collect()
    }
}

fn tokens(name: &str) -> Vec<&str> {
    name.split(|c: char| c == ':' || c == '/' || c == '.').filter(|t| !t.is_empty()).collect()
}

fn last_segment(name: &str) -> &str {
    tokens(name).last().copied().unwrap_or(name)
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        cur[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Demangle a legacy Rust symbol (`_ZN...E`) and drop its `::h<hash>`
/// suffix. Anything else is returned unchanged, minus a trailing hash.
pub fn demangle(name: &str) -> Cow<'_, str> {
    let Some(body) = name.strip_prefix("_ZN").or_else(|| name.strip_prefix("__ZN")) else {
        return match strip_hash(name) {
            Some(stripped) => Cow::Owned(stripped.to_string()),
            None => Cow::Borrowed(name),
        };
    };
    let mut rest = body;
    let mut parts: Vec<String> = Vec::new();
    loop {
        if let Some(after) = rest.strip_prefix('E') {
            if after.is_empty() || after.starts_with('.') {
                break;
            }
        }
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let Some(len) = rest[..digits].parse::<usize>().ok() else {
            return Cow::Borrowed(name);
        };
        let Some(ident) = rest.get(digits..digits + len) else {
            return Cow::Borrowed(name);
        };
        parts.push(unescape(ident));
        rest = &rest[digits + len..];
    }
    if parts.last().is_some_and(|p| is_hash(p)) {
        parts.pop();
    }
    Cow::Owned(parts.join("::"))
}

fn is_hash(part: &str) -> bool {
    part.len() == 17 && part.starts_with('h') && part[1..].bytes().all(|b| b.is_ascii_hexdigit())
}

fn strip_hash(name: &str) -> Option<&str> {
    let (head, tail) = name.rsplit_once("::")?;
    is_hash(tail).then_some(head)
}

fn unescape(ident: &str) -> String {
    let ident = ident.strip_prefix("_$").map_or(Cow::Borrowed(ident), |r| Cow::Owned(format!("${r}")));
    let mut out = String::with_capacity(ident.len());
    let mut rest: &str = &ident;
    while !rest.is_empty() {
        if let Some(r) = rest.strip_prefix("..") {
            out.push_str("::");
            rest = r;
            continue;
        }
        if rest.starts_with('$') {
            if let Some(end) = rest[1..].find('$') {
                let code = &rest[1..1 + end];
                let decoded = match code {
                    "SP" => Some('@'),
                    "BP" => Some('*'),
                    "RF" => Some('&'),
                    "LT" => Some('<'),
                    "GT" => Some('>'),
                    "LP" => Some('('),
                    "RP" => Some(')'),
                    "C" => Some(','),
                    _ => code
                        .strip_prefix('u')
                        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                        .and_then(char::from_u32),
                };
                if let Some(c) = decoded {
                    out.push(c);
                    rest = &rest[end + 2..];
                    continue;
                }
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

/// Difference between where the main executable was linked and where it
/// was loaded.
#[cfg(target_os = "linux")]
pub fn load_bias() -> usize {
    use std::ffi::c_void;

    unsafe extern "C" fn first_object(info: *mut libc::dl_phdr_info, _size: libc::size_t, data: *mut c_void) -> libc::c_int {
        *(data as *mut usize) = (*info).dlpi_addr as usize;
        1
    }

    let mut bias = 0usize;
    // SAFETY: the callback only writes through `data`, which points at `bias`.
    unsafe {
        libc::dl_iterate_phdr(Some(first_object), &mut bias as *mut usize as *mut c_void);
    }
    bias
}

#[cfg(target_os = "macos")]
pub fn load_bias() -> usize {
    extern "C" {
        fn _dyld_get_image_vmaddr_slide(index: u32) -> isize;
    }
    // SAFETY: image 0 is always the main executable.
    unsafe { _dyld_get_image_vmaddr_slide(0) as usize }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn load_bias() -> usize {
    0
}
