//! Malware scan for pickle-based checkpoints.
//!
//! Pickles can import and call arbitrary callables while being loaded. The
//! scan walks the opcode stream without executing it, tracking the value
//! stack and the memo closely enough to resolve the operands of every
//! `GLOBAL`, `INST` and `STACK_GLOBAL` import. Torch zip archives are opened
//! and every `.pkl` member is scanned; any other file is scanned as a
//! sequence of pickle streams.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;

use serde::Serialize;
use zip::ZipArchive;

use crate::error::Result;

/// Local file header signature that every zip archive starts with.
pub(crate) const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

/// Modules whose every attribute is considered dangerous.
const DANGEROUS_MODULES: &[&str] = &[
    "os", "posix", "nt", "subprocess", "sys", "socket", "shutil", "runpy", "webbrowser", "pty",
    "commands", "httplib", "requests", "aiohttp",
];

/// Dangerous callables of the builtins module.
const DANGEROUS_BUILTINS: &[&str] =
    &["eval", "exec", "execfile", "compile", "open", "getattr", "apply", "__import__"];

mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const FLOAT: u8 = b'F';
    pub const INT: u8 = b'I';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const LONG: u8 = b'L';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const PERSID: u8 = b'P';
    pub const BINPERSID: u8 = b'Q';
    pub const REDUCE: u8 = b'R';
    pub const STRING: u8 = b'S';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const UNICODE: u8 = b'V';
    pub const BINUNICODE: u8 = b'X';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPENDS: u8 = b'e';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const INST: u8 = b'i';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const OBJ: u8 = b'o';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const BINFLOAT: u8 = b'G';
    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const EXT1: u8 = 0x82;
    pub const EXT2: u8 = 0x83;
    pub const EXT4: u8 = 0x84;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const NEWOBJ_EX: u8 = 0x92;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
    pub const BYTEARRAY8: u8 = 0x96;
    pub const NEXT_BUFFER: u8 = 0x97;
    pub const READONLY_BUFFER: u8 = 0x98;
    pub const READWRITE_BUFFER: u8 = 0x99;
}

/// Outcome of a pickle scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PickleScan {
    /// Dangerous imports found, as `module.name`
    pub dangerous_globals: Vec<String>,
    /// The file could not be fully scanned: no pickle stream, a malformed
    /// stream, or an import whose target could not be resolved
    pub scan_error: bool,
}

impl PickleScan {
    /// Whether the scan flagged the file.
    pub fn is_infected(&self) -> bool {
        !self.dangerous_globals.is_empty()
    }

    fn merge(&mut self, other: PickleScan) {
        self.dangerous_globals.extend(other.dangerous_globals);
        self.dangerous_globals.sort();
        self.dangerous_globals.dedup();
        self.scan_error |= other.scan_error;
    }
}

/// Scan a checkpoint file for dangerous pickle imports.
pub fn scan_pickle(path: &Path) -> Result<PickleScan> {
    let data = std::fs::read(path)?;
    if data.starts_with(&ZIP_MAGIC) {
        return Ok(scan_archive(&data));
    }
    Ok(scan_bytes(&data))
}

/// Scan every pickle member of a torch zip archive.
fn scan_archive(data: &[u8]) -> PickleScan {
    let mut archive = match ZipArchive::new(Cursor::new(data)) {
        Ok(archive) => archive,
        Err(e) => {
            log::debug!("Unreadable checkpoint archive: {}", e);
            return PickleScan { scan_error: true, ..Default::default() };
        }
    };

    let mut scan = PickleScan::default();
    let mut members = 0;
    for index in 0..archive.len() {
        let mut member = match archive.by_index(index) {
            Ok(member) => member,
            Err(e) => {
                log::debug!("Unreadable archive member {}: {}", index, e);
                scan.scan_error = true;
                continue;
            }
        };
        if !member.name().ends_with(".pkl") {
            continue;
        }
        members += 1;

        let mut bytes = Vec::new();
        if let Err(e) = member.read_to_end(&mut bytes) {
            log::debug!("Unreadable archive member {}: {}", member.name(), e);
            scan.scan_error = true;
            continue;
        }
        scan.merge(scan_bytes(&bytes));
    }

    if members == 0 {
        scan.scan_error = true;
    }
    scan
}

/// Scan raw bytes holding one or more consecutive pickle streams.
///
/// A malformed first stream is a scan error. Bytes after a complete stream
/// are scanned only while they start another protocol 2+ stream, since
/// legacy torch files append raw tensor storage after their pickles.
pub fn scan_bytes(data: &[u8]) -> PickleScan {
    let mut imports = Vec::new();
    let mut scan_error = false;
    let mut pos = 0;
    let mut first = true;

    while pos < data.len() && (first || data[pos] == op::PROTO) {
        let mut walker = Walker::new(&data[pos..]);
        match walker.run() {
            Ok(consumed) => {
                scan_error |= walker.unresolved;
                imports.append(&mut walker.imports);
                pos += consumed;
            }
            Err(e) => {
                if first {
                    log::debug!("Malformed pickle stream: {}", e);
                    scan_error = true;
                }
                // Imports seen before the failure still count.
                imports.append(&mut walker.imports);
                break;
            }
        }
        first = false;
    }
    if data.is_empty() {
        scan_error = true;
    }

    let mut dangerous_globals: Vec<String> = imports
        .into_iter()
        .filter(|(module, name)| is_dangerous(module, name))
        .map(|(module, name)| format!("{}.{}", module, name))
        .collect();
    dangerous_globals.sort();
    dangerous_globals.dedup();

    PickleScan { dangerous_globals, scan_error }
}

fn is_dangerous(module: &str, name: &str) -> bool {
    let root = module.split('.').next().unwrap_or(module);
    if DANGEROUS_MODULES.contains(&root) {
        return true;
    }
    matches!(module, "builtins" | "__builtin__") && DANGEROUS_BUILTINS.contains(&name)
}

/// What the scan knows about a value on the pickle stack.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Mark,
    Text(String),
    Opaque,
}

/// Opcode walker over a single pickle stream.
struct Walker<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    memo: HashMap<u64, Value>,
    imports: Vec<(String, String)>,
    unresolved: bool,
}

impl<'a> Walker<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            stack: Vec::new(),
            memo: HashMap::new(),
            imports: Vec::new(),
            unresolved: false,
        }
    }

    /// Walk until `STOP`, returning the number of bytes consumed.
    fn run(&mut self) -> std::result::Result<usize, String> {
        loop {
            let at = self.pos;
            let code = self.take(1)?[0];
            match code {
                op::STOP => return Ok(self.pos),

                op::PROTO => {
                    self.take(1)?;
                }
                op::FRAME => {
                    self.take(8)?;
                }
                op::READONLY_BUFFER | op::READWRITE_BUFFER => {}

                op::MARK => self.stack.push(Value::Mark),
                op::POP => {
                    self.pop()?;
                }
                op::POP_MARK => {
                    self.pop_mark()?;
                }
                op::DUP => {
                    let top = self.top()?;
                    self.stack.push(top);
                }

                // Text pushes; these can feed STACK_GLOBAL.
                op::STRING => {
                    let line = self.line()?;
                    self.stack.push(Value::Text(unquote(&line)));
                }
                op::UNICODE => {
                    let line = self.line()?;
                    self.stack.push(Value::Text(line));
                }
                op::BINSTRING | op::BINUNICODE => {
                    let len = self.u32()? as usize;
                    let text = self.text(len)?;
                    self.stack.push(Value::Text(text));
                }
                op::SHORT_BINSTRING | op::SHORT_BINUNICODE => {
                    let len = self.take(1)?[0] as usize;
                    let text = self.text(len)?;
                    self.stack.push(Value::Text(text));
                }
                op::BINUNICODE8 => {
                    let len = self.len_u64()?;
                    let text = self.text(len)?;
                    self.stack.push(Value::Text(text));
                }

                // Other pushes.
                op::INT | op::LONG | op::FLOAT | op::PERSID => {
                    self.line()?;
                    self.stack.push(Value::Opaque);
                }
                op::BININT => self.skip_push(4)?,
                op::BININT1 => self.skip_push(1)?,
                op::BININT2 => self.skip_push(2)?,
                op::BINFLOAT => self.skip_push(8)?,
                op::LONG1 => {
                    let len = self.take(1)?[0] as usize;
                    self.skip_push(len)?;
                }
                op::LONG4 | op::BINBYTES => {
                    let len = self.u32()? as usize;
                    self.skip_push(len)?;
                }
                op::SHORT_BINBYTES => {
                    let len = self.take(1)?[0] as usize;
                    self.skip_push(len)?;
                }
                op::BINBYTES8 | op::BYTEARRAY8 => {
                    let len = self.len_u64()?;
                    self.skip_push(len)?;
                }
                op::NONE
                | op::NEWTRUE
                | op::NEWFALSE
                | op::EMPTY_DICT
                | op::EMPTY_LIST
                | op::EMPTY_TUPLE
                | op::EMPTY_SET
                | op::NEXT_BUFFER => self.stack.push(Value::Opaque),

                // Imports.
                op::GLOBAL => {
                    let module = self.line()?;
                    let name = self.line()?;
                    self.imports.push((module, name));
                    self.stack.push(Value::Opaque);
                }
                op::INST => {
                    let module = self.line()?;
                    let name = self.line()?;
                    self.imports.push((module, name));
                    self.pop_mark()?;
                    self.stack.push(Value::Opaque);
                }
                op::STACK_GLOBAL => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module, name) {
                        (Value::Text(module), Value::Text(name)) => self.imports.push((module, name)),
                        _ => {
                            log::debug!("STACK_GLOBAL at byte {} with unresolved operands", at);
                            self.unresolved = true;
                        }
                    }
                    self.stack.push(Value::Opaque);
                }
                op::EXT1 | op::EXT2 | op::EXT4 => {
                    let width = match code {
                        op::EXT1 => 1,
                        op::EXT2 => 2,
                        _ => 4,
                    };
                    self.take(width)?;
                    // Extension codes import through the copyreg registry.
                    self.unresolved = true;
                    self.stack.push(Value::Opaque);
                }

                // Memo.
                op::PUT => {
                    let index = parse_decimal(&self.line()?)?;
                    self.put(index)?;
                }
                op::BINPUT => {
                    let index = u64::from(self.take(1)?[0]);
                    self.put(index)?;
                }
                op::LONG_BINPUT => {
                    let index = u64::from(self.u32()?);
                    self.put(index)?;
                }
                op::MEMOIZE => self.put(self.memo.len() as u64)?,
                op::GET => {
                    let index = parse_decimal(&self.line()?)?;
                    self.push_memo(index)?;
                }
                op::BINGET => {
                    let index = u64::from(self.take(1)?[0]);
                    self.push_memo(index)?;
                }
                op::LONG_BINGET => {
                    let index = u64::from(self.u32()?);
                    self.push_memo(index)?;
                }

                // Containers and calls.
                op::TUPLE | op::LIST | op::DICT | op::FROZENSET | op::OBJ => {
                    self.pop_mark()?;
                    self.stack.push(Value::Opaque);
                }
                op::TUPLE1 => self.replace(1)?,
                op::TUPLE2 | op::REDUCE | op::NEWOBJ => self.replace(2)?,
                op::TUPLE3 | op::NEWOBJ_EX => self.replace(3)?,
                op::BINPERSID => self.replace(1)?,
                op::APPEND | op::BUILD => {
                    self.pop()?;
                }
                op::SETITEM => {
                    self.pop()?;
                    self.pop()?;
                }
                op::APPENDS | op::SETITEMS | op::ADDITEMS => {
                    self.pop_mark()?;
                }

                other => return Err(format!("unknown opcode 0x{:02x} at byte {}", other, at)),
            }
        }
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], String> {
        let end = self.pos.checked_add(n).ok_or("length overflow")?;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| format!("truncated at byte {}", self.pos))?;
        self.pos = end;
        Ok(bytes)
    }

    fn u32(&mut self) -> std::result::Result<u32, String> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn len_u64(&mut self) -> std::result::Result<usize, String> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        usize::try_from(u64::from_le_bytes(buf)).map_err(|e| e.to_string())
    }

    fn line(&mut self) -> std::result::Result<String, String> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| format!("unterminated line at byte {}", self.pos))?;
        let text = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(text)
    }

    fn text(&mut self, len: usize) -> std::result::Result<String, String> {
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }

    fn skip_push(&mut self, len: usize) -> std::result::Result<(), String> {
        self.take(len)?;
        self.stack.push(Value::Opaque);
        Ok(())
    }

    fn pop(&mut self) -> std::result::Result<Value, String> {
        self.stack.pop().ok_or_else(|| format!("stack underflow at byte {}", self.pos))
    }

    fn top(&self) -> std::result::Result<Value, String> {
        self.stack
            .last()
            .cloned()
            .ok_or_else(|| format!("empty stack at byte {}", self.pos))
    }

    fn pop_mark(&mut self) -> std::result::Result<(), String> {
        let mark = self
            .stack
            .iter()
            .rposition(|v| *v == Value::Mark)
            .ok_or_else(|| format!("missing mark at byte {}", self.pos))?;
        self.stack.truncate(mark);
        Ok(())
    }

    /// Pop `n` values and push their opaque result.
    fn replace(&mut self, n: usize) -> std::result::Result<(), String> {
        for _ in 0..n {
            self.pop()?;
        }
        self.stack.push(Value::Opaque);
        Ok(())
    }

    fn put(&mut self, index: u64) -> std::result::Result<(), String> {
        let top = self.top()?;
        self.memo.insert(index, top);
        Ok(())
    }

    fn push_memo(&mut self, index: u64) -> std::result::Result<(), String> {
        let value = self
            .memo
            .get(&index)
            .cloned()
            .ok_or_else(|| format!("memo key {} missing at byte {}", index, self.pos))?;
        self.stack.push(value);
        Ok(())
    }
}

/// Strip the quotes of a protocol 0 `STRING` argument.
fn unquote(line: &str) -> String {
    let trimmed = line.trim();
    for quote in ['\'', '"'] {
        if let Some(inner) = trimmed.strip_prefix(quote).and_then(|s| s.strip_suffix(quote)) {
            return inner.to_string();
        }
    }
    trimmed.to_string()
}

fn parse_decimal(line: &str) -> std::result::Result<u64, String> {
    line.trim().parse().map_err(|e| format!("bad memo index {:?}: {}", line, e))
}
