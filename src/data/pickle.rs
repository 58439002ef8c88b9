//! A small pickle virtual machine for numeric datasets.
//!
//! Only the object kinds a NumPy dataset pickle needs are understood:
//! plain Python scalars and containers, `numpy.dtype`, `numpy.ndarray`
//! (via `_reconstruct` + `__setstate__`) and `_codecs.encode`, which is how
//! Python 3 spells `bytes` at protocol 2. Every other global is rejected.
//!
//! Legacy byte strings (Python 2 `str`) stay raw bytes; anything that reads
//! them as text decodes them as Latin-1.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use log::debug;

use crate::error::DecodeError;

type Result<T> = std::result::Result<T, DecodeError>;

/// Mutable objects are shared between the stack and the memo, as in Python.
pub type Shared<T> = Rc<RefCell<T>>;

fn shared<T>(value: T) -> Shared<T> {
    Rc::new(RefCell::new(value))
}

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
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const BINFLOAT: u8 = b'G';

    pub const PROTO: u8 = 0x80;
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
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
}

pub(crate) use op::*;

// ---------------------------------------------------------------------------
// Value – what the machine builds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Python 2 `str` or Python 3 `bytes`.
    Bytes(Rc<[u8]>),
    Str(Rc<str>),
    Tuple(Vec<Value>),
    List(Shared<Vec<Value>>),
    Dict(Shared<Vec<(Value, Value)>>),
    Global(Callable),
    Dtype(Shared<Dtype>),
    Array(Shared<NdArray>),
}

impl Value {
    /// Text content of a string value; byte strings are read as Latin-1.
    pub fn text(&self) -> Option<Cow<'_, str>> {
        match self {
            Value::Str(s) => Some(Cow::Borrowed(&**s)),
            Value::Bytes(b) => Some(Cow::Owned(latin1_decode(b))),
            _ => None,
        }
    }

    /// Raw bytes of a string value; text is encoded as Latin-1.
    fn latin1_bytes(&self) -> Option<Rc<[u8]>> {
        match self {
            Value::Bytes(b) => Some(Rc::clone(b)),
            Value::Str(s) => latin1_encode(s).map(Rc::from),
            _ => None,
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Short description for error messages.
    pub fn describe(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(b) => format!("bool {b}"),
            Value::Int(i) => format!("int {i}"),
            Value::Float(f) => format!("float {f}"),
            Value::Bytes(b) => format!("bytes of length {}", b.len()),
            Value::Str(s) => format!("str of length {}", s.chars().count()),
            Value::Tuple(items) => format!("tuple of length {}", items.len()),
            Value::List(items) => format!("list of length {}", items.borrow().len()),
            Value::Dict(items) => format!("dict of length {}", items.borrow().len()),
            Value::Global(c) => format!("global {c}"),
            Value::Dtype(d) => format!("dtype {}", d.borrow().kind),
            Value::Array(a) => {
                let a = a.borrow();
                match a.dtype {
                    Some(dtype) => format!("{} array of shape {:?}", dtype.kind, a.shape),
                    None => "uninitialised array".to_string(),
                }
            }
        }
    }
}

fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn latin1_encode(text: &str) -> Option<Vec<u8>> {
    text.chars().map(|c| u8::try_from(u32::from(c)).ok()).collect()
}

// ---------------------------------------------------------------------------
// Callable – the globals this machine knows how to apply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callable {
    /// `numpy.core.multiarray._reconstruct`
    Reconstruct,
    /// `numpy.ndarray`, only ever passed to `_reconstruct`.
    NdArrayType,
    /// `numpy.dtype`
    Dtype,
    /// `_codecs.encode`
    CodecsEncode,
    /// `builtins.bytes`, used for empty byte strings.
    Bytes,
}

impl Callable {
    fn resolve(module: &str, name: &str) -> Result<Self> {
        match (module, name) {
            ("numpy.core.multiarray" | "numpy._core.multiarray", "_reconstruct") => {
                Ok(Callable::Reconstruct)
            }
            ("numpy", "ndarray") => Ok(Callable::NdArrayType),
            ("numpy", "dtype") => Ok(Callable::Dtype),
            ("_codecs", "encode") => Ok(Callable::CodecsEncode),
            ("builtins" | "__builtin__", "bytes") => Ok(Callable::Bytes),
            _ => Err(DecodeError::UnsupportedGlobal {
                module: module.to_string(),
                name: name.to_string(),
            }),
        }
    }

    fn call(self, args: Value, offset: usize) -> Result<Value> {
        let args = match args {
            Value::Tuple(args) => args,
            other => {
                return Err(DecodeError::malformed(
                    offset,
                    format!("{self} called with {}", other.describe()),
                ))
            }
        };
        match (self, args.as_slice()) {
            (Callable::Reconstruct, [_cls, _shape, _typecode]) => {
                Ok(Value::Array(shared(NdArray::default())))
            }
            (Callable::Dtype, [descr, ..]) => {
                let descr = descr
                    .text()
                    .ok_or_else(|| DecodeError::malformed(offset, "dtype descriptor is not a string"))?;
                Ok(Value::Dtype(shared(Dtype::from_descr(&descr)?)))
            }
            (Callable::CodecsEncode, [text, encoding]) => {
                let encoding = encoding.text().unwrap_or_default().to_ascii_lowercase();
                if !matches!(encoding.as_str(), "latin1" | "latin-1" | "latin_1" | "iso-8859-1") {
                    return Err(DecodeError::malformed(
                        offset,
                        format!("unsupported codec '{encoding}'"),
                    ));
                }
                let bytes = match text {
                    Value::Str(s) => latin1_encode(s),
                    _ => None,
                }
                .ok_or_else(|| DecodeError::malformed(offset, "_codecs.encode needs Latin-1 text"))?;
                Ok(Value::Bytes(Rc::from(bytes)))
            }
            (Callable::Bytes, []) => Ok(Value::Bytes(Rc::from(Vec::new()))),
            (callable, args) => Err(DecodeError::malformed(
                offset,
                format!("{callable} called with {} arguments", args.len()),
            )),
        }
    }
}

impl fmt::Display for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Callable::Reconstruct => "numpy.core.multiarray._reconstruct",
            Callable::NdArrayType => "numpy.ndarray",
            Callable::Dtype => "numpy.dtype",
            Callable::CodecsEncode => "_codecs.encode",
            Callable::Bytes => "builtins.bytes",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Dtype
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    F4,
    F8,
    I1,
    I2,
    I4,
    I8,
    U1,
    U2,
    U4,
    U8,
}

impl ElementKind {
    fn parse(code: &str) -> Option<Self> {
        Some(match code {
            "f4" => ElementKind::F4,
            "f8" => ElementKind::F8,
            "i1" => ElementKind::I1,
            "i2" => ElementKind::I2,
            "i4" => ElementKind::I4,
            "i8" => ElementKind::I8,
            "u1" => ElementKind::U1,
            "u2" => ElementKind::U2,
            "u4" => ElementKind::U4,
            "u8" => ElementKind::U8,
            _ => return None,
        })
    }

    pub fn size(self) -> usize {
        match self {
            ElementKind::I1 | ElementKind::U1 => 1,
            ElementKind::I2 | ElementKind::U2 => 2,
            ElementKind::F4 | ElementKind::I4 | ElementKind::U4 => 4,
            ElementKind::F8 | ElementKind::I8 | ElementKind::U8 => 8,
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementKind::F4 => "float32",
            ElementKind::F8 => "float64",
            ElementKind::I1 => "int8",
            ElementKind::I2 => "int16",
            ElementKind::I4 => "int32",
            ElementKind::I8 => "int64",
            ElementKind::U1 => "uint8",
            ElementKind::U2 => "uint16",
            ElementKind::U4 => "uint32",
            ElementKind::U8 => "uint64",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
    Native,
    /// `|`: single-byte elements.
    NotApplicable,
}

impl ByteOrder {
    fn parse(c: char) -> Option<Self> {
        match c {
            '<' => Some(ByteOrder::Little),
            '>' => Some(ByteOrder::Big),
            '=' => Some(ByteOrder::Native),
            '|' => Some(ByteOrder::NotApplicable),
            _ => None,
        }
    }

    fn is_big_endian(self) -> bool {
        match self {
            ByteOrder::Big => true,
            ByteOrder::Native => cfg!(target_endian = "big"),
            ByteOrder::Little | ByteOrder::NotApplicable => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dtype {
    pub kind: ElementKind,
    pub byte_order: ByteOrder,
}

impl Dtype {
    /// Parse a descriptor such as `f4` or `<i8`.
    pub fn from_descr(descr: &str) -> Result<Self> {
        let mut chars = descr.chars();
        let (order, code) = match chars.next().and_then(ByteOrder::parse) {
            Some(order) => (Some(order), chars.as_str()),
            None => (None, descr),
        };
        let kind = ElementKind::parse(code)
            .ok_or_else(|| DecodeError::UnsupportedDtype(descr.to_string()))?;
        let byte_order = order.unwrap_or(if kind.size() == 1 {
            ByteOrder::NotApplicable
        } else {
            ByteOrder::Native
        });
        Ok(Dtype { kind, byte_order })
    }

    /// `dtype.__setstate__`: `(version, byteorder, ...)`.
    fn set_state(&mut self, state: &Value, offset: usize) -> Result<()> {
        let order = match state {
            Value::Tuple(items) if items.len() >= 2 => items[1].text().and_then(|t| {
                let mut chars = t.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => ByteOrder::parse(c),
                    _ => None,
                }
            }),
            _ => None,
        };
        self.byte_order = order.ok_or_else(|| {
            DecodeError::malformed(offset, format!("bad dtype state: {}", state.describe()))
        })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NdArray
// ---------------------------------------------------------------------------

/// A C-ordered NumPy array: shape, element type and raw element bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NdArray {
    shape: Vec<usize>,
    dtype: Option<Dtype>,
    data: Option<Rc<[u8]>>,
}

impl NdArray {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// `None` until the array's state has been applied.
    pub fn dtype(&self) -> Option<Dtype> {
        self.dtype
    }

    /// `ndarray.__setstate__`: `([version,] shape, dtype, is_fortran, data)`.
    fn set_state(&mut self, state: &Value, offset: usize) -> Result<()> {
        let bad = |what: &str| DecodeError::malformed(offset, format!("bad ndarray state: {what}"));

        let items = match state {
            Value::Tuple(items) => items.as_slice(),
            other => return Err(bad(&other.describe())),
        };
        let [shape, dtype, fortran, data] = match items {
            [_, shape, dtype, fortran, data] | [shape, dtype, fortran, data] => {
                [shape, dtype, fortran, data]
            }
            _ => return Err(bad(&format!("{} fields", items.len()))),
        };

        let shape = match shape {
            Value::Tuple(dims) => dims
                .iter()
                .map(|d| d.as_int().and_then(|d| usize::try_from(d).ok()))
                .collect::<Option<Vec<usize>>>()
                .ok_or_else(|| bad("shape"))?,
            other => return Err(bad(&format!("shape is {}", other.describe()))),
        };
        let dtype = match dtype {
            Value::Dtype(d) => *d.borrow(),
            other => return Err(bad(&format!("dtype is {}", other.describe()))),
        };
        let fortran = fortran.as_int().ok_or_else(|| bad("fortran flag"))? != 0;
        if fortran && shape.len() > 1 {
            return Err(DecodeError::FortranOrder(shape.len()));
        }
        let data = data
            .latin1_bytes()
            .ok_or_else(|| bad(&format!("data is {}", data.describe())))?;

        let expected = shape
            .iter()
            .try_fold(dtype.kind.size(), |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| bad("shape overflows"))?;
        if data.len() != expected {
            return Err(DecodeError::ArrayDataLength {
                shape,
                dtype: dtype.kind.to_string(),
                expected,
                actual: data.len(),
            });
        }

        debug!("ndarray {} {:?}", dtype.kind, shape);
        self.shape = shape;
        self.dtype = Some(dtype);
        self.data = Some(data);
        Ok(())
    }

    fn initialised(&self) -> Result<(Dtype, &[u8])> {
        match (self.dtype, &self.data) {
            (Some(dtype), Some(data)) => Ok((dtype, data)),
            _ => Err(DecodeError::schema(
                "ndarray",
                "an array with state",
                "an array whose BUILD never ran".to_string(),
            )),
        }
    }

    fn elements<T, const N: usize>(
        &self,
        from_le: fn([u8; N]) -> T,
        from_be: fn([u8; N]) -> T,
    ) -> Result<Vec<T>> {
        let (dtype, data) = self.initialised()?;
        let convert = if dtype.byte_order.is_big_endian() {
            from_be
        } else {
            from_le
        };
        Ok(data
            .chunks_exact(N)
            .map(|chunk| {
                let mut buf = [0u8; N];
                buf.copy_from_slice(chunk);
                convert(buf)
            })
            .collect())
    }

    fn wrong_kind(&self, expected: &'static str) -> DecodeError {
        let found = self
            .dtype
            .map(|d| d.kind.to_string())
            .unwrap_or_else(|| "no dtype".to_string());
        DecodeError::schema("ndarray", expected, found)
    }

    pub fn to_f32(&self) -> Result<Vec<f32>> {
        match self.initialised()?.0.kind {
            ElementKind::F4 => self.elements(f32::from_le_bytes, f32::from_be_bytes),
            _ => Err(self.wrong_kind("a float32 array")),
        }
    }

    pub fn to_f64(&self) -> Result<Vec<f64>> {
        match self.initialised()?.0.kind {
            ElementKind::F8 => self.elements(f64::from_le_bytes, f64::from_be_bytes),
            _ => Err(self.wrong_kind("a float64 array")),
        }
    }

    pub fn to_u8(&self) -> Result<Vec<u8>> {
        match self.initialised()?.0.kind {
            ElementKind::U1 => Ok(self.initialised()?.1.to_vec()),
            _ => Err(self.wrong_kind("a uint8 array")),
        }
    }

    /// Elements of any integer array widened to `i64`.
    pub fn to_i64(&self) -> Result<Vec<i64>> {
        fn widen<T: Into<i64>>(values: Vec<T>) -> Vec<i64> {
            values.into_iter().map(Into::into).collect()
        }
        Ok(match self.initialised()?.0.kind {
            ElementKind::I1 => widen(self.elements(i8::from_le_bytes, i8::from_be_bytes)?),
            ElementKind::I2 => widen(self.elements(i16::from_le_bytes, i16::from_be_bytes)?),
            ElementKind::I4 => widen(self.elements(i32::from_le_bytes, i32::from_be_bytes)?),
            ElementKind::I8 => self.elements(i64::from_le_bytes, i64::from_be_bytes)?,
            ElementKind::U1 => widen(self.elements(u8::from_le_bytes, u8::from_be_bytes)?),
            ElementKind::U2 => widen(self.elements(u16::from_le_bytes, u16::from_be_bytes)?),
            ElementKind::U4 => widen(self.elements(u32::from_le_bytes, u32::from_be_bytes)?),
            ElementKind::U8 => self
                .elements(u64::from_le_bytes, u64::from_be_bytes)?
                .into_iter()
                .map(|v| i64::try_from(v).unwrap_or(i64::MAX))
                .collect(),
            ElementKind::F4 | ElementKind::F8 => return Err(self.wrong_kind("an integer array")),
        })
    }
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

/// Run a pickle stream and return the object left by `STOP`.
pub fn from_slice(input: &[u8]) -> Result<Value> {
    Machine::new(input).run()
}

struct Machine<'a> {
    input: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    metastack: Vec<Vec<Value>>,
    memo: HashMap<u32, Value>,
}

impl<'a> Machine<'a> {
    fn new(input: &'a [u8]) -> Self {
        Machine {
            input,
            pos: 0,
            stack: Vec::new(),
            metastack: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn run(mut self) -> Result<Value> {
        loop {
            let offset = self.pos;
            let opcode = self.byte()?;
            match opcode {
                PROTO => {
                    let version = self.byte()?;
                    debug!("pickle protocol {version}");
                }
                FRAME => {
                    self.take(8)?;
                }
                STOP => return self.pop(),

                MARK => {
                    let outer = std::mem::take(&mut self.stack);
                    self.metastack.push(outer);
                }
                POP => {
                    self.pop()?;
                }
                POP_MARK => {
                    self.pop_mark()?;
                }
                DUP => {
                    let top = self.top_mut()?.clone();
                    self.stack.push(top);
                }

                NONE => self.stack.push(Value::None),
                NEWTRUE => self.stack.push(Value::Bool(true)),
                NEWFALSE => self.stack.push(Value::Bool(false)),
                BININT => {
                    let v = i32::from_le_bytes(self.array()?);
                    self.stack.push(Value::Int(i64::from(v)));
                }
                BININT1 => {
                    let v = self.byte()?;
                    self.stack.push(Value::Int(i64::from(v)));
                }
                BININT2 => {
                    let v = u16::from_le_bytes(self.array()?);
                    self.stack.push(Value::Int(i64::from(v)));
                }
                LONG1 => {
                    let n = usize::from(self.byte()?);
                    let v = self.long(n, offset)?;
                    self.stack.push(Value::Int(v));
                }
                LONG4 => {
                    let n = self.length_u32()?;
                    let v = self.long(n, offset)?;
                    self.stack.push(Value::Int(v));
                }
                INT => {
                    let line = self.text_line()?;
                    let value = match line.as_str() {
                        "00" => Value::Bool(false),
                        "01" => Value::Bool(true),
                        digits => Value::Int(parse_number(digits, offset)?),
                    };
                    self.stack.push(value);
                }
                LONG => {
                    let line = self.text_line()?;
                    let digits = line.strip_suffix('L').unwrap_or(&line);
                    let v = parse_number(digits, offset)?;
                    self.stack.push(Value::Int(v));
                }
                FLOAT => {
                    let line = self.text_line()?;
                    let v = parse_number(&line, offset)?;
                    self.stack.push(Value::Float(v));
                }
                BINFLOAT => {
                    let v = f64::from_be_bytes(self.array()?);
                    self.stack.push(Value::Float(v));
                }

                STRING => {
                    let line = self.text_line()?;
                    let bytes = unquote_string(&line)
                        .ok_or_else(|| DecodeError::malformed(offset, "bad STRING literal"))?;
                    self.stack.push(Value::Bytes(Rc::from(bytes)));
                }
                BINSTRING => {
                    let n = i32::from_le_bytes(self.array()?);
                    let n = usize::try_from(n)
                        .map_err(|_| DecodeError::malformed(offset, "negative BINSTRING length"))?;
                    let bytes = self.take(n)?;
                    self.stack.push(Value::Bytes(Rc::from(bytes)));
                }
                SHORT_BINSTRING | SHORT_BINBYTES => {
                    let n = usize::from(self.byte()?);
                    let bytes = self.take(n)?;
                    self.stack.push(Value::Bytes(Rc::from(bytes)));
                }
                BINBYTES => {
                    let n = self.length_u32()?;
                    let bytes = self.take(n)?;
                    self.stack.push(Value::Bytes(Rc::from(bytes)));
                }
                BINBYTES8 => {
                    let n = self.length_u64(offset)?;
                    let bytes = self.take(n)?;
                    self.stack.push(Value::Bytes(Rc::from(bytes)));
                }
                UNICODE => {
                    let line = self.line()?;
                    let text = raw_unicode_unescape(line)
                        .ok_or_else(|| DecodeError::malformed(offset, "bad UNICODE literal"))?;
                    self.stack.push(Value::Str(Rc::from(text)));
                }
                BINUNICODE => {
                    let n = self.length_u32()?;
                    self.push_utf8(n, offset)?;
                }
                SHORT_BINUNICODE => {
                    let n = usize::from(self.byte()?);
                    self.push_utf8(n, offset)?;
                }
                BINUNICODE8 => {
                    let n = self.length_u64(offset)?;
                    self.push_utf8(n, offset)?;
                }

                EMPTY_TUPLE => self.stack.push(Value::Tuple(Vec::new())),
                TUPLE => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Tuple(items));
                }
                TUPLE1 | TUPLE2 | TUPLE3 => {
                    let n = usize::from(opcode - TUPLE1 + 1);
                    let at = self
                        .stack
                        .len()
                        .checked_sub(n)
                        .ok_or(DecodeError::StackUnderflow(offset))?;
                    let items = self.stack.split_off(at);
                    self.stack.push(Value::Tuple(items));
                }
                EMPTY_LIST => self.stack.push(Value::List(shared(Vec::new()))),
                LIST => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::List(shared(items)));
                }
                APPEND => {
                    let item = self.pop()?;
                    self.list_top(offset)?.borrow_mut().push(item);
                }
                APPENDS => {
                    let items = self.pop_mark()?;
                    self.list_top(offset)?.borrow_mut().extend(items);
                }
                EMPTY_DICT => self.stack.push(Value::Dict(shared(Vec::new()))),
                DICT => {
                    let items = self.pop_mark()?;
                    let pairs = pairs(items, offset)?;
                    self.stack.push(Value::Dict(shared(pairs)));
                }
                SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.dict_top(offset)?.borrow_mut().push((key, value));
                }
                SETITEMS => {
                    let items = self.pop_mark()?;
                    let pairs = pairs(items, offset)?;
                    self.dict_top(offset)?.borrow_mut().extend(pairs);
                }

                PUT => {
                    let key = parse_number(&self.text_line()?, offset)?;
                    self.put(key)?;
                }
                BINPUT => {
                    let key = u32::from(self.byte()?);
                    self.put(key)?;
                }
                LONG_BINPUT => {
                    let key = u32::from_le_bytes(self.array()?);
                    self.put(key)?;
                }
                MEMOIZE => {
                    let key = u32::try_from(self.memo.len())
                        .map_err(|_| DecodeError::malformed(offset, "memo overflow"))?;
                    self.put(key)?;
                }
                GET => {
                    let key = parse_number(&self.text_line()?, offset)?;
                    self.get(key)?;
                }
                BINGET => {
                    let key = u32::from(self.byte()?);
                    self.get(key)?;
                }
                LONG_BINGET => {
                    let key = u32::from_le_bytes(self.array()?);
                    self.get(key)?;
                }

                GLOBAL => {
                    let module = self.text_line()?;
                    let name = self.text_line()?;
                    let callable = Callable::resolve(&module, &name)?;
                    self.stack.push(Value::Global(callable));
                }
                STACK_GLOBAL => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    let (Value::Str(module), Value::Str(name)) = (module, name) else {
                        return Err(DecodeError::malformed(offset, "STACK_GLOBAL needs two str"));
                    };
                    let callable = Callable::resolve(&module, &name)?;
                    self.stack.push(Value::Global(callable));
                }
                REDUCE => {
                    let args = self.pop()?;
                    let callable = match self.pop()? {
                        Value::Global(callable) => callable,
                        other => {
                            return Err(DecodeError::malformed(
                                offset,
                                format!("REDUCE on {}", other.describe()),
                            ))
                        }
                    };
                    let value = callable.call(args, offset)?;
                    self.stack.push(value);
                }
                BUILD => {
                    let state = self.pop()?;
                    match self.top_mut()? {
                        Value::Dtype(dtype) => dtype.borrow_mut().set_state(&state, offset)?,
                        Value::Array(array) => array.borrow_mut().set_state(&state, offset)?,
                        other => {
                            return Err(DecodeError::malformed(
                                offset,
                                format!("BUILD on {}", other.describe()),
                            ))
                        }
                    }
                }

                opcode => return Err(DecodeError::UnsupportedOpcode { opcode, offset }),
            }
        }
    }

    // -- input --

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.input.len())
            .ok_or(DecodeError::Truncated(self.pos))?;
        let input: &'a [u8] = self.input;
        let bytes = &input[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn length_u32(&mut self) -> Result<usize> {
        Ok(u32::from_le_bytes(self.array()?) as usize)
    }

    fn length_u64(&mut self, offset: usize) -> Result<usize> {
        let n = u64::from_le_bytes(self.array()?);
        usize::try_from(n).map_err(|_| DecodeError::malformed(offset, "length exceeds memory"))
    }

    /// Bytes up to (not including) the next newline.
    fn line(&mut self) -> Result<&'a [u8]> {
        let input: &'a [u8] = self.input;
        let rest = &input[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(DecodeError::Truncated(self.input.len()))?;
        let line = &rest[..len];
        self.pos += len + 1;
        Ok(line)
    }

    fn text_line(&mut self) -> Result<String> {
        Ok(latin1_decode(self.line()?))
    }

    fn long(&mut self, n: usize, offset: usize) -> Result<i64> {
        let bytes = self.take(n)?;
        if bytes.len() > 8 {
            return Err(DecodeError::malformed(offset, "integer wider than 64 bits"));
        }
        let fill = match bytes.last() {
            Some(&last) if last & 0x80 != 0 => 0xff,
            _ => 0,
        };
        let mut buf = [fill; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(i64::from_le_bytes(buf))
    }

    fn push_utf8(&mut self, n: usize, offset: usize) -> Result<()> {
        let bytes = self.take(n)?;
        let text = std::str::from_utf8(bytes)
            .map_err(|e| DecodeError::malformed(offset, format!("invalid UTF-8: {e}")))?;
        self.stack.push(Value::Str(Rc::from(text)));
        Ok(())
    }

    // -- stack --

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or(DecodeError::StackUnderflow(self.pos))
    }

    fn top_mut(&mut self) -> Result<&mut Value> {
        self.stack.last_mut().ok_or(DecodeError::StackUnderflow(self.pos))
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        let outer = self.metastack.pop().ok_or(DecodeError::MissingMark(self.pos))?;
        Ok(std::mem::replace(&mut self.stack, outer))
    }

    fn list_top(&mut self, offset: usize) -> Result<Shared<Vec<Value>>> {
        match self.top_mut()? {
            Value::List(items) => Ok(Rc::clone(items)),
            other => Err(DecodeError::malformed(
                offset,
                format!("append to {}", other.describe()),
            )),
        }
    }

    fn dict_top(&mut self, offset: usize) -> Result<Shared<Vec<(Value, Value)>>> {
        match self.top_mut()? {
            Value::Dict(items) => Ok(Rc::clone(items)),
            other => Err(DecodeError::malformed(
                offset,
                format!("set item on {}", other.describe()),
            )),
        }
    }

    // -- memo --

    fn put(&mut self, key: u32) -> Result<()> {
        let top = self.top_mut()?.clone();
        self.memo.insert(key, top);
        Ok(())
    }

    fn get(&mut self, key: u32) -> Result<()> {
        let value = self.memo.get(&key).cloned().ok_or(DecodeError::MissingMemo(key))?;
        self.stack.push(value);
        Ok(())
    }
}

fn pairs(items: Vec<Value>, offset: usize) -> Result<Vec<(Value, Value)>> {
    if items.len() % 2 != 0 {
        return Err(DecodeError::malformed(offset, "odd number of dict items"));
    }
    let mut iter = items.into_iter();
    let mut out = Vec::new();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        out.push((key, value));
    }
    Ok(out)
}

fn parse_number<T: std::str::FromStr>(text: &str, offset: usize) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| DecodeError::malformed(offset, format!("bad number '{text}'")))
}

/// Decode a protocol 0 `STRING` argument: a quoted Python 2 literal.
fn unquote_string(line: &str) -> Option<Vec<u8>> {
    let quote = line.chars().next().filter(|q| *q == '\'' || *q == '"')?;
    let body = line.strip_prefix(quote)?.strip_suffix(quote)?;
    let mut out = Vec::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(u8::try_from(u32::from(c)).ok()?);
            continue;
        }
        match chars.next()? {
            'n' => out.push(b'\n'),
            'r' => out.push(b'\r'),
            't' => out.push(b'\t'),
            '0' => out.push(0),
            '\\' => out.push(b'\\'),
            '\'' => out.push(b'\''),
            '"' => out.push(b'"'),
            'x' => {
                let hex: String = chars.by_ref().take(2).collect();
                out.push(u8::from_str_radix(&hex, 16).ok()?);
            }
            _ => return None,
        }
    }
    Some(out)
}

/// Decode a protocol 0 `UNICODE` argument (raw-unicode-escape).
fn raw_unicode_unescape(bytes: &[u8]) -> Option<String> {
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let digits = match (bytes[i], bytes.get(i + 1)) {
            (b'\\', Some(b'u')) => 4,
            (b'\\', Some(b'U')) => 8,
            (b, _) => {
                out.push(char::from(b));
                i += 1;
                continue;
            }
        };
        let hex = std::str::from_utf8(bytes.get(i + 2..i + 2 + digits)?).ok()?;
        out.push(char::from_u32(u32::from_str_radix(hex, 16).ok()?)?);
        i += 2 + digits;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(bytes: &[u8]) -> Result<Value> {
        from_slice(bytes)
    }

    #[test]
    fn scalars_and_tuples() {
        // (1, 300, -2, None, True)
        let mut p = vec![PROTO, 2, MARK, BININT1, 1, BININT2];
        p.extend_from_slice(&300u16.to_le_bytes());
        p.push(BININT);
        p.extend_from_slice(&(-2i32).to_le_bytes());
        p.extend_from_slice(&[NONE, NEWTRUE, TUPLE, STOP]);
        assert_eq!(
            run(&p).unwrap(),
            Value::Tuple(vec![
                Value::Int(1),
                Value::Int(300),
                Value::Int(-2),
                Value::None,
                Value::Bool(true),
            ])
        );
    }

    #[test]
    fn long1_sign_extends() {
        let p = [PROTO, 2, LONG1, 2, 0x00, 0xff, STOP];
        assert_eq!(run(&p).unwrap(), Value::Int(-256));
    }

    #[test]
    fn protocol_zero_text_opcodes() {
        let p = b"(I7\nI01\nS'a\\x41'\nVcaf\\u00e9\nF0.5\ntp0\n.";
        let Value::Tuple(items) = run(p).unwrap() else {
            panic!("expected tuple");
        };
        assert_eq!(items[0], Value::Int(7));
        assert_eq!(items[1], Value::Bool(true));
        assert_eq!(items[2].text().unwrap(), "aA");
        assert_eq!(items[3].text().unwrap(), "café");
        assert_eq!(items[4], Value::Float(0.5));
    }

    #[test]
    fn lists_are_shared_through_the_memo() {
        // l = []; memo[0] = l; l.append(5); (l, memo[0])
        let p = [
            PROTO, 2, EMPTY_LIST, BINPUT, 0, BININT1, 5, APPEND, BINGET, 0, TUPLE2, STOP,
        ];
        let Value::Tuple(items) = run(&p).unwrap() else {
            panic!("expected tuple");
        };
        for item in &items {
            let Value::List(list) = item else {
                panic!("expected list");
            };
            assert_eq!(*list.borrow(), vec![Value::Int(5)]);
        }
    }

    #[test]
    fn unknown_global_is_rejected() {
        let p = b"\x80\x02cos\nsystem\n.";
        assert!(matches!(
            run(p),
            Err(DecodeError::UnsupportedGlobal { ref module, .. }) if module == "os"
        ));
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let p = [PROTO, 2, BININT];
        assert!(matches!(run(&p), Err(DecodeError::Truncated(_))));
        assert!(matches!(run(&[PROTO, 2, NONE]), Err(DecodeError::Truncated(_))));
    }

    #[test]
    fn tuple_without_mark_underflows() {
        assert!(matches!(run(&[TUPLE, STOP]), Err(DecodeError::MissingMark(_))));
        assert!(matches!(run(&[TUPLE2, STOP]), Err(DecodeError::StackUnderflow(_))));
    }

    #[test]
    fn codecs_encode_yields_latin1_bytes() {
        let mut p = vec![PROTO, 2, GLOBAL];
        p.extend_from_slice(b"_codecs\nencode\n");
        p.push(SHORT_BINUNICODE);
        p.push(3);
        p.extend_from_slice("\u{1}\u{ff}".as_bytes());
        p.push(SHORT_BINUNICODE);
        p.push(6);
        p.extend_from_slice(b"latin1");
        p.extend_from_slice(&[TUPLE2, REDUCE, STOP]);
        assert_eq!(run(&p).unwrap(), Value::Bytes(Rc::from(vec![1u8, 0xff])));
    }

    #[test]
    fn dtype_descriptors() {
        let d = Dtype::from_descr(">i4").unwrap();
        assert_eq!(d.kind, ElementKind::I4);
        assert_eq!(d.byte_order, ByteOrder::Big);
        assert_eq!(Dtype::from_descr("u1").unwrap().byte_order, ByteOrder::NotApplicable);
        assert!(matches!(
            Dtype::from_descr("c16"),
            Err(DecodeError::UnsupportedDtype(_))
        ));
    }

    #[test]
    fn ndarray_state_version_is_optional() {
        let dtype = Value::Dtype(shared(Dtype::from_descr("u1").unwrap()));
        let shape = Value::Tuple(vec![Value::Int(2)]);
        let data = Value::Bytes(Rc::from(vec![7u8, 9]));

        let mut versioned = NdArray::default();
        let state = Value::Tuple(vec![
            Value::Int(1),
            shape.clone(),
            dtype.clone(),
            Value::Bool(false),
            data.clone(),
        ]);
        versioned.set_state(&state, 0).unwrap();

        let mut bare = NdArray::default();
        let state = Value::Tuple(vec![shape, dtype, Value::Bool(false), data]);
        bare.set_state(&state, 0).unwrap();

        assert_eq!(versioned, bare);
        assert_eq!(bare.shape(), [2]);
        assert_eq!(bare.to_u8().unwrap(), vec![7, 9]);

        let short = Value::Tuple(vec![Value::Int(1), Value::Int(2)]);
        assert!(NdArray::default().set_state(&short, 0).is_err());
    }

    #[test]
    fn protocol_five_buffers_are_unsupported() {
        // BYTEARRAY8, as written for in-band pickle buffers
        let p = [PROTO, 5, 0x96, 0, 0, 0, 0, 0, 0, 0, 0, STOP];
        assert!(matches!(
            run(&p),
            Err(DecodeError::UnsupportedOpcode { opcode: 0x96, offset: 2 })
        ));
    }
}
