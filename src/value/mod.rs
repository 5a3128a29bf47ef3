pub mod ops;
pub mod sip;

use std::cell::RefCell;
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::rc::Rc;

use crate::gc::GcHeader;
use crate::symtab::ids;
use crate::vm::{OpResult, Raise, Vm};

/// One shared closure cell. Cells are owned by a backing closure and seen
/// by every sibling closure; the strong count of the `Rc` is the cell's own
/// lifetime count.
pub type CellRef = Rc<RefCell<Value>>;

pub type ForeignFn = fn(&mut Vm, u16, &[u16]) -> OpResult<()>;

/// A runtime value. Scalars are carried inline; heap payloads are shared
/// owners, so plain assignment between registers is a clone of the handle
/// (the refcount bump/drop of the original design).
#[derive(Clone, Default)]
pub enum Value {
    /// A register that has not been given a value yet. Optional-argument
    /// dispatch and the GC's register invalidation both rely on this.
    #[default]
    Unset,
    Unit,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(Rc<String>),
    ByteString(Rc<Vec<u8>>),
    Function(Rc<FunctionVal>),
    Dynamic(Rc<DynamicVal>),
    List(Rc<ListVal>),
    Hash(Rc<HashVal>),
    Tuple(Rc<ListVal>),
    Instance(Rc<InstanceVal>),
    Variant(Rc<VariantVal>),
    File(Rc<FileVal>),
    Foreign(Rc<ForeignVal>),
}

/// The backing closure: a flat array of cells shared by every inner
/// function closing over one outer activation.
#[derive(Debug)]
pub struct ClosureData {
    pub cells: RefCell<Vec<CellRef>>,
}

impl ClosureData {
    pub fn new(count: u16) -> Rc<ClosureData> {
        let cells = (0..count)
            .map(|_| Rc::new(RefCell::new(Value::Unset)))
            .collect();
        Rc::new(ClosureData { cells: RefCell::new(cells) })
    }
}

/// A function value. Native and foreign functions are distinguished only by
/// whether `code` is present.
pub struct FunctionVal {
    pub gc: GcHeader,
    pub name: String,
    /// Containing class name, or None for plain functions.
    pub class_name: Option<String>,
    pub module_path: String,
    pub foreign: Option<ForeignFn>,
    pub code: Option<Rc<Vec<u16>>>,
    pub reg_count: u16,
    pub upvalue_count: u16,
    /// The backing closure this copy shares, set by closure_new and
    /// closure_function at run time.
    pub closure: RefCell<Option<Rc<ClosureData>>>,
}

impl FunctionVal {
    pub fn is_native(&self) -> bool {
        self.code.is_some()
    }

    /// A shallow copy sharing code but not closure state. closure_new and
    /// closure_function build these so each activation sees fresh cells.
    pub fn copy_with_closure(&self, closure: Rc<ClosureData>) -> FunctionVal {
        FunctionVal {
            gc: GcHeader::new(),
            name: self.name.clone(),
            class_name: self.class_name.clone(),
            module_path: self.module_path.clone(),
            foreign: self.foreign,
            code: self.code.clone(),
            reg_count: self.reg_count,
            upvalue_count: self.upvalue_count,
            closure: RefCell::new(Some(closure)),
        }
    }

    /// The name shown in tracebacks: `Class::name` for methods.
    pub fn qualified_name(&self) -> String {
        match &self.class_name {
            Some(cls) => format!("{}::{}", cls, self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Debug for FunctionVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionVal")
            .field("name", &self.name)
            .field("native", &self.is_native())
            .field("reg_count", &self.reg_count)
            .finish()
    }
}

#[derive(Debug)]
pub struct DynamicVal {
    pub gc: GcHeader,
    pub inner: RefCell<Value>,
}

/// Lists and tuples share a payload; the emitter keeps their types apart.
#[derive(Debug)]
pub struct ListVal {
    pub gc: GcHeader,
    pub elems: RefCell<Vec<Value>>,
}

#[derive(Debug)]
pub struct HashElem {
    pub key_hash: u64,
    pub key: Value,
    pub value: Value,
}

#[derive(Debug)]
pub struct HashVal {
    pub gc: GcHeader,
    pub elems: RefCell<Vec<HashElem>>,
}

#[derive(Debug)]
pub struct InstanceVal {
    pub gc: GcHeader,
    /// The true (most derived) class of this instance.
    pub class_id: u16,
    pub values: RefCell<Vec<Value>>,
}

#[derive(Debug)]
pub struct VariantVal {
    pub gc: GcHeader,
    pub enum_id: u16,
    /// Position of this variant within its enum.
    pub variant_id: u16,
    pub values: RefCell<Vec<Value>>,
}

#[derive(Debug)]
pub enum FileTarget {
    Stdin,
    Stdout,
    Stderr,
    Handle(File),
}

/// A wrapped host file. The handle drops with the last reference, except
/// for the three builtin streams which are never closed.
#[derive(Debug)]
pub struct FileVal {
    pub inner: RefCell<Option<FileTarget>>,
    pub read_ok: bool,
    pub write_ok: bool,
    pub is_builtin: bool,
}

impl FileVal {
    pub fn stdout() -> Rc<FileVal> {
        Rc::new(FileVal {
            inner: RefCell::new(Some(FileTarget::Stdout)),
            read_ok: false,
            write_ok: true,
            is_builtin: true,
        })
    }

    pub fn close(&self) {
        if !self.is_builtin {
            *self.inner.borrow_mut() = None;
        }
    }

    pub fn write_str(&self, s: &str) -> std::io::Result<()> {
        match &mut *self.inner.borrow_mut() {
            Some(FileTarget::Stdout) => {
                print!("{}", s);
                std::io::stdout().flush()
            }
            Some(FileTarget::Stderr) => {
                eprint!("{}", s);
                Ok(())
            }
            Some(FileTarget::Handle(f)) => f.write_all(s.as_bytes()),
            Some(FileTarget::Stdin) | None => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "file not open for writing",
            )),
        }
    }

    pub fn read_to_string(&self) -> std::io::Result<String> {
        let mut out = String::new();
        match &mut *self.inner.borrow_mut() {
            Some(FileTarget::Stdin) => {
                std::io::stdin().read_to_string(&mut out)?;
            }
            Some(FileTarget::Handle(f)) => {
                f.read_to_string(&mut out)?;
            }
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "file not open for reading",
                ))
            }
        }
        Ok(out)
    }
}

/// Payload for values owned by a foreign module.
pub struct ForeignVal {
    pub class_id: u16,
    pub data: Rc<dyn std::any::Any>,
}

impl fmt::Debug for ForeignVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignVal").field("class_id", &self.class_id).finish()
    }
}

impl Value {
    /// The dense class id the VM uses for fast checks.
    pub fn class_id(&self) -> u16 {
        match self {
            Value::Unset | Value::Unit => ids::UNIT,
            Value::Boolean(_) => ids::BOOLEAN,
            Value::Integer(_) => ids::INTEGER,
            Value::Double(_) => ids::DOUBLE,
            Value::String(_) => ids::STRING,
            Value::ByteString(_) => ids::BYTESTRING,
            Value::Function(_) => ids::FUNCTION,
            Value::Dynamic(_) => ids::DYNAMIC,
            Value::List(_) => ids::LIST,
            Value::Hash(_) => ids::HASH,
            Value::Tuple(_) => ids::TUPLE,
            Value::Instance(v) => v.class_id,
            Value::Variant(v) => v.enum_id,
            Value::File(_) => ids::FILE,
            Value::Foreign(v) => v.class_id,
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, Value::Unset)
    }

    /// Whether the GC's mark phase should look inside this value at all.
    /// Scalars and flat strings can never reach a tagged payload.
    pub fn is_gc_interesting(&self) -> bool {
        matches!(
            self,
            Value::Function(_)
                | Value::Dynamic(_)
                | Value::List(_)
                | Value::Hash(_)
                | Value::Tuple(_)
                | Value::Instance(_)
                | Value::Variant(_)
        )
    }

    pub fn as_integer(&self) -> i64 {
        match self {
            Value::Integer(i) => *i,
            _ => 0,
        }
    }

    pub fn as_boolean(&self) -> bool {
        match self {
            Value::Boolean(b) => *b,
            Value::Integer(i) => *i != 0,
            _ => false,
        }
    }

    pub fn as_function(&self) -> OpResult<&Rc<FunctionVal>> {
        match self {
            Value::Function(f) => Ok(f),
            _ => Err(Box::new(Raise {
                class_id: ids::RUNTIMEERROR,
                message: "Value is not a function.".to_string(),
                raised_value: None,
            })),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unset => write!(f, "<unset>"),
            Value::Unit => write!(f, "unit"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{}", s),
            Value::ByteString(b) => write!(f, "<bytestring of {} bytes>", b.len()),
            Value::Function(func) => write!(f, "<function {}>", func.qualified_name()),
            Value::Dynamic(d) => write!(f, "Dynamic({})", d.inner.borrow()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.elems.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Tuple(items) => {
                write!(f, "<[")?;
                for (i, item) in items.elems.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]>")
            }
            Value::Hash(h) => {
                write!(f, "[")?;
                let elems = h.elems.borrow();
                if elems.is_empty() {
                    return write!(f, "=> ]");
                }
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} => {}", elem.key, elem.value)?;
                }
                write!(f, "]")
            }
            Value::Instance(inst) => write!(f, "<instance of class {}>", inst.class_id),
            Value::Variant(v) => {
                write!(f, "<variant {} of enum {}>", v.variant_id, v.enum_id)
            }
            Value::File(_) => write!(f, "<file>"),
            Value::Foreign(v) => write!(f, "<foreign of class {}>", v.class_id),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}
