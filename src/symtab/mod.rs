pub mod ids;

use std::collections::HashMap;
use std::rc::Rc;

use bitflags::bitflags;

use crate::types::TypeRef;
use crate::value::{ForeignFn, FunctionVal, Value, VariantVal};
use crate::vm::ErrorKind;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassFlags: u16 {
        const VALID_HASH_KEY  = 0x0001;
        const VALID_OPTARG    = 0x0002;
        const IS_ENUM         = 0x0004;
        const IS_VARIANT      = 0x0008;
        const ENUM_IS_SCOPED  = 0x0010;
        const EMPTY_VARIANT   = 0x0020;
        const GC_TAGGED       = 0x0040;
        const GC_SPECULATIVE  = 0x0080;
    }
}

#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub ty: TypeRef,
    pub index: u16,
}

#[derive(Debug, Clone)]
pub struct Class {
    pub id: u16,
    pub name: String,
    pub flags: ClassFlags,
    pub parent: Option<u16>,
    pub generic_count: u16,
    pub properties: Vec<Property>,
    /// Variant class ids, in declaration order, if this is an enum.
    pub variants: Vec<u16>,
    /// Position within the parent enum, if this is a variant.
    pub variant_id: u16,
    /// The build type of a variant's arguments, possibly generic.
    pub variant_args: Vec<TypeRef>,
    pub module: u16,
}

#[derive(Debug, Clone)]
pub enum VarKind {
    Global { spot: u16 },
    Local { reg: u16, depth: u16 },
    /// A globally defined function; the value lives in the readonly table.
    ReadonlyFunc { spot: u16, foreign: bool },
}

#[derive(Debug, Clone)]
pub struct Var {
    pub name: String,
    pub ty: TypeRef,
    pub kind: VarKind,
    /// Set on nested defines so any reference to them is routed through
    /// closure_function and gets fresh cells.
    pub needs_closure: bool,
}

pub type VarId = usize;

#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub path: String,
}

/// The symbol table: classes, vars, modules, and the readonly table of
/// interned constants (strings, defined functions, empty variants) that
/// opcodes load by index.
pub struct Symtab {
    pub classes: Vec<Class>,
    pub vars: Vec<Var>,
    pub modules: Vec<Module>,
    pub readonly: Vec<Value>,
    string_spots: HashMap<String, u16>,
    integer_spots: HashMap<i64, u16>,
    double_spots: Vec<(f64, u16)>,
    empty_variant_spots: HashMap<u16, u16>,
    pub main_function: Option<Rc<FunctionVal>>,
    /// Count of global registers __main__ owns.
    pub global_count: u16,
}

impl Symtab {
    pub fn new() -> Self {
        let mut symtab = Symtab {
            classes: Vec::new(),
            vars: Vec::new(),
            modules: vec![Module {
                name: "builtin".to_string(),
                path: "[builtin]".to_string(),
            }],
            readonly: Vec::new(),
            string_spots: HashMap::new(),
            integer_spots: HashMap::new(),
            double_spots: Vec::new(),
            empty_variant_spots: HashMap::new(),
            main_function: None,
            global_count: 0,
        };

        symtab.register_builtin_classes();
        symtab
    }

    fn add_class(&mut self, name: &str, flags: ClassFlags, parent: Option<u16>) -> u16 {
        let id = self.classes.len() as u16;
        self.classes.push(Class {
            id,
            name: name.to_string(),
            flags,
            parent,
            generic_count: 0,
            properties: Vec::new(),
            variants: Vec::new(),
            variant_id: 0,
            variant_args: Vec::new(),
            module: 0,
        });
        id
    }

    /// Builtin registration. The order here must match `ids`.
    fn register_builtin_classes(&mut self) {
        let hash_key = ClassFlags::VALID_HASH_KEY | ClassFlags::VALID_OPTARG;
        let plain = ClassFlags::VALID_OPTARG;
        let speculative = ClassFlags::GC_SPECULATIVE;

        self.add_class("Integer", hash_key, None);
        self.add_class("Double", hash_key, None);
        self.add_class("String", hash_key, None);
        self.add_class("Boolean", plain, None);
        self.add_class("ByteString", plain, None);
        self.add_class("Function", ClassFlags::GC_TAGGED, None);
        self.add_class("Dynamic", speculative, None);
        self.add_class("List", speculative, None);
        self.add_class("Hash", speculative, None);
        self.add_class("Tuple", speculative, None);
        self.add_class("File", ClassFlags::empty(), None);
        self.add_class("Unit", ClassFlags::empty(), None);

        self.add_class("$generic", ClassFlags::empty(), None);
        self.add_class("?", ClassFlags::empty(), None);
        self.add_class("$optarg", ClassFlags::empty(), None);
        self.add_class("$scoop", ClassFlags::empty(), None);

        let option = self.add_class("Option", ClassFlags::IS_ENUM | speculative, None);
        let some = self.add_class(
            "Some",
            ClassFlags::IS_VARIANT | speculative,
            Some(option),
        );
        let none = self.add_class(
            "None",
            ClassFlags::IS_VARIANT | ClassFlags::EMPTY_VARIANT,
            Some(option),
        );
        self.classes[option as usize].generic_count = 1;
        self.classes[option as usize].variants = vec![some, none];
        self.classes[some as usize].variant_id = 0;
        self.classes[none as usize].variant_id = 1;

        let exception = self.add_class("Exception", ClassFlags::empty(), None);
        for name in [
            "IOError",
            "KeyError",
            "ValueError",
            "RuntimeError",
            "IndexError",
            "DivisionByZeroError",
            "FormatError",
            "BadTypecastError",
            "RecursionError",
        ] {
            self.add_class(name, ClassFlags::empty(), Some(exception));
        }
    }

    pub fn class(&self, id: u16) -> &Class {
        &self.classes[id as usize]
    }

    pub fn class_name(&self, id: u16) -> &str {
        &self.classes[id as usize].name
    }

    pub fn find_class(&self, name: &str) -> Option<u16> {
        self.classes.iter().find(|c| c.name == name).map(|c| c.id)
    }

    /// The subtype chain check: does 'left' accept values of 'right'?
    pub fn class_greater_eq(&self, left: u16, right: u16) -> bool {
        if left == right {
            return true;
        }

        let mut iter = self.classes[right as usize].parent;
        while let Some(parent) = iter {
            if parent == left {
                return true;
            }
            iter = self.classes[parent as usize].parent;
        }

        false
    }

    /// Total property count for an instance, including inherited slots.
    pub fn total_prop_count(&self, class_id: u16) -> u16 {
        let mut count = 0;
        let mut iter = Some(class_id);
        while let Some(id) = iter {
            let cls = &self.classes[id as usize];
            count += cls.properties.len() as u16;
            iter = cls.parent;
        }
        count
    }

    pub fn add_module(&mut self, name: &str, path: &str) -> u16 {
        let id = self.modules.len() as u16;
        self.modules.push(Module { name: name.to_string(), path: path.to_string() });
        id
    }

    pub fn add_var(&mut self, var: Var) -> VarId {
        self.vars.push(var);
        self.vars.len() - 1
    }

    pub fn var(&self, id: VarId) -> &Var {
        &self.vars[id]
    }

    /// Intern a string literal in the readonly table.
    pub fn readonly_string(&mut self, value: &str) -> u16 {
        if let Some(&spot) = self.string_spots.get(value) {
            return spot;
        }

        let spot = self.readonly.len() as u16;
        self.readonly.push(Value::String(Rc::new(value.to_string())));
        self.string_spots.insert(value.to_string(), spot);
        spot
    }

    /// Intern an integer too large for the load_integer immediate.
    pub fn readonly_integer(&mut self, value: i64) -> u16 {
        if let Some(&spot) = self.integer_spots.get(&value) {
            return spot;
        }

        let spot = self.readonly.len() as u16;
        self.readonly.push(Value::Integer(value));
        self.integer_spots.insert(value, spot);
        spot
    }

    pub fn readonly_double(&mut self, value: f64) -> u16 {
        if let Some(&(_, spot)) = self.double_spots.iter().find(|(v, _)| *v == value) {
            return spot;
        }

        let spot = self.readonly.len() as u16;
        self.readonly.push(Value::Double(value));
        self.double_spots.push((value, spot));
        spot
    }

    /// Find a property by its flat index, walking the parent chain.
    pub fn find_property(&self, class_id: u16, index: u16) -> Option<&Property> {
        let mut iter = Some(class_id);
        while let Some(id) = iter {
            let cls = &self.classes[id as usize];
            if let Some(prop) = cls.properties.iter().find(|p| p.index == index) {
                return Some(prop);
            }
            iter = cls.parent;
        }
        None
    }

    /// Empty variants have a single canonical value, interned here.
    pub fn readonly_empty_variant(&mut self, variant_class: u16) -> u16 {
        if let Some(&spot) = self.empty_variant_spots.get(&variant_class) {
            return spot;
        }

        let cls = &self.classes[variant_class as usize];
        let value = Value::Variant(Rc::new(VariantVal {
            gc: Default::default(),
            enum_id: cls.parent.unwrap_or(variant_class),
            variant_id: cls.variant_id,
            values: Default::default(),
        }));

        let spot = self.readonly.len() as u16;
        self.readonly.push(value);
        self.empty_variant_spots.insert(variant_class, spot);
        spot
    }

    /// Reserve a readonly spot for a function that will be filled in when
    /// its block finishes.
    pub fn reserve_function_spot(&mut self) -> u16 {
        let spot = self.readonly.len() as u16;
        self.readonly.push(Value::Unset);
        spot
    }

    pub fn set_readonly(&mut self, spot: u16, value: Value) {
        self.readonly[spot as usize] = value;
    }

    /// Register a foreign module: a name, a path, and a function table.
    /// Each function becomes a readonly var callable by name.
    pub fn register_module(
        &mut self,
        name: &str,
        path: &str,
        functions: &[(&str, ForeignFn, TypeRef)],
    ) -> u16 {
        let module = self.add_module(name, path);

        for (fn_name, func, ty) in functions {
            let spot = self.readonly.len() as u16;
            self.readonly.push(Value::Function(Rc::new(FunctionVal {
                gc: Default::default(),
                name: fn_name.to_string(),
                class_name: None,
                module_path: path.to_string(),
                foreign: Some(*func),
                code: None,
                reg_count: 0,
                upvalue_count: 0,
                closure: Default::default(),
            })));

            self.add_var(Var {
                name: fn_name.to_string(),
                ty: ty.clone(),
                kind: VarKind::ReadonlyFunc { spot, foreign: true },
                needs_closure: false,
            });
        }

        module
    }

    pub fn find_var(&self, name: &str) -> Option<VarId> {
        self.vars.iter().rposition(|v| v.name == name)
    }
}

impl Default for Symtab {
    fn default() -> Self {
        Symtab::new()
    }
}

impl ErrorKind {
    pub fn class_id(self) -> u16 {
        match self {
            ErrorKind::DivisionByZeroError => ids::DIVISIONBYZEROERROR,
            ErrorKind::IndexError => ids::INDEXERROR,
            ErrorKind::KeyError => ids::KEYERROR,
            ErrorKind::ValueError => ids::VALUEERROR,
            ErrorKind::RuntimeError => ids::RUNTIMEERROR,
            ErrorKind::IOError => ids::IOERROR,
            ErrorKind::FormatError => ids::FORMATERROR,
            ErrorKind::BadTypecastError => ids::BADTYPECASTERROR,
            ErrorKind::RecursionError => ids::RECURSIONERROR,
        }
    }
}
