pub mod stats;

use std::cell::Cell;
use std::rc::{Rc, Weak};

pub use stats::GcStats;

use crate::value::{DynamicVal, FunctionVal, HashVal, InstanceVal, ListVal, Value, VariantVal};

/// Pass color stored inside every payload that can participate in a cycle.
/// A payload marked with the current pass number is reachable; -1 means the
/// cycle destructor already ran for it.
#[derive(Debug)]
pub struct GcHeader {
    last_pass: Cell<i32>,
}

impl GcHeader {
    pub fn new() -> Self {
        GcHeader { last_pass: Cell::new(0) }
    }

    pub fn last_pass(&self) -> i32 {
        self.last_pass.get()
    }
}

impl Default for GcHeader {
    fn default() -> Self {
        GcHeader::new()
    }
}

/// The collector's handle on one registered payload. The payload itself is
/// owned by registers and containers; when the last strong owner drops, the
/// weak side here goes dead, which is the deref path telling an in-flight
/// sweep not to revisit it.
#[derive(Debug, Clone)]
pub enum GcObject {
    Function(Weak<FunctionVal>),
    Dynamic(Weak<DynamicVal>),
    List(Weak<ListVal>),
    Hash(Weak<HashVal>),
    Tuple(Weak<ListVal>),
    Instance(Weak<InstanceVal>),
    Variant(Weak<VariantVal>),
}

impl GcObject {
    pub fn from_value(value: &Value) -> Option<GcObject> {
        match value {
            Value::Function(v) => Some(GcObject::Function(Rc::downgrade(v))),
            Value::Dynamic(v) => Some(GcObject::Dynamic(Rc::downgrade(v))),
            Value::List(v) => Some(GcObject::List(Rc::downgrade(v))),
            Value::Hash(v) => Some(GcObject::Hash(Rc::downgrade(v))),
            Value::Tuple(v) => Some(GcObject::Tuple(Rc::downgrade(v))),
            Value::Instance(v) => Some(GcObject::Instance(Rc::downgrade(v))),
            Value::Variant(v) => Some(GcObject::Variant(Rc::downgrade(v))),
            _ => None,
        }
    }

    fn header(&self) -> Option<HeaderHold> {
        match self {
            GcObject::Function(w) => w.upgrade().map(HeaderHold::Function),
            GcObject::Dynamic(w) => w.upgrade().map(HeaderHold::Dynamic),
            GcObject::List(w) | GcObject::Tuple(w) => w.upgrade().map(HeaderHold::List),
            GcObject::Hash(w) => w.upgrade().map(HeaderHold::Hash),
            GcObject::Instance(w) => w.upgrade().map(HeaderHold::Instance),
            GcObject::Variant(w) => w.upgrade().map(HeaderHold::Variant),
        }
    }
}

/// Strong hold on a payload for the duration of one sweep phase.
enum HeaderHold {
    Function(Rc<FunctionVal>),
    Dynamic(Rc<DynamicVal>),
    List(Rc<ListVal>),
    Hash(Rc<HashVal>),
    Instance(Rc<InstanceVal>),
    Variant(Rc<VariantVal>),
}

impl HeaderHold {
    fn gc(&self) -> &GcHeader {
        match self {
            HeaderHold::Function(v) => &v.gc,
            HeaderHold::Dynamic(v) => &v.gc,
            HeaderHold::List(v) => &v.gc,
            HeaderHold::Hash(v) => &v.gc,
            HeaderHold::Instance(v) => &v.gc,
            HeaderHold::Variant(v) => &v.gc,
        }
    }

    /// The cycle destructor: drop every child reference this payload holds
    /// so any cycle through it unravels. The payload allocation itself goes
    /// away when its last owner drops.
    fn destroy_cycle(&self) {
        match self {
            HeaderHold::Function(v) => {
                if let Some(closure) = v.closure.borrow_mut().take() {
                    closure.cells.borrow_mut().clear();
                }
            }
            HeaderHold::Dynamic(v) => *v.inner.borrow_mut() = Value::Unset,
            HeaderHold::List(v) => v.elems.borrow_mut().clear(),
            HeaderHold::Hash(v) => v.elems.borrow_mut().clear(),
            HeaderHold::Instance(v) => v.values.borrow_mut().clear(),
            HeaderHold::Variant(v) => v.values.borrow_mut().clear(),
        }
        self.gc().last_pass.set(-1);
    }
}

struct GcEntry {
    obj: GcObject,
}

/// The cycle collector. Reference counting (shared ownership) reclaims
/// acyclic garbage on its own; this exists solely to find and break cycles
/// among the registered payloads.
pub struct Gc {
    entries: Vec<GcEntry>,
    pass: i32,
    threshold: usize,
    stats: GcStats,
    debug: bool,
}

impl Gc {
    pub fn new(threshold: usize, debug: bool) -> Self {
        Gc {
            entries: Vec::new(),
            pass: 0,
            threshold,
            stats: GcStats::default(),
            debug,
        }
    }

    pub fn live_count(&self) -> usize {
        self.entries.len()
    }

    pub fn needs_collection(&self) -> bool {
        self.entries.len() >= self.threshold
    }

    pub fn stats(&self) -> GcStats {
        self.stats.clone()
    }

    /// Register a freshly built payload. The caller runs a collection
    /// first if the threshold was hit (the new payload may not be rooted in
    /// a register yet, so it must not be visible to that pass).
    pub fn register(&mut self, obj: GcObject) {
        if let Some(hold) = obj.header() {
            hold.gc().last_pass.set(self.pass);
        }
        self.entries.push(GcEntry { obj });
        self.stats.total_allocated += 1;
        self.stats.current_allocated += 1;
    }

    /// Mark every tagged payload reachable from 'value' with the current
    /// pass. The pass number doubles as the visited set, which is what
    /// keeps this walk finite on cyclic graphs.
    fn mark_value(&self, value: &Value) {
        let pass = self.pass;
        match value {
            Value::Function(v) => {
                if v.gc.last_pass.get() == pass {
                    return;
                }
                v.gc.last_pass.set(pass);
                if let Some(closure) = &*v.closure.borrow() {
                    for cell in closure.cells.borrow().iter() {
                        self.mark_value(&cell.borrow());
                    }
                }
            }
            Value::Dynamic(v) => {
                if v.gc.last_pass.get() == pass {
                    return;
                }
                v.gc.last_pass.set(pass);
                self.mark_value(&v.inner.borrow());
            }
            Value::List(v) | Value::Tuple(v) => {
                if v.gc.last_pass.get() == pass {
                    return;
                }
                v.gc.last_pass.set(pass);
                for item in v.elems.borrow().iter() {
                    self.mark_value(item);
                }
            }
            Value::Hash(v) => {
                if v.gc.last_pass.get() == pass {
                    return;
                }
                v.gc.last_pass.set(pass);
                for elem in v.elems.borrow().iter() {
                    self.mark_value(&elem.key);
                    self.mark_value(&elem.value);
                }
            }
            Value::Instance(v) => {
                if v.gc.last_pass.get() == pass {
                    return;
                }
                v.gc.last_pass.set(pass);
                for item in v.values.borrow().iter() {
                    self.mark_value(item);
                }
            }
            Value::Variant(v) => {
                if v.gc.last_pass.get() == pass {
                    return;
                }
                v.gc.last_pass.set(pass);
                for item in v.values.borrow().iter() {
                    self.mark_value(item);
                }
            }
            _ => {}
        }
    }

    /// Run one full collection over the register file. 'used' is the
    /// current live register count; registers past it are stale and only
    /// scanned for invalidation.
    pub fn collect(&mut self, regs: &mut [Value], used: usize) -> usize {
        self.pass += 1;

        // Stage 1: mark from every live register.
        for reg in regs[..used].iter() {
            if reg.is_gc_interesting() {
                self.mark_value(reg);
            }
        }

        // Stage 2: run the cycle destructor on every entry the mark pass
        // missed. Entries stay in place until all destructors have run, so
        // a second reach through an unvisited owner is a no-op.
        for entry in self.entries.iter() {
            if let Some(hold) = entry.obj.header() {
                let last = hold.gc().last_pass.get();
                if last != self.pass && last != -1 {
                    hold.destroy_cycle();
                }
            }
        }

        // Stage 3: stale registers beyond the used range may still hold a
        // destroyed payload. Clear them so later register prep never sees
        // freed state.
        for reg in regs[used..].iter_mut() {
            let dead = match GcObject::from_value(reg) {
                Some(obj) => match obj.header() {
                    Some(hold) => hold.gc().last_pass.get() == -1,
                    None => false,
                },
                None => false,
            };
            if dead {
                *reg = Value::Unset;
            }
        }

        // Stage 4: reap. Entries whose payload died (by deref or by cycle
        // destruction) leave the live list.
        let before = self.entries.len();
        self.entries.retain(|entry| match entry.obj.header() {
            Some(hold) => hold.gc().last_pass.get() != -1,
            None => false,
        });

        let collected = before - self.entries.len();
        self.stats.total_freed += collected;
        self.stats.current_allocated = self.entries.len();
        self.stats.collections_performed += 1;

        if self.debug {
            println!(
                "GC: pass {} collected {} entries, {} remaining",
                self.pass, collected, self.entries.len()
            );
        }

        collected
    }
}
