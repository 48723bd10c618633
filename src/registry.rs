use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::object::ObjRef;
use crate::store::FragmentRef;

pub type OnAddHook = Box<dyn Fn(&ObjRef, &str, usize, &str)>;
pub type OnCallHook = Box<dyn Fn(Vec<FragmentRef>, Option<&str>) -> Vec<FragmentRef>>;

/// Declaration of one event name on one type: parameter names in binding
/// order, documentation, and the optional add/call hooks.
pub struct EventTypeDecl {
    pub params: Vec<String>,
    pub doc: String,
    pub on_add: Option<OnAddHook>,
    pub on_call: Option<OnCallHook>,
}

impl EventTypeDecl {
    pub fn new(params: &[&str], doc: &str) -> Self {
        Self {
            params: params.iter().map(|param| param.to_string()).collect(),
            doc: doc.to_string(),
            on_add: None,
            on_call: None,
        }
    }

    pub fn with_on_add(mut self, hook: impl Fn(&ObjRef, &str, usize, &str) + 'static) -> Self {
        self.on_add = Some(Box::new(hook));
        self
    }

    pub fn with_on_call(
        mut self,
        hook: impl Fn(Vec<FragmentRef>, Option<&str>) -> Vec<FragmentRef> + 'static,
    ) -> Self {
        self.on_call = Some(Box::new(hook));
        self
    }
}

enum Entry {
    Declared(Rc<EventTypeDecl>),
    // Hides the name from this type and its descendants during resolution.
    Invalidate,
}

pub type ResolvedTypes = Rc<HashMap<String, Rc<EventTypeDecl>>>;

/// Per-type event declarations plus the ancestor graph they resolve through.
/// Populated by a registration step at startup; resolutions are cached until
/// the next registration call.
#[derive(Default)]
pub struct TypeRegistry {
    parents: HashMap<String, Vec<String>>,
    declared: HashMap<String, HashMap<String, Entry>>,
    cache: RefCell<HashMap<String, ResolvedTypes>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_parents(&mut self, type_id: &str, parents: &[&str]) {
        self.parents
            .insert(type_id.to_string(), parents.iter().map(|parent| parent.to_string()).collect());
        self.cache.borrow_mut().clear();
    }

    pub fn declare(&mut self, type_id: &str, name: &str, decl: EventTypeDecl) {
        self.declared
            .entry(type_id.to_string())
            .or_default()
            .insert(name.to_string(), Entry::Declared(Rc::new(decl)));
        self.cache.borrow_mut().clear();
    }

    pub fn invalidate(&mut self, type_id: &str, name: &str) {
        self.declared
            .entry(type_id.to_string())
            .or_default()
            .insert(name.to_string(), Entry::Invalidate);
        self.cache.borrow_mut().clear();
    }

    /// Event declarations visible on `type_id`. Breadth-first over the
    /// ancestor graph: the nearest declaration of a name wins, and an
    /// invalidate entry hides the name from every farther ancestor. Each type
    /// is visited once, so diamonds and cycles in the parent graph are
    /// harmless.
    pub fn resolve(&self, type_id: &str) -> ResolvedTypes {
        if let Some(hit) = self.cache.borrow().get(type_id) {
            return hit.clone();
        }

        let mut resolved: HashMap<String, Rc<EventTypeDecl>> = HashMap::new();
        let mut invalid: HashSet<String> = HashSet::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue = VecDeque::new();
        seen.insert(type_id.to_string());
        queue.push_back(type_id.to_string());
        while let Some(current) = queue.pop_front() {
            if let Some(names) = self.declared.get(&current) {
                for (name, entry) in names {
                    if invalid.contains(name) {
                        continue;
                    }
                    match entry {
                        Entry::Invalidate => {
                            invalid.insert(name.clone());
                        }
                        Entry::Declared(decl) => {
                            resolved.entry(name.clone()).or_insert_with(|| decl.clone());
                        }
                    }
                }
            }
            if let Some(parents) = self.parents.get(&current) {
                for parent in parents {
                    // Revisits cannot change the outcome; skipping them keeps
                    // cyclic or heavily diamonded graphs from looping.
                    if seen.insert(parent.clone()) {
                        queue.push_back(parent.clone());
                    }
                }
            }
        }

        let resolved = Rc::new(resolved);
        self.cache.borrow_mut().insert(type_id.to_string(), resolved.clone());
        resolved
    }
}
